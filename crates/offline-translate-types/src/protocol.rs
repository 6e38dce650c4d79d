//! Channel protocol between the caller side and the compute worker.
//!
//! Every message is an envelope `{ id, type, payload }`. The `id` is the
//! correlation id of the translation request it belongs to (or of the
//! `init`/`ping` that triggered it). Over a process boundary envelopes are
//! written as JSON Lines, one envelope per line.

use serde::{Deserialize, Serialize};

use crate::error::TranslateError;

/// Envelope sent from the caller side to the worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerRequest {
    pub id: String,
    #[serde(flatten)]
    pub command: WorkerCommand,
}

/// Caller → worker message kinds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// First message on a fresh channel. Answered with `ready`.
    Init(WorkerSettings),
    /// Translate one text. Answered with `progress`* then `result` or `error`.
    Translate(TranslatePayload),
    /// Cancel the translation whose correlation id equals this envelope's id.
    /// Acknowledged with an `error` envelope of kind `CANCELLED`.
    Cancel,
    /// Liveness check. Answered with `pong`.
    Ping,
    /// Stop accepting work, cancel running jobs and exit the message loop.
    Shutdown,
}

impl WorkerRequest {
    pub fn new(id: impl Into<String>, command: WorkerCommand) -> Self {
        Self {
            id: id.into(),
            command,
        }
    }
}

/// Envelope sent from the worker to the caller side.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerResponse {
    pub id: String,
    #[serde(flatten)]
    pub payload: WorkerPayload,
}

/// Worker → caller message kinds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WorkerPayload {
    Result(TranslationOutput),
    Error(TranslateError),
    Progress(ProgressPayload),
    Ready(WorkerCapabilities),
    Pong,
}

impl WorkerPayload {
    /// Wire name of the message kind, for logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            WorkerPayload::Result(_) => "result",
            WorkerPayload::Error(_) => "error",
            WorkerPayload::Progress(_) => "progress",
            WorkerPayload::Ready(_) => "ready",
            WorkerPayload::Pong => "pong",
        }
    }
}

impl WorkerResponse {
    pub fn ok(id: impl Into<String>, payload: WorkerPayload) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }

    pub fn error(id: impl Into<String>, error: TranslateError) -> Self {
        Self {
            id: id.into(),
            payload: WorkerPayload::Error(error),
        }
    }

    pub fn progress(
        id: impl Into<String>,
        kind: ProgressKind,
        progress: u8,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            payload: WorkerPayload::Progress(ProgressPayload {
                kind,
                progress: progress.min(100),
                message: message.into(),
            }),
        }
    }
}

/// Options the worker needs to set up its model cache.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSettings {
    pub cache_models: bool,
    pub use_quantized: bool,
    pub max_cache_size: usize,
    /// Upper bound on translations the caller will run at once.
    pub max_concurrency: usize,
}

/// Capability summary carried by `ready`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCapabilities {
    pub supported_languages: Vec<String>,
    pub max_concurrency: usize,
    pub version: String,
}

/// Payload of a `translate` envelope.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TranslatePayload {
    pub text: String,
    pub source_lang: String,
    pub target_lang: String,
    #[serde(default)]
    pub options: TranslateOptions,
}

/// Per-request options supplied by the caller.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TranslateOptions {
    /// Maximum output length, in words.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub decoding: DecodingParams,
    /// Overrides the service-wide request timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Higher is served first. Defaults to 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

/// Decoding knobs forwarded untouched to the model.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecodingParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_beams: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f32>,
}

/// Payload of a `result` envelope.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TranslationOutput {
    pub translated_text: String,
    /// Wall-clock milliseconds spent in the worker.
    #[serde(rename = "processingTime")]
    pub processing_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// What a progress event is measuring.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressKind {
    ModelLoading,
    Translating,
}

/// Payload of a `progress` envelope.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProgressPayload {
    #[serde(rename = "type")]
    pub kind: ProgressKind,
    /// Percentage in `[0, 100]`.
    pub progress: u8,
    pub message: String,
}

/// Progress as delivered to caller-side listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub request_id: String,
    pub kind: ProgressKind,
    pub progress: u8,
    pub message: String,
}

impl ProgressEvent {
    pub fn from_payload(request_id: impl Into<String>, payload: ProgressPayload) -> Self {
        Self {
            request_id: request_id.into(),
            kind: payload.kind,
            progress: payload.progress,
            message: payload.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_request_wire_shape() {
        let request = WorkerRequest::new(
            "req-1",
            WorkerCommand::Translate(TranslatePayload {
                text: "Hello world".to_string(),
                source_lang: "en".to_string(),
                target_lang: "fr".to_string(),
                options: TranslateOptions::default(),
            }),
        );
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["id"], "req-1");
        assert_eq!(value["type"], "translate");
        assert_eq!(value["payload"]["text"], "Hello world");
        assert_eq!(value["payload"]["sourceLang"], "en");
    }

    #[test]
    fn test_cancel_has_no_payload() {
        let line = serde_json::to_string(&WorkerRequest::new("req-9", WorkerCommand::Cancel)).unwrap();
        let parsed: WorkerRequest = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.id, "req-9");
        assert_eq!(parsed.command, WorkerCommand::Cancel);
    }

    #[test]
    fn test_response_wire_shape() {
        let response = WorkerResponse::ok(
            "req-1",
            WorkerPayload::Result(TranslationOutput {
                translated_text: "Bonjour le monde".to_string(),
                processing_time_ms: 12,
                confidence: None,
            }),
        );
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["type"], "result");
        assert_eq!(value["payload"]["translatedText"], "Bonjour le monde");
        assert_eq!(value["payload"]["processingTime"], 12);
        assert!(value["payload"].get("confidence").is_none());

        let error = WorkerResponse::error("req-2", TranslateError::worker("boom"));
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["payload"]["type"], "WORKER_ERROR");
    }

    #[test]
    fn test_progress_parses_from_json() {
        let line = r#"{"id":"a","type":"progress","payload":{"type":"model-loading","progress":40,"message":"Loading"}}"#;
        let parsed: WorkerResponse = serde_json::from_str(line).unwrap();
        match parsed.payload {
            WorkerPayload::Progress(p) => {
                assert_eq!(p.kind, ProgressKind::ModelLoading);
                assert_eq!(p.progress, 40);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_progress_is_clamped() {
        let response = WorkerResponse::progress("a", ProgressKind::Translating, 250, "done");
        match response.payload {
            WorkerPayload::Progress(p) => assert_eq!(p.progress, 100),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_error_envelope_parses() {
        let line = r#"{"id":"x","type":"error","payload":{"type":"CANCELLED","message":"stopped"}}"#;
        let parsed: WorkerResponse = serde_json::from_str(line).unwrap();
        match parsed.payload {
            WorkerPayload::Error(e) => assert_eq!(e.kind, ErrorKind::Cancelled),
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
