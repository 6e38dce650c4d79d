//! Seams between the worker and the model artifact it drives.
//!
//! The worker never knows how a model is stored or evaluated. A
//! [`ModelLoader`] turns a [`ModelKey`] into an invocable [`TranslationModel`];
//! both run on worker job threads and observe the request's cancel token at
//! their own checkpoints.

use std::fmt;
use std::sync::Arc;

use offline_translate_types::{TranslateError, TranslateOptions};
use tokio_util::sync::CancellationToken;

/// Cache key: task type, model identifier and quantization flag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelKey {
    pub task: String,
    pub model_id: String,
    pub quantized: bool,
}

impl ModelKey {
    pub fn new(task: impl Into<String>, model_id: impl Into<String>, quantized: bool) -> Self {
        Self {
            task: task.into(),
            model_id: model_id.into(),
            quantized,
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let q = if self.quantized { "q" } else { "fp" };
        write!(f, "{}/{}/{q}", self.task, self.model_id)
    }
}

/// Output of one model invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    pub text: String,
    pub confidence: Option<f32>,
}

/// A loaded model. Treated as reentrant: one instance serves concurrent jobs.
pub trait TranslationModel: Send + Sync {
    fn translate(
        &self,
        text: &str,
        options: &TranslateOptions,
        cancel: &CancellationToken,
    ) -> Result<Translation, TranslateError>;
}

/// Shared handle to a loaded model.
pub type SharedModel = Arc<dyn TranslationModel>;

/// Progress sink handed to a loader: percentage and a short message.
pub type LoadProgress<'a> = &'a mut dyn FnMut(u8, &str);

/// Loads model artifacts. Implementations must check `cancel` between load
/// steps and return a `CANCELLED` error once it fires.
pub trait ModelLoader: Send + Sync {
    fn load(
        &self,
        key: &ModelKey,
        progress: LoadProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<SharedModel, TranslateError>;

    /// Language codes this loader can serve, advertised in `ready`.
    fn supported_languages(&self) -> Vec<String> {
        offline_translate_types::languages::supported_language_codes()
    }
}
