//! Language-code catalogue and request validation.

use crate::error::TranslateError;

/// ISO 639-1 codes the bundled worker knows how to route to a model.
pub const SUPPORTED_LANGUAGES: &[(&str, &str)] = &[
    ("ar", "Arabic"),
    ("de", "German"),
    ("en", "English"),
    ("es", "Spanish"),
    ("fr", "French"),
    ("hi", "Hindi"),
    ("it", "Italian"),
    ("ja", "Japanese"),
    ("ko", "Korean"),
    ("nl", "Dutch"),
    ("pl", "Polish"),
    ("pt", "Portuguese"),
    ("ru", "Russian"),
    ("sv", "Swedish"),
    ("tr", "Turkish"),
    ("uk", "Ukrainian"),
    ("zh", "Chinese"),
];

/// Task type used in model-cache keys.
pub const TRANSLATION_TASK: &str = "translation";

pub fn is_supported_language(code: &str) -> bool {
    SUPPORTED_LANGUAGES.iter().any(|(c, _)| *c == code)
}

pub fn supported_language_codes() -> Vec<String> {
    SUPPORTED_LANGUAGES
        .iter()
        .map(|(c, _)| (*c).to_string())
        .collect()
}

/// Model identifier for a language pair, e.g. `opus-mt-en-fr`.
pub fn model_id_for_pair(source: &str, target: &str) -> String {
    format!("opus-mt-{source}-{target}")
}

/// Normalize a user-supplied code: trimmed, lowercase, region suffix dropped
/// (`en-US` -> `en`).
pub fn normalize_language_code(code: &str) -> String {
    let code = code.trim().to_ascii_lowercase();
    match code.split(['-', '_']).next() {
        Some(primary) => primary.to_string(),
        None => code,
    }
}

/// Synchronous validation performed before anything is queued.
///
/// `available` is the language list advertised by the worker; when empty the
/// static catalogue is used.
pub fn validate_request(
    text: &str,
    source: &str,
    target: &str,
    max_text_length: usize,
    available: &[String],
) -> Result<(), TranslateError> {
    if text.trim().is_empty() {
        return Err(TranslateError::invalid_input("Text to translate is empty"));
    }
    let length = text.chars().count();
    if length > max_text_length {
        return Err(TranslateError::invalid_input(format!(
            "Text is too long ({length} chars, limit {max_text_length})"
        ))
        .with_details(serde_json::json!({ "length": length, "limit": max_text_length })));
    }
    if source.is_empty() || target.is_empty() {
        return Err(TranslateError::invalid_input("Language codes must not be empty"));
    }

    let known = |code: &str| {
        if available.is_empty() {
            is_supported_language(code)
        } else {
            available.iter().any(|c| c == code)
        }
    };
    if source == target || !known(source) || !known(target) {
        return Err(TranslateError::unsupported_pair(source, target));
    }
    Ok(())
}
