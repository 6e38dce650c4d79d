//! Service configuration.
//!
//! Field names follow the camelCase keys of the JSON config file. Every field
//! has a default, so a partial (or empty) file is valid.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TranslateError;
use crate::protocol::WorkerSettings;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryOptions {
    pub max_retries: u32,
    /// Base delay in milliseconds.
    pub retry_delay: u64,
    pub retry_multiplier: f64,
    /// Upper bound on a single backoff, in milliseconds.
    pub max_delay: u64,
    /// Upper bound of the random addend, in milliseconds.
    pub jitter_ms: u64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: 1000,
            retry_multiplier: 2.0,
            max_delay: 10_000,
            jitter_ms: 300,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceConfig {
    pub cache_models: bool,
    pub use_quantized: bool,
    pub max_cache_size: usize,
    pub max_concurrent_translations: usize,
    pub timeout_ms: u64,
    pub retry_options: RetryOptions,
    /// 0 disables the periodic health check.
    pub health_check_interval_ms: u64,
    pub health_check_timeout_ms: u64,
    pub auto_recover: bool,
    pub max_restart_attempts: u32,
    pub init_timeout_ms: u64,
    pub cancel_ack_timeout_ms: u64,
    pub max_text_length: usize,
    pub model_dir: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            cache_models: true,
            use_quantized: true,
            max_cache_size: 3,
            max_concurrent_translations: 1,
            timeout_ms: 30_000,
            retry_options: RetryOptions::default(),
            health_check_interval_ms: 30_000,
            health_check_timeout_ms: 5_000,
            auto_recover: true,
            max_restart_attempts: 3,
            init_timeout_ms: 60_000,
            cancel_ack_timeout_ms: 2_000,
            max_text_length: 5_000,
            model_dir: "models".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Load a JSON config file. Missing keys take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, TranslateError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TranslateError::invalid_input(format!("Cannot read config {}: {e}", path.display()))
        })?;
        let config: ServiceConfig = serde_json::from_str(&raw).map_err(|e| {
            TranslateError::invalid_input(format!("Invalid config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TranslateError> {
        if self.max_concurrent_translations < 1 {
            return Err(TranslateError::invalid_input(
                "maxConcurrentTranslations must be at least 1",
            ));
        }
        if self.timeout_ms == 0 {
            return Err(TranslateError::invalid_input("timeoutMs must be positive"));
        }
        if self.retry_options.retry_multiplier < 1.0 {
            return Err(TranslateError::invalid_input(
                "retryOptions.retryMultiplier must be >= 1",
            ));
        }
        if self.cache_models && self.max_cache_size == 0 {
            return Err(TranslateError::invalid_input(
                "maxCacheSize must be positive when cacheModels is enabled",
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_ms > 0)
            .then(|| Duration::from_millis(self.health_check_interval_ms))
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn cancel_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_ack_timeout_ms)
    }

    /// Settings sent to the worker in the `init` envelope.
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            cache_models: self.cache_models,
            use_quantized: self.use_quantized,
            max_cache_size: self.max_cache_size,
            max_concurrency: self.max_concurrent_translations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: ServiceConfig = serde_json::from_str(
            r#"{ "maxConcurrentTranslations": 2, "retryOptions": { "maxRetries": 5 } }"#,
        )
        .unwrap();
        assert_eq!(config.max_concurrent_translations, 2);
        assert_eq!(config.retry_options.max_retries, 5);
        assert_eq!(config.retry_options.retry_delay, 1000);
        assert_eq!(config.timeout_ms, 30_000);
        assert!(config.auto_recover);
    }

    #[test]
    fn test_validate() {
        assert!(ServiceConfig::default().validate().is_ok());

        let config = ServiceConfig {
            max_concurrent_translations: 0,
            ..ServiceConfig::default()
        };
        assert_eq!(config.validate().unwrap_err().kind, ErrorKind::InvalidInput);

        let config = ServiceConfig {
            cache_models: true,
            max_cache_size: 0,
            ..ServiceConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ServiceConfig {
            cache_models: false,
            max_cache_size: 0,
            ..ServiceConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_health_check_disabled_by_zero() {
        let config = ServiceConfig {
            health_check_interval_ms: 0,
            ..ServiceConfig::default()
        };
        assert!(config.health_check_interval().is_none());
    }

    #[test]
    fn test_from_json_file() {
        let dir = std::env::temp_dir().join(format!("ot-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(&path, r#"{ "timeoutMs": 500, "modelDir": "/opt/models" }"#).unwrap();

        let config = ServiceConfig::from_json_file(&path).unwrap();
        assert_eq!(config.timeout_ms, 500);
        assert_eq!(config.model_dir, "/opt/models");

        std::fs::write(&path, "not json").unwrap();
        assert!(ServiceConfig::from_json_file(&path).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
