// Mock model loader for tests and E2E runs without model files.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use offline_translate_types::{ErrorKind, TranslateError, TranslateOptions};
use tokio_util::sync::CancellationToken;

use crate::model::{LoadProgress, ModelKey, ModelLoader, SharedModel, Translation, TranslationModel};

#[derive(Debug, Clone, Default)]
pub struct MockLoaderOptions {
    /// Percentages reported during a load (the cache adds 0 and 100).
    pub progress_steps: Vec<u8>,
    /// Sleep between progress steps.
    pub step_delay: Duration,
    /// Model ids whose load fails with `MODEL_LOAD_FAILED`.
    pub fail_models: Vec<String>,
    /// Block every load until this many loads are running at once.
    pub load_rendezvous: Option<usize>,
    /// Time a translation takes; checked against the cancel token every 5ms.
    pub translate_delay: Duration,
    /// Sleep through `translate_delay` without looking at the cancel token.
    pub ignore_cancel: bool,
    /// Inputs containing this marker fail with `TRANSLATION_FAILED`.
    pub fail_marker: Option<String>,
    /// Inputs containing this marker panic inside the model.
    pub panic_marker: Option<String>,
}

pub struct MockLoader {
    options: MockLoaderOptions,
    loads: AtomicUsize,
    rendezvous: Option<Barrier>,
}

impl MockLoader {
    pub fn new(options: MockLoaderOptions) -> Self {
        let rendezvous = options.load_rendezvous.map(Barrier::new);
        Self {
            options,
            loads: AtomicUsize::new(0),
            rendezvous,
        }
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModelLoader for MockLoader {
    fn load(
        &self,
        key: &ModelKey,
        progress: LoadProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<SharedModel, TranslateError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(barrier) = &self.rendezvous {
            barrier.wait();
        }
        for step in &self.options.progress_steps {
            if cancel.is_cancelled() {
                return Err(TranslateError::new(ErrorKind::Cancelled, "load cancelled"));
            }
            if !self.options.step_delay.is_zero() {
                thread::sleep(self.options.step_delay);
            }
            progress(*step, "Loading mock weights");
        }
        if self.options.fail_models.contains(&key.model_id) {
            return Err(TranslateError::new(
                ErrorKind::ModelLoadFailed,
                format!("mock load failure for {}", key.model_id),
            ));
        }
        Ok(Arc::new(MockModel {
            target: key.model_id.rsplit('-').next().unwrap_or_default().to_string(),
            options: self.options.clone(),
        }))
    }
}

/// Prefixes the input with the target language: `[fr] Hello world`.
pub struct MockModel {
    target: String,
    options: MockLoaderOptions,
}

impl TranslationModel for MockModel {
    fn translate(
        &self,
        text: &str,
        options: &TranslateOptions,
        cancel: &CancellationToken,
    ) -> Result<Translation, TranslateError> {
        if let Some(marker) = &self.options.panic_marker {
            if text.contains(marker.as_str()) {
                panic!("mock model panicked on {marker}");
            }
        }
        let mut waited = Duration::ZERO;
        while waited < self.options.translate_delay {
            if cancel.is_cancelled() && !self.options.ignore_cancel {
                return Err(TranslateError::new(ErrorKind::Cancelled, "translation cancelled"));
            }
            thread::sleep(Duration::from_millis(5));
            waited += Duration::from_millis(5);
        }
        if let Some(marker) = &self.options.fail_marker {
            if text.contains(marker.as_str()) {
                return Err(TranslateError::new(
                    ErrorKind::TranslationFailed,
                    "mock translation failure",
                ));
            }
        }
        let mut words: Vec<&str> = text.split_whitespace().collect();
        if let Some(max) = options.max_length {
            words.truncate(max);
        }
        Ok(Translation {
            text: format!("[{}] {}", self.target, words.join(" ")),
            confidence: Some(1.0),
        })
    }
}
