//! Compute worker: model cache, model loaders and the message loop that
//! serves translation requests over a channel pair.

pub mod lexicon;
pub mod model;
pub mod model_cache;
pub mod worker_main;

// Deterministic loader for tests and E2E runs (no model files needed)
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use lexicon::{LexiconLoader, LexiconModel};
pub use model::{ModelKey, ModelLoader, SharedModel, Translation, TranslationModel};
pub use model_cache::{ModelCache, ResolveOptions};
pub use worker_main::{run_stdio_worker, run_worker, WorkerOptions};
