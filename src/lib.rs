//! Offline translation service.
//!
//! Requests are queued by priority and handed to an isolated compute worker
//! (a child process or a dedicated thread) that loads models and translates.
//! The service supervises that worker: it pings it, restarts it when it dies,
//! and replays the work that was in flight.

pub mod logging;
pub mod service;

pub use offline_translate_types::{
    languages, ErrorKind, ProgressEvent, ProgressKind, RetryOptions, ServiceConfig,
    TranslateError, TranslateOptions,
};
pub use service::{ProcessSpawner, ServiceStatus, ThreadSpawner, TranslationService};
