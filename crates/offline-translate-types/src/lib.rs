//! Types shared by the translation service and its compute worker.

pub mod config;
pub mod error;
pub mod languages;
pub mod protocol;

pub use config::{RetryOptions, ServiceConfig};
pub use error::{ErrorKind, TranslateError};
pub use protocol::*;
