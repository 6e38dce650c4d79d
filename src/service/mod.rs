//! Supervisory side of the translator: scheduling, retries, and the
//! lifecycle of the compute worker.

pub mod process_manager;
pub mod retry;
pub mod scheduler;
pub mod supervisor;
pub mod transport;
pub mod translation_service;

pub use process_manager::ProcessSpawner;
pub use retry::{with_retry, RetryPolicy};
pub use scheduler::{Scheduler, SchedulerStatus, RECOVERY_PRIORITY_BOOST};
pub use supervisor::{Supervisor, SupervisorSignal, WorkerState};
pub use transport::{ThreadSpawner, WorkerConnection, WorkerEvent, WorkerHandle, WorkerSpawner};
pub use translation_service::{ServiceStatus, TranslationService, TranslationTask};
