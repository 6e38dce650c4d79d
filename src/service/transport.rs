//! Ways of starting a compute worker.
//!
//! A [`WorkerConnection`] is the caller's end of the dedicated channel:
//! a request sender, an event stream of decoded envelopes, and a handle that
//! tears the worker down. The event stream doubles as the fallback path: when
//! the worker dies the transport reports it as [`WorkerEvent::Fatal`].

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use log::{info, warn};
use offline_translate_types::{
    ErrorKind, TranslateError, WorkerCommand, WorkerRequest, WorkerResponse,
};
use offline_translate_worker::{run_worker, ModelLoader, WorkerOptions};
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum WorkerEvent {
    Envelope(WorkerResponse),
    /// The worker is gone; no more envelopes will arrive.
    Fatal(String),
}

/// Tears a worker down. May block until the worker is gone.
pub trait WorkerHandle: Send {
    fn terminate(&mut self);
}

pub struct WorkerConnection {
    pub requests: Sender<WorkerRequest>,
    pub events: mpsc::UnboundedReceiver<WorkerEvent>,
    pub handle: Box<dyn WorkerHandle>,
}

pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<WorkerConnection, TranslateError>;
}

pub(crate) fn spawn_failed(message: String) -> TranslateError {
    TranslateError::new(ErrorKind::WorkerInitializationFailed, message)
}

/// Runs the worker loop on a dedicated OS thread in this process.
pub struct ThreadSpawner {
    loader: Arc<dyn ModelLoader>,
    options: WorkerOptions,
}

impl ThreadSpawner {
    pub fn new(loader: Arc<dyn ModelLoader>, options: WorkerOptions) -> Self {
        Self { loader, options }
    }
}

impl WorkerSpawner for ThreadSpawner {
    fn spawn(&self) -> Result<WorkerConnection, TranslateError> {
        let (requests, inbox) = crossbeam_channel::unbounded::<WorkerRequest>();
        let (outbox, responses) = crossbeam_channel::unbounded::<WorkerResponse>();
        let (event_tx, events) = mpsc::unbounded_channel();

        let loader = self.loader.clone();
        let options = self.options.clone();
        let worker = thread::Builder::new()
            .name("compute-worker".to_string())
            .spawn(move || run_worker(inbox, outbox, loader, options))
            .map_err(|e| spawn_failed(format!("Failed to start worker thread: {e}")))?;

        // Forward envelopes until every outbox sender is gone, which
        // happens once the loop and all of its jobs have exited.
        thread::Builder::new()
            .name("compute-worker-events".to_string())
            .spawn(move || {
                for response in responses.iter() {
                    if event_tx.send(WorkerEvent::Envelope(response)).is_err() {
                        return;
                    }
                }
                let _ = event_tx.send(WorkerEvent::Fatal("Worker thread exited".to_string()));
            })
            .map_err(|e| spawn_failed(format!("Failed to start worker event thread: {e}")))?;

        info!("[TRANSPORT] Started in-process worker thread");
        Ok(WorkerConnection {
            requests: requests.clone(),
            events,
            handle: Box::new(ThreadHandle {
                requests,
                thread: Some(worker),
            }),
        })
    }
}

struct ThreadHandle {
    requests: Sender<WorkerRequest>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle for ThreadHandle {
    fn terminate(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self
            .requests
            .send(WorkerRequest::new("shutdown", WorkerCommand::Shutdown));
        if thread.join().is_err() {
            warn!("[TRANSPORT] Worker thread panicked");
        }
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        // Ask the loop to stop but do not wait for it here.
        if self.thread.is_some() {
            let _ = self
                .requests
                .send(WorkerRequest::new("shutdown", WorkerCommand::Shutdown));
        }
    }
}
