//! Compute worker message loop.
//!
//! The loop owns the model cache and never blocks on model work: every
//! `translate` runs on its own job thread that writes progress and the final
//! envelope straight to the outbox. The loop only routes messages, so `cancel`
//! and `ping` are answered while loads and inference are in progress.
//!
//! Thread design in child-process mode:
//! - stdin reader: parses JSON lines → inbox
//! - message loop: `run_worker`
//! - stdout writer: outbox → JSON lines
//! - job threads (temporary): model resolve + inference

use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use offline_translate_types::languages::{model_id_for_pair, TRANSLATION_TASK};
use offline_translate_types::{
    ErrorKind, ProgressKind, TranslateError, TranslatePayload, TranslationOutput,
    WorkerCapabilities, WorkerCommand, WorkerPayload, WorkerRequest, WorkerResponse,
    WorkerSettings,
};
use tokio_util::sync::CancellationToken;

use crate::model::ModelLoader;
use crate::model_cache::{ModelCache, ResolveOptions};

/// Limits the worker enforces on itself.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub max_concurrency: usize,
    /// How long teardown waits for cancelled jobs before leaving them behind.
    pub teardown_grace: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        let cores = thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            max_concurrency: cores.clamp(1, 4),
            teardown_grace: Duration::from_secs(1),
        }
    }
}

struct Job {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

enum Flow {
    Continue,
    Stop,
}

struct Worker {
    loader: Arc<dyn ModelLoader>,
    options: WorkerOptions,
    outbox: Sender<WorkerResponse>,
    cache: Option<Arc<ModelCache>>,
    jobs: HashMap<String, Job>,
    /// Jobs that have not yet sent their terminal envelope.
    running: Arc<AtomicUsize>,
    done_tx: Sender<String>,
}

/// Run the message loop until `shutdown` arrives or the inbox disconnects.
pub fn run_worker(
    inbox: Receiver<WorkerRequest>,
    outbox: Sender<WorkerResponse>,
    loader: Arc<dyn ModelLoader>,
    options: WorkerOptions,
) {
    let (done_tx, done_rx) = crossbeam_channel::unbounded::<String>();
    let mut worker = Worker {
        loader,
        options,
        outbox,
        cache: None,
        jobs: HashMap::new(),
        running: Arc::new(AtomicUsize::new(0)),
        done_tx,
    };

    info!("[WORKER] Waiting for init...");
    loop {
        crossbeam_channel::select! {
            recv(inbox) -> msg => match msg {
                Ok(request) => {
                    if let Flow::Stop = worker.handle(request) {
                        break;
                    }
                }
                Err(_) => {
                    info!("[WORKER] Inbox disconnected, shutting down");
                    break;
                }
            },
            recv(done_rx) -> id => {
                if let Ok(id) = id {
                    worker.reap(&id);
                }
            }
        }
    }
    worker.teardown(&done_rx);
}

impl Worker {
    fn handle(&mut self, request: WorkerRequest) -> Flow {
        let WorkerRequest { id, command } = request;
        match command {
            WorkerCommand::Init(settings) => self.init(id, &settings),
            WorkerCommand::Translate(payload) => self.start_job(id, payload),
            WorkerCommand::Cancel => self.cancel_job(&id),
            WorkerCommand::Ping => self.send(WorkerResponse::ok(id, WorkerPayload::Pong)),
            WorkerCommand::Shutdown => {
                info!("[WORKER] Shutdown requested");
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn init(&mut self, id: String, settings: &WorkerSettings) {
        info!(
            "[WORKER] Init: cache_models={}, quantized={}, cache_size={}",
            settings.cache_models, settings.use_quantized, settings.max_cache_size
        );
        self.cache = Some(Arc::new(ModelCache::new(self.loader.clone(), settings)));
        let capabilities = WorkerCapabilities {
            supported_languages: self.loader.supported_languages(),
            max_concurrency: self.options.max_concurrency,
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        self.send(WorkerResponse::ok(id, WorkerPayload::Ready(capabilities)));
    }

    fn start_job(&mut self, id: String, payload: TranslatePayload) {
        let Some(cache) = self.cache.clone() else {
            self.send(WorkerResponse::error(id, TranslateError::worker("Worker not initialized")));
            return;
        };
        if self.jobs.contains_key(&id) {
            self.send(WorkerResponse::error(
                id,
                TranslateError::worker("Duplicate request id"),
            ));
            return;
        }
        let running = self.running.load(Ordering::SeqCst);
        if running >= self.options.max_concurrency {
            let err = TranslateError::worker(format!("Worker at capacity ({running} running)"));
            self.send(WorkerResponse::error(id, err));
            return;
        }

        debug!(
            "[WORKER] Starting job {id}: {} -> {}, {} chars",
            payload.source_lang,
            payload.target_lang,
            payload.text.len()
        );
        let cancel = CancellationToken::new();
        let job = JobContext {
            id: id.clone(),
            payload,
            cache,
            cancel: cancel.clone(),
            outbox: self.outbox.clone(),
            running: self.running.clone(),
        };
        self.running.fetch_add(1, Ordering::SeqCst);
        let done_tx = self.done_tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("translate-{id}"))
            .spawn(move || {
                let id = job.id.clone();
                job.run();
                let _ = done_tx.send(id);
            });
        match spawned {
            Ok(handle) => {
                self.jobs.insert(id, Job { cancel, handle });
            }
            Err(e) => {
                self.running.fetch_sub(1, Ordering::SeqCst);
                error!("[WORKER] Failed to spawn job thread: {e}");
                self.send(WorkerResponse::error(
                    id,
                    TranslateError::worker(format!("Cannot start job: {e}")),
                ));
            }
        }
    }

    fn cancel_job(&mut self, id: &str) {
        match self.jobs.get(id) {
            Some(job) => {
                info!("[WORKER] Cancelling job {id}");
                // The job acknowledges when it reaches its next checkpoint.
                job.cancel.cancel();
            }
            // Already finished: its terminal envelope is the only answer.
            None => debug!("[WORKER] Cancel for unknown job {id}, ignoring"),
        }
    }

    fn reap(&mut self, id: &str) {
        if let Some(job) = self.jobs.remove(id) {
            let _ = job.handle.join();
        }
    }

    /// Cancel every job and wait up to `teardown_grace` for them. Jobs stuck
    /// inside a model call are detached; their late envelopes go nowhere.
    fn teardown(&mut self, done_rx: &Receiver<String>) {
        for job in self.jobs.values() {
            job.cancel.cancel();
        }
        let deadline = Instant::now() + self.options.teardown_grace;
        while !self.jobs.is_empty() {
            match done_rx.recv_deadline(deadline) {
                Ok(id) => self.reap(&id),
                Err(_) => break,
            }
        }
        for (id, _job) in self.jobs.drain() {
            warn!(
                "[WORKER] Job {id} still running after {}ms, detaching",
                self.options.teardown_grace.as_millis()
            );
        }
        info!("[WORKER] Exiting");
    }

    fn send(&self, response: WorkerResponse) {
        if self.outbox.send(response).is_err() {
            warn!("[WORKER] Outbox closed, dropping response");
        }
    }
}

struct JobContext {
    id: String,
    payload: TranslatePayload,
    cache: Arc<ModelCache>,
    cancel: CancellationToken,
    outbox: Sender<WorkerResponse>,
    running: Arc<AtomicUsize>,
}

impl JobContext {
    fn run(self) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.execute()));
        let response = match result {
            Ok(Ok(output)) => WorkerResponse::ok(&self.id, WorkerPayload::Result(output)),
            Ok(Err(err)) => WorkerResponse::error(&self.id, err),
            Err(panic_info) => {
                let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic in translation job".to_string()
                };
                error!("[WORKER] Job {} panicked: {msg}", self.id);
                WorkerResponse::error(
                    &self.id,
                    TranslateError::worker(format!("Translation panicked: {msg}")),
                )
            }
        };
        self.running.fetch_sub(1, Ordering::SeqCst);
        let _ = self.outbox.send(response);
    }

    fn execute(&self) -> Result<TranslationOutput, TranslateError> {
        let started = Instant::now();
        let TranslatePayload {
            text,
            source_lang,
            target_lang,
            options,
        } = &self.payload;

        let model_id = model_id_for_pair(source_lang, target_lang);
        let on_progress = |pct: u8, message: &str| {
            let _ = self.outbox.send(WorkerResponse::progress(
                &self.id,
                ProgressKind::ModelLoading,
                pct,
                message,
            ));
        };
        let model = self.cache.resolve(
            TRANSLATION_TASK,
            &model_id,
            &self.id,
            ResolveOptions {
                on_progress: Some(&on_progress),
                cancel: &self.cancel,
            },
        )?;
        self.checkpoint()?;

        let translation = model
            .translate(text, options, &self.cancel)
            .map_err(|err| match err.kind {
                ErrorKind::Cancelled | ErrorKind::TranslationFailed => err,
                _ => TranslateError::new(ErrorKind::TranslationFailed, err.message),
            })?;
        self.checkpoint()?;

        let _ = self.outbox.send(WorkerResponse::progress(
            &self.id,
            ProgressKind::Translating,
            100,
            "Translation complete",
        ));
        Ok(TranslationOutput {
            translated_text: translation.text,
            processing_time_ms: started.elapsed().as_millis() as u64,
            confidence: translation.confidence,
        })
    }

    fn checkpoint(&self) -> Result<(), TranslateError> {
        if self.cancel.is_cancelled() {
            Err(TranslateError::cancelled(&self.id))
        } else {
            Ok(())
        }
    }
}

/// Child-process entry point: JSON Lines on stdin/stdout, logs on stderr.
pub fn run_stdio_worker(loader: Arc<dyn ModelLoader>, options: WorkerOptions) {
    info!("[WORKER] Starting compute worker (pid={})", std::process::id());

    let (inbox_tx, inbox_rx) = crossbeam_channel::unbounded::<WorkerRequest>();
    let (outbox_tx, outbox_rx) = crossbeam_channel::unbounded::<WorkerResponse>();

    // Stdin reader
    let parse_errors = outbox_tx.clone();
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(l) if l.trim().is_empty() => continue,
                Ok(l) => l,
                Err(_) => break, // parent closed the pipe
            };
            match serde_json::from_str::<WorkerRequest>(&line) {
                Ok(request) => {
                    if inbox_tx.send(request).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("[WORKER] Failed to parse command: {e}");
                    let _ = parse_errors.send(WorkerResponse::error(
                        "",
                        TranslateError::communication(format!("Parse error: {e}")),
                    ));
                }
            }
        }
        info!("[WORKER] Stdin reader thread exiting");
    });

    // Stdout writer. Drains the outbox until the loop has stopped and
    // nothing is left to flush.
    let stopping = Arc::new(AtomicBool::new(false));
    let writer = {
        let stopping = stopping.clone();
        thread::spawn(move || {
            let stdout = io::stdout();
            let mut stdout = stdout.lock();
            loop {
                match outbox_rx.recv_timeout(Duration::from_millis(50)) {
                    Ok(response) => {
                        let Ok(json) = serde_json::to_string(&response) else {
                            continue;
                        };
                        if writeln!(stdout, "{json}").and_then(|()| stdout.flush()).is_err() {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) if stopping.load(Ordering::SeqCst) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })
    };

    run_worker(inbox_rx, outbox_tx, loader, options);
    stopping.store(true, Ordering::SeqCst);
    let _ = writer.join();
}
