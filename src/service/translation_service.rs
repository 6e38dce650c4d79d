//! Caller-facing translation service.
//!
//! Wires the scheduler, the supervisor and a worker transport together and
//! exposes the operations UI code calls. Each `translate` call gets a
//! caller-visible request id; every retry of that request is a fresh
//! scheduler submission under the same request id.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::task::{Context, Poll};

use log::{debug, info, warn};
use offline_translate_types::languages::{normalize_language_code, validate_request};
use offline_translate_types::{
    ErrorKind, ProgressEvent, ServiceConfig, TranslateError, TranslateOptions, TranslatePayload,
    WorkerCapabilities,
};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::retry::{is_retryable, with_retry, RetryPolicy};
use super::scheduler::{
    PendingTranslation, ProgressListener, Scheduler, SchedulerOptions, SharedListeners,
    TranslationOutcome,
};
use super::supervisor::Supervisor;
use super::transport::WorkerSpawner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub is_initialized: bool,
    pub queue_length: usize,
    pub active_requests: usize,
    pub is_processing_queue: bool,
    pub protocol_violations: u64,
}

struct Runtime {
    config: ServiceConfig,
    scheduler: Arc<Scheduler>,
    supervisor: Arc<Supervisor>,
    control: JoinHandle<()>,
    health: Option<JoinHandle<()>>,
}

struct InFlight {
    cancel: CancellationToken,
    /// Correlation id of the current scheduler submission.
    attempt: Option<String>,
    /// Error reported instead of `CANCELLED` when the service aborts it.
    abort_with: Option<TranslateError>,
}

type InFlightTable = Arc<Mutex<HashMap<String, InFlight>>>;

fn lock_table(table: &InFlightTable) -> MutexGuard<'_, HashMap<String, InFlight>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

fn not_initialized() -> TranslateError {
    TranslateError::new(
        ErrorKind::WorkerInitializationFailed,
        "Translation service is not initialized",
    )
}

/// A running translation. Await it for the result.
pub struct TranslationTask {
    id: String,
    handle: JoinHandle<TranslationOutcome>,
}

impl TranslationTask {
    /// Request id accepted by [`TranslationService::cancel_translation`].
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for TranslationTask {
    type Output = TranslationOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(e)) => Poll::Ready(Err(TranslateError::communication(format!(
                "Translation task {} failed: {e}",
                self.id
            )))),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct TranslationService {
    spawner: Arc<dyn WorkerSpawner>,
    runtime: RwLock<Option<Arc<Runtime>>>,
    listeners: SharedListeners,
    in_flight: InFlightTable,
    lifecycle: TokioMutex<()>,
}

impl TranslationService {
    pub fn new(spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            spawner,
            runtime: RwLock::new(None),
            listeners: Arc::default(),
            in_flight: Arc::default(),
            lifecycle: TokioMutex::new(()),
        }
    }

    fn runtime(&self) -> Option<Arc<Runtime>> {
        self.runtime
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_runtime(&self) -> Option<Arc<Runtime>> {
        self.runtime
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Start the compute worker and begin accepting requests. Calling it
    /// again replaces the running worker; pending requests get `RESET`.
    pub async fn initialize(&self, config: ServiceConfig) -> Result<(), TranslateError> {
        config.validate()?;
        let _lifecycle = self.lifecycle.lock().await;
        if let Some(previous) = self.take_runtime() {
            warn!("[SERVICE] Re-initializing, stopping the current worker");
            self.stop_runtime(&previous).await;
        }

        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(
            SchedulerOptions {
                max_concurrency: config.max_concurrent_translations,
                default_timeout: config.timeout(),
                cancel_ack_timeout: config.cancel_ack_timeout(),
            },
            self.listeners.clone(),
            signals_tx.clone(),
        );
        let supervisor = Supervisor::new(
            self.spawner.clone(),
            scheduler.clone(),
            config.clone(),
            signals_tx,
        );
        let control = supervisor.spawn_control_loop(signals_rx);

        if let Err(err) = supervisor.start().await {
            supervisor.shutdown().await;
            control.abort();
            return Err(err);
        }
        let health = config
            .health_check_interval()
            .map(|period| supervisor.spawn_health_checks(period));

        info!(
            "[SERVICE] Initialized (concurrency {}, timeout {}ms)",
            config.max_concurrent_translations, config.timeout_ms
        );
        *self.runtime.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(Runtime {
            config,
            scheduler,
            supervisor,
            control,
            health,
        }));
        Ok(())
    }

    /// Translate and wait for the text.
    pub async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
        options: Option<TranslateOptions>,
    ) -> Result<String, TranslateError> {
        self.start_translation(text, source_lang, target_lang, options)?
            .await
            .map(|output| output.translated_text)
    }

    /// Validate and queue a translation. Validation errors are returned
    /// here, before anything is queued. The returned task keeps running if
    /// dropped; cancel it by id.
    pub fn start_translation(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
        options: Option<TranslateOptions>,
    ) -> Result<TranslationTask, TranslateError> {
        let runtime = self.runtime().ok_or_else(not_initialized)?;
        if !runtime.supervisor.accepts_work() {
            return Err(not_initialized());
        }

        let source_lang = normalize_language_code(source_lang);
        let target_lang = normalize_language_code(target_lang);
        let available = runtime
            .supervisor
            .capabilities()
            .map(|caps| caps.supported_languages)
            .unwrap_or_default();
        validate_request(
            text,
            &source_lang,
            &target_lang,
            runtime.config.max_text_length,
            &available,
        )?;

        let options = options.unwrap_or_default();
        let priority = options.priority.unwrap_or(0);
        let payload = TranslatePayload {
            text: text.to_string(),
            source_lang,
            target_lang,
            options,
        };
        let request_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        lock_table(&self.in_flight).insert(
            request_id.clone(),
            InFlight {
                cancel: cancel.clone(),
                attempt: None,
                abort_with: None,
            },
        );
        debug!(
            "[SERVICE] Request {request_id}: {} -> {}, priority {priority}",
            payload.source_lang, payload.target_lang
        );

        // The first attempt is queued now so queue order follows call order.
        let mut first = Some(submit_attempt(
            &runtime,
            &self.in_flight,
            &request_id,
            &payload,
            priority,
        ));
        let table = self.in_flight.clone();
        let policy = RetryPolicy::from(&runtime.config.retry_options);
        let id = request_id.clone();
        let handle = tokio::spawn(async move {
            let operation = |_attempt: u32| {
                let pending = first.take().unwrap_or_else(|| {
                    submit_attempt(&runtime, &table, &id, &payload, priority)
                });
                async move {
                    match pending {
                        Ok(pending) => pending.await,
                        Err(e) => Err(e),
                    }
                }
            };
            let result = with_retry(operation, &policy, is_retryable, &cancel, &id).await;
            let entry = lock_table(&table).remove(&id);
            match result {
                Err(e) if e.kind == ErrorKind::Cancelled => {
                    Err(entry.and_then(|entry| entry.abort_with).unwrap_or(e))
                }
                other => other,
            }
        });

        Ok(TranslationTask {
            id: request_id,
            handle,
        })
    }

    /// Register a progress callback for all requests.
    pub fn on_progress(&self, callback: impl Fn(&ProgressEvent) + Send + Sync + 'static) {
        let listener: ProgressListener = Arc::new(callback);
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Cancel a request by id. Returns `false` for unknown or already
    /// cancelled requests.
    pub fn cancel_translation(&self, request_id: &str) -> bool {
        let runtime = self.runtime();
        let mut table = lock_table(&self.in_flight);
        let Some(entry) = table.get_mut(request_id) else {
            return false;
        };
        if entry.cancel.is_cancelled() {
            return false;
        }
        info!("[SERVICE] Cancelling request {request_id}");
        entry.cancel.cancel();
        if let (Some(attempt), Some(runtime)) = (&entry.attempt, runtime) {
            runtime.scheduler.cancel(attempt);
        }
        true
    }

    pub fn status(&self) -> ServiceStatus {
        let Some(runtime) = self.runtime() else {
            return ServiceStatus::default();
        };
        let scheduler = runtime.scheduler.status();
        ServiceStatus {
            is_initialized: runtime.supervisor.accepts_work(),
            queue_length: scheduler.queue_length,
            active_requests: scheduler.active_count,
            is_processing_queue: scheduler.draining,
            protocol_violations: scheduler.protocol_violations,
        }
    }

    pub fn capabilities(&self) -> Option<WorkerCapabilities> {
        self.runtime()?.supervisor.capabilities()
    }

    /// Ping the worker now, restarting it if it does not answer.
    pub async fn check_health(&self) -> bool {
        match self.runtime() {
            Some(runtime) => runtime.supervisor.check_health().await,
            None => false,
        }
    }

    /// Replace the worker. With `recover`, pending requests carry over.
    pub async fn restart_worker(&self, recover: bool) -> Result<(), TranslateError> {
        let runtime = self.runtime().ok_or_else(not_initialized)?;
        runtime.supervisor.restart_worker(recover).await
    }

    /// Reject everything with `RESET` and start a fresh worker. Also the way
    /// out of the failed state after recovery gave up.
    pub async fn reset_service(&self) -> Result<(), TranslateError> {
        let runtime = self.runtime().ok_or_else(not_initialized)?;
        info!("[SERVICE] Resetting");
        self.abort_in_flight(&TranslateError::reset());
        match runtime.scheduler.reset_all().await {
            Ok(result) => result,
            Err(_) => Err(TranslateError::worker(
                "Supervisor stopped before the reset completed",
            )),
        }
    }

    /// Reject everything with `RESET`, stop the worker and background
    /// tasks. The service can be initialized again afterwards.
    pub async fn destroy(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if let Some(runtime) = self.take_runtime() {
            self.stop_runtime(&runtime).await;
            info!("[SERVICE] Destroyed");
        }
    }

    async fn stop_runtime(&self, runtime: &Runtime) {
        self.abort_in_flight(&TranslateError::reset());
        runtime.scheduler.reject_all(|_| TranslateError::reset());
        if let Some(health) = &runtime.health {
            health.abort();
        }
        runtime.supervisor.shutdown().await;
        runtime.control.abort();
    }

    /// Stop every request's retry loop, reporting `error` for those caught
    /// between attempts.
    fn abort_in_flight(&self, error: &TranslateError) {
        for entry in lock_table(&self.in_flight).values_mut() {
            if !entry.cancel.is_cancelled() {
                entry.abort_with = Some(error.clone());
                entry.cancel.cancel();
            }
        }
    }
}

/// Submit one attempt of `request_id` and record its correlation id.
fn submit_attempt(
    runtime: &Runtime,
    table: &InFlightTable,
    request_id: &str,
    payload: &TranslatePayload,
    priority: i32,
) -> Result<PendingTranslation, TranslateError> {
    let mut table = lock_table(table);
    let Some(entry) = table.get_mut(request_id) else {
        return Err(TranslateError::cancelled(request_id));
    };
    if entry.cancel.is_cancelled() {
        return Err(entry
            .abort_with
            .clone()
            .unwrap_or_else(|| TranslateError::cancelled(request_id)));
    }
    if !runtime.supervisor.accepts_work() {
        return Err(not_initialized());
    }
    let pending = runtime
        .scheduler
        .submit(request_id, payload.clone(), priority);
    entry.attempt = Some(pending.id().to_string());
    Ok(pending)
}
