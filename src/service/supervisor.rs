//! Worker supervisor.
//!
//! Owns the compute worker: spawns it, runs the `init → ready` handshake,
//! pumps its envelopes into the scheduler, pings it, and replaces it when it
//! dies or stops answering. A replacement carries the scheduler's queued and
//! in-flight requests over with raised priority. When the worker cannot be
//! brought back within the restart budget every pending request is rejected
//! with `WORKER_INITIALIZATION_FAILED` and the supervisor stays failed until
//! the next explicit restart.
//!
//! Restarts are serialized. Each spawned worker gets a generation number so
//! a late "worker lost" report from a replaced worker is ignored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use offline_translate_types::{
    ErrorKind, ServiceConfig, TranslateError, WorkerCapabilities, WorkerCommand, WorkerPayload,
    WorkerRequest, WorkerResponse,
};
use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::retry::{with_retry, RetryPolicy};
use super::scheduler::{Scheduler, RECOVERY_PRIORITY_BOOST};
use super::transport::{WorkerConnection, WorkerEvent, WorkerHandle, WorkerSpawner};

/// Requests handled by the supervisor's control loop.
#[derive(Debug)]
pub enum SupervisorSignal {
    Restart {
        recover: bool,
        done: Option<oneshot::Sender<Result<(), TranslateError>>>,
    },
    WorkerLost {
        generation: u64,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Ready,
    Recovering,
    /// Restart budget exhausted; only an explicit restart leaves this state.
    Failed,
}

struct RunningWorker {
    generation: u64,
    requests: Sender<WorkerRequest>,
    handle: Box<dyn WorkerHandle>,
    reader: JoinHandle<()>,
}

type PendingPings = Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>;

pub struct Supervisor {
    spawner: Arc<dyn WorkerSpawner>,
    scheduler: Arc<Scheduler>,
    config: ServiceConfig,
    worker: TokioMutex<Option<RunningWorker>>,
    restart_lock: TokioMutex<()>,
    generation: AtomicU64,
    state: Mutex<WorkerState>,
    capabilities: RwLock<Option<WorkerCapabilities>>,
    pings: PendingPings,
    signals: mpsc::UnboundedSender<SupervisorSignal>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        spawner: Arc<dyn WorkerSpawner>,
        scheduler: Arc<Scheduler>,
        config: ServiceConfig,
        signals: mpsc::UnboundedSender<SupervisorSignal>,
    ) -> Arc<Self> {
        Arc::new(Self {
            spawner,
            scheduler,
            config,
            worker: TokioMutex::new(None),
            restart_lock: TokioMutex::new(()),
            generation: AtomicU64::new(0),
            state: Mutex::new(WorkerState::Stopped),
            capabilities: RwLock::new(None),
            pings: Arc::default(),
            signals,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: WorkerState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != state {
            debug!("[SUPERVISOR] {:?} -> {state:?}", *current);
            *current = state;
        }
    }

    /// Whether new work may be queued: the worker is up or being replaced.
    pub fn accepts_work(&self) -> bool {
        matches!(self.state(), WorkerState::Ready | WorkerState::Recovering)
    }

    pub fn capabilities(&self) -> Option<WorkerCapabilities> {
        self.capabilities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Spawn the first worker. Retries spawn/handshake failures with backoff.
    pub async fn start(self: &Arc<Self>) -> Result<(), TranslateError> {
        let _serial = self.restart_lock.lock().await;
        self.set_state(WorkerState::Starting);
        match self.launch_with_retry().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.set_state(WorkerState::Failed);
                Err(err)
            }
        }
    }

    /// Handle restart requests and worker-loss reports until shutdown.
    pub fn spawn_control_loop(
        self: &Arc<Self>,
        mut signals: mpsc::UnboundedReceiver<SupervisorSignal>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    signal = signals.recv() => signal,
                    () = this.shutdown.cancelled() => None,
                };
                let Some(signal) = signal else { break };
                match signal {
                    SupervisorSignal::Restart { recover, done } => {
                        let result = this.restart_worker(recover).await;
                        if let Some(done) = done {
                            let _ = done.send(result);
                        }
                    }
                    SupervisorSignal::WorkerLost { generation, reason } => {
                        this.on_worker_lost(generation, &reason).await;
                    }
                }
            }
            debug!("[SUPERVISOR] Control loop exiting");
        })
    }

    async fn on_worker_lost(self: &Arc<Self>, generation: u64, reason: &str) {
        if generation != self.generation.load(Ordering::SeqCst)
            || self.state() != WorkerState::Ready
        {
            debug!("[SUPERVISOR] Ignoring loss of stale worker #{generation}: {reason}");
            return;
        }
        error!("[SUPERVISOR] Worker #{generation} lost: {reason}");
        if self.config.auto_recover {
            let _ = self.restart_worker(true).await;
        } else {
            self.scheduler.detach();
            self.teardown().await;
            let rejected = self.scheduler.reject_all(|_| {
                TranslateError::worker(format!("Worker lost: {reason}"))
            });
            warn!("[SUPERVISOR] Auto-recovery disabled; rejected {rejected} requests");
            self.set_state(WorkerState::Failed);
        }
    }

    /// Ping the worker. An unanswered or failed ping, or a job still
    /// running well past its deadline, triggers a recovering restart when
    /// auto-recovery is on.
    pub async fn check_health(self: &Arc<Self>) -> bool {
        if self.state() != WorkerState::Ready {
            debug!("[SUPERVISOR] Skipping health check while {:?}", self.state());
            return false;
        }
        let verdict = match self.scheduler.stalled_for() {
            Some(stalled) if stalled > self.config.cancel_ack_timeout() => {
                Err(TranslateError::worker(format!(
                    "A job has ignored its deadline for {}ms",
                    stalled.as_millis()
                )))
            }
            _ => self.ping().await,
        };
        match verdict {
            Ok(latency) => {
                debug!("[SUPERVISOR] Worker healthy ({}ms)", latency.as_millis());
                true
            }
            Err(err) => {
                warn!("[SUPERVISOR] Health check failed: {err}");
                if self.config.auto_recover {
                    let _ = self.restart_worker(true).await;
                }
                false
            }
        }
    }

    async fn ping(&self) -> Result<Duration, TranslateError> {
        let requests = self
            .worker
            .lock()
            .await
            .as_ref()
            .map(|w| w.requests.clone())
            .ok_or_else(|| TranslateError::worker("No worker running"))?;

        let id = format!("ping-{}", Uuid::new_v4());
        let (tx, rx) = oneshot::channel();
        self.pings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), tx);

        let started = Instant::now();
        if requests
            .send(WorkerRequest::new(&id, WorkerCommand::Ping))
            .is_err()
        {
            self.forget_ping(&id);
            return Err(TranslateError::communication("Worker channel closed"));
        }
        match tokio::time::timeout(self.config.health_check_timeout(), rx).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(_)) => Err(TranslateError::communication("Worker went away during ping")),
            Err(_) => {
                self.forget_ping(&id);
                Err(TranslateError::worker(format!(
                    "No pong within {}ms",
                    self.config.health_check_timeout_ms
                )))
            }
        }
    }

    fn forget_ping(&self, id: &str) {
        self.pings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// Tear the worker down and start a new one. With `recover`, queued and
    /// in-flight requests are replayed on the new worker ahead of new work.
    pub async fn restart_worker(self: &Arc<Self>, recover: bool) -> Result<(), TranslateError> {
        let _serial = self.restart_lock.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(TranslateError::worker("Supervisor is shut down"));
        }
        self.set_state(WorkerState::Recovering);
        if recover {
            let replayed = self.scheduler.detach_for_recovery(RECOVERY_PRIORITY_BOOST);
            info!("[SUPERVISOR] Restarting worker, replaying {replayed} requests");
        } else {
            self.scheduler.detach();
            info!("[SUPERVISOR] Restarting worker");
        }
        self.teardown().await;

        match self.launch_with_retry().await {
            Ok(()) => Ok(()),
            Err(err) => {
                let reason = format!("Worker could not be restarted: {}", err.message);
                let rejected = self.scheduler.fail_all(&reason);
                error!("[SUPERVISOR] {reason}; rejected {rejected} requests");
                self.set_state(WorkerState::Failed);
                Err(TranslateError::new(ErrorKind::WorkerInitializationFailed, reason))
            }
        }
    }

    async fn launch_with_retry(self: &Arc<Self>) -> Result<(), TranslateError> {
        let policy = RetryPolicy::from(&self.config.retry_options)
            .with_max_retries(self.config.max_restart_attempts);
        with_retry(
            move |attempt| {
                if attempt > 0 {
                    info!("[SUPERVISOR] Worker start attempt {}", attempt + 1);
                }
                self.launch()
            },
            &policy,
            |_| true,
            &self.shutdown,
            "worker start",
        )
        .await
    }

    /// Spawn one worker, run the handshake, and attach it to the scheduler.
    async fn launch(self: &Arc<Self>) -> Result<(), TranslateError> {
        let WorkerConnection {
            requests,
            mut events,
            mut handle,
        } = self.spawner.spawn()?;

        let capabilities = match self.handshake(&requests, &mut events).await {
            Ok(capabilities) => capabilities,
            Err(err) => {
                warn!("[SUPERVISOR] Handshake failed: {err}");
                drop(requests);
                let _ = tokio::task::spawn_blocking(move || handle.terminate()).await;
                return Err(err);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let reader = tokio::spawn(pump_events(
            events,
            generation,
            self.scheduler.clone(),
            self.pings.clone(),
            self.signals.clone(),
        ));
        info!(
            "[SUPERVISOR] Worker #{generation} ready (v{}, concurrency {}, {} languages)",
            capabilities.version,
            capabilities.max_concurrency,
            capabilities.supported_languages.len()
        );
        let worker_max = capabilities.max_concurrency;
        *self
            .capabilities
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(capabilities);
        *self.worker.lock().await = Some(RunningWorker {
            generation,
            requests: requests.clone(),
            handle,
            reader,
        });
        self.set_state(WorkerState::Ready);
        self.scheduler.attach(requests, worker_max);
        Ok(())
    }

    async fn handshake(
        &self,
        requests: &Sender<WorkerRequest>,
        events: &mut mpsc::UnboundedReceiver<WorkerEvent>,
    ) -> Result<WorkerCapabilities, TranslateError> {
        let init_failed = |message: String| {
            TranslateError::new(ErrorKind::WorkerInitializationFailed, message)
        };
        let id = format!("init-{}", Uuid::new_v4());
        requests
            .send(WorkerRequest::new(
                &id,
                WorkerCommand::Init(self.config.worker_settings()),
            ))
            .map_err(|_| init_failed("Worker channel closed before init".to_string()))?;

        let wait_ready = async {
            while let Some(event) = events.recv().await {
                match event {
                    WorkerEvent::Envelope(WorkerResponse { id: reply, payload }) if reply == id => {
                        return match payload {
                            WorkerPayload::Ready(capabilities) => Ok(capabilities),
                            WorkerPayload::Error(e) => Err(init_failed(e.message)),
                            other => Err(init_failed(format!(
                                "Unexpected '{}' reply to init",
                                other.kind_name()
                            ))),
                        };
                    }
                    WorkerEvent::Envelope(other) => {
                        debug!("[SUPERVISOR] Ignoring '{}' before ready", other.payload.kind_name());
                    }
                    WorkerEvent::Fatal(reason) => return Err(init_failed(reason)),
                }
            }
            Err(init_failed("Worker exited during init".to_string()))
        };
        tokio::time::timeout(self.config.init_timeout(), wait_ready)
            .await
            .map_err(|_| {
                init_failed(format!(
                    "No ready reply within {}ms",
                    self.config.init_timeout_ms
                ))
            })?
    }

    async fn teardown(&self) {
        let Some(worker) = self.worker.lock().await.take() else {
            return;
        };
        let RunningWorker {
            generation,
            requests,
            mut handle,
            reader,
        } = worker;
        debug!("[SUPERVISOR] Tearing down worker #{generation}");
        reader.abort();
        let _ = requests.send(WorkerRequest::new(
            format!("shutdown-{generation}"),
            WorkerCommand::Shutdown,
        ));
        drop(requests);
        if tokio::task::spawn_blocking(move || handle.terminate())
            .await
            .is_err()
        {
            warn!("[SUPERVISOR] Worker #{generation} teardown panicked");
        }
        // Outstanding pings resolve as failures.
        self.pings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Ping the worker every `period` until shutdown.
    pub fn spawn_health_checks(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let this = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = shutdown.cancelled() => break,
                }
                let Some(supervisor) = this.upgrade() else { break };
                supervisor.check_health().await;
            }
        })
    }

    /// Stop the worker and every supervisor task.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let _serial = self.restart_lock.lock().await;
        self.scheduler.detach();
        self.teardown().await;
        self.set_state(WorkerState::Stopped);
        info!("[SUPERVISOR] Shut down");
    }
}

/// Route envelopes from one worker generation. Pongs settle pings, the rest
/// goes to the scheduler. Reports the worker lost when the stream ends.
async fn pump_events(
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    generation: u64,
    scheduler: Arc<Scheduler>,
    pings: PendingPings,
    signals: mpsc::UnboundedSender<SupervisorSignal>,
) {
    let reason = loop {
        match events.recv().await {
            Some(WorkerEvent::Envelope(WorkerResponse {
                id,
                payload: WorkerPayload::Pong,
            })) => {
                let waiter = pings
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(());
                    }
                    None => debug!("[SUPERVISOR] Late pong {id}"),
                }
            }
            Some(WorkerEvent::Envelope(response)) => scheduler.handle_response(response),
            Some(WorkerEvent::Fatal(reason)) => break reason,
            None => break "Worker event stream closed".to_string(),
        }
    };
    let _ = signals.send(SupervisorSignal::WorkerLost { generation, reason });
}
