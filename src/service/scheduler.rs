//! Request scheduler.
//!
//! Holds the priority queue and the active set for requests bound for the
//! compute worker. Ordering is `(priority desc, submission asc)`; at most
//! `max_concurrency` requests are dispatched at once and a free slot is
//! refilled as soon as one opens.
//!
//! All state sits behind a single mutex. No method blocks or awaits while
//! holding it: sends to the worker link and to callers' continuations are
//! non-blocking channel pushes.
//!
//! Every submission gets its own correlation id. Callers that retry submit
//! again and get a fresh id, so a late envelope from an abandoned attempt can
//! never complete a newer one.
//!
//! A request abandoned while dispatched (timeout, unacknowledged cancel) is
//! rejected at once but its id is retired, not forgotten: the worker job may
//! still be running, so the id keeps its slot until the worker's terminal
//! envelope for it arrives or the worker is replaced. Retired ids therefore
//! never outnumber `max_concurrency`.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use log::{debug, info, warn};
use offline_translate_types::{
    ErrorKind, ProgressEvent, TranslateError, TranslatePayload, TranslationOutput,
    WorkerCommand, WorkerPayload, WorkerRequest, WorkerResponse,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use uuid::Uuid;

use super::supervisor::SupervisorSignal;

/// Added to the priority of every request carried over a worker restart.
pub const RECOVERY_PRIORITY_BOOST: i32 = 100;

pub type TranslationOutcome = Result<TranslationOutput, TranslateError>;

/// Progress callback registered by callers.
pub type ProgressListener = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Listener list shared between the service facade and the scheduler.
pub type SharedListeners = Arc<RwLock<Vec<ProgressListener>>>;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Upper bound from configuration; the worker may lower it at attach.
    pub max_concurrency: usize,
    pub default_timeout: Duration,
    pub cancel_ack_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerStatus {
    pub queue_length: usize,
    pub active_count: usize,
    /// Slots held by abandoned requests whose worker job has not answered.
    pub retired_count: usize,
    /// A worker is attached and there is queued or active work.
    pub draining: bool,
    pub protocol_violations: u64,
}

/// Queue ordering key: highest priority first, then submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<i32>,
    seq: u64,
}

struct QueuedRequest {
    id: String,
    /// Caller-visible id, used for progress events.
    request_id: String,
    payload: TranslatePayload,
    priority: i32,
    seq: u64,
    enqueued_at: Instant,
    responder: oneshot::Sender<TranslationOutcome>,
    timeout: Duration,
    timer: Option<AbortHandle>,
}

impl QueuedRequest {
    fn key(&self) -> QueueKey {
        QueueKey {
            priority: Reverse(self.priority),
            seq: self.seq,
        }
    }

    fn finish(mut self, outcome: TranslationOutcome) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let _ = self.responder.send(outcome);
    }
}

struct ActiveRequest {
    entry: QueuedRequest,
    dispatched_at: Instant,
    /// Set once a cancel envelope has been sent; holds the ack timer.
    cancelling: Option<AbortHandle>,
}

impl ActiveRequest {
    fn finish(mut self, outcome: TranslationOutcome) {
        if let Some(timer) = self.cancelling.take() {
            timer.abort();
            let request_id = self.entry.request_id.clone();
            self.entry.finish(Err(TranslateError::cancelled(&request_id)));
        } else {
            self.entry.finish(outcome);
        }
    }
}

#[derive(Default)]
struct State {
    queue: BTreeMap<QueueKey, QueuedRequest>,
    index: HashMap<String, QueueKey>,
    active: HashMap<String, ActiveRequest>,
    /// Ids abandoned while dispatched, with the time they were abandoned.
    /// Each still occupies a slot until its terminal envelope arrives.
    retired: HashMap<String, Instant>,
    link: Option<Sender<WorkerRequest>>,
    max_concurrency: usize,
    next_seq: u64,
    protocol_violations: u64,
}

impl State {
    fn enqueue(&mut self, entry: QueuedRequest) {
        let key = entry.key();
        self.index.insert(entry.id.clone(), key);
        self.queue.insert(key, entry);
    }

    fn dequeue(&mut self, id: &str) -> Option<QueuedRequest> {
        let key = self.index.remove(id)?;
        self.queue.remove(&key)
    }

    fn send_cancel(&self, id: &str) {
        if let Some(link) = &self.link {
            let _ = link.send(WorkerRequest::new(id, WorkerCommand::Cancel));
        }
    }

    fn occupied(&self) -> usize {
        self.active.len() + self.retired.len()
    }

    /// Keep a dispatched id's slot until the worker answers for it. Without
    /// a worker there is nobody left to answer.
    fn retire(&mut self, id: &str) {
        if self.link.is_some() {
            self.retired.insert(id.to_string(), Instant::now());
        }
    }
}

/// Future returned by [`Scheduler::submit`].
pub struct PendingTranslation {
    id: String,
    rx: oneshot::Receiver<TranslationOutcome>,
}

impl PendingTranslation {
    /// Correlation id of this submission.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for PendingTranslation {
    type Output = TranslationOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(TranslateError::communication(format!(
                "Request {} was dropped without a response",
                self.id
            )))),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct Scheduler {
    state: Mutex<State>,
    options: SchedulerOptions,
    listeners: SharedListeners,
    signals: mpsc::UnboundedSender<SupervisorSignal>,
    this: Weak<Scheduler>,
}

impl Scheduler {
    pub fn new(
        options: SchedulerOptions,
        listeners: SharedListeners,
        signals: mpsc::UnboundedSender<SupervisorSignal>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            state: Mutex::new(State {
                max_concurrency: options.max_concurrency.max(1),
                ..State::default()
            }),
            options,
            listeners,
            signals,
            this: this.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a request. Must be called from within a tokio runtime: the
    /// request's timeout runs as a task.
    pub fn submit(
        &self,
        request_id: &str,
        payload: TranslatePayload,
        priority: i32,
    ) -> PendingTranslation {
        let id = Uuid::new_v4().to_string();
        let timeout = payload
            .options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.options.default_timeout);
        let (responder, rx) = oneshot::channel();

        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        let entry = QueuedRequest {
            id: id.clone(),
            request_id: request_id.to_string(),
            payload,
            priority,
            seq,
            enqueued_at: Instant::now(),
            responder,
            timeout,
            timer: Some(self.start_timer(timeout, &id, Self::expire)),
        };
        debug!(
            "[SCHEDULER] Queued {id} (request {request_id}, priority {priority}, {} ahead)",
            state.queue.len()
        );
        state.enqueue(entry);
        self.pump(&mut state);

        PendingTranslation { id, rx }
    }

    fn start_timer(&self, after: Duration, id: &str, on_fire: fn(&Self, &str)) -> AbortHandle {
        let this = self.this.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(scheduler) = this.upgrade() {
                on_fire(&scheduler, &id);
            }
        })
        .abort_handle()
    }

    /// Dispatch queued work while slots are free and a worker is attached.
    fn pump(&self, state: &mut State) {
        let Some(link) = state.link.clone() else {
            return;
        };
        while state.occupied() < state.max_concurrency {
            let Some((_, entry)) = state.queue.pop_first() else {
                break;
            };
            state.index.remove(&entry.id);

            let request =
                WorkerRequest::new(&entry.id, WorkerCommand::Translate(entry.payload.clone()));
            if link.send(request).is_err() {
                warn!(
                    "[SCHEDULER] Worker link closed, holding {} queued requests",
                    state.queue.len() + 1
                );
                state.link = None;
                state.enqueue(entry);
                break;
            }
            debug!(
                "[SCHEDULER] Dispatched {} (priority {}) after {}ms in queue",
                entry.id,
                entry.priority,
                entry.enqueued_at.elapsed().as_millis()
            );
            state.active.insert(
                entry.id.clone(),
                ActiveRequest {
                    entry,
                    dispatched_at: Instant::now(),
                    cancelling: None,
                },
            );
        }
    }

    /// Route a worker envelope. `pong` and `ready` are handled by the
    /// supervisor and count as violations here.
    pub fn handle_response(&self, response: WorkerResponse) {
        let WorkerResponse { id, payload } = response;
        match payload {
            WorkerPayload::Progress(progress) => {
                let request_id = self
                    .lock()
                    .active
                    .get(&id)
                    .map(|active| active.entry.request_id.clone());
                match request_id {
                    Some(request_id) => {
                        self.emit_progress(&ProgressEvent::from_payload(request_id, progress));
                    }
                    None => debug!("[SCHEDULER] Dropping progress for inactive {id}"),
                }
            }
            WorkerPayload::Result(output) => self.complete(&id, Ok(output)),
            WorkerPayload::Error(error) => self.complete(&id, Err(error)),
            other @ (WorkerPayload::Ready(_) | WorkerPayload::Pong) => {
                self.protocol_violation(&id, other.kind_name());
            }
        }
    }

    fn complete(&self, id: &str, outcome: TranslationOutcome) {
        let mut state = self.lock();
        let Some(active) = state.active.remove(id) else {
            if let Some(retired_at) = state.retired.remove(id) {
                debug!(
                    "[SCHEDULER] Late response for retired {id} after {}ms, slot freed",
                    retired_at.elapsed().as_millis()
                );
                self.pump(&mut state);
            } else {
                drop(state);
                self.protocol_violation(id, if outcome.is_ok() { "result" } else { "error" });
            }
            return;
        };
        match &outcome {
            Ok(_) => info!(
                "[SCHEDULER] Completed {id} in {}ms",
                active.dispatched_at.elapsed().as_millis()
            ),
            Err(e) => info!("[SCHEDULER] Failed {id}: {e}"),
        }
        active.finish(outcome);
        self.pump(&mut state);
    }

    fn protocol_violation(&self, id: &str, kind: &str) {
        let mut state = self.lock();
        state.protocol_violations += 1;
        warn!(
            "[SCHEDULER] Protocol violation #{}: '{kind}' envelope for unknown id '{id}'",
            state.protocol_violations
        );
    }

    fn emit_progress(&self, event: &ProgressEvent) {
        let listeners: Vec<ProgressListener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(event);
        }
    }

    /// Cancel a submission by correlation id. Returns whether a live,
    /// not-yet-cancelled request was found.
    ///
    /// A queued request is rejected immediately. A dispatched one is
    /// rejected on the worker's acknowledgment or after the ack timeout,
    /// and keeps its slot until then.
    pub fn cancel(&self, id: &str) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;

        if let Some(entry) = state.dequeue(id) {
            info!("[SCHEDULER] Cancelled queued {id}");
            let request_id = entry.request_id.clone();
            entry.finish(Err(TranslateError::cancelled(&request_id)));
            return true;
        }

        let Some(active) = state.active.get_mut(id) else {
            return false;
        };
        if active.cancelling.is_some() {
            return false;
        }
        if state.link.is_none() {
            if let Some(active) = state.active.remove(id) {
                let request_id = active.entry.request_id.clone();
                active.entry.finish(Err(TranslateError::cancelled(&request_id)));
            }
            return true;
        }

        info!("[SCHEDULER] Cancelling dispatched {id}");
        active.cancelling = Some(self.start_timer(
            self.options.cancel_ack_timeout,
            id,
            Self::cancel_ack_expired,
        ));
        state.send_cancel(id);
        true
    }

    fn cancel_ack_expired(&self, id: &str) {
        let mut state = self.lock();
        let Some(active) = state.active.remove(id) else {
            return;
        };
        warn!("[SCHEDULER] No cancel acknowledgment for {id}, rejecting");
        state.retire(id);
        let request_id = active.entry.request_id.clone();
        active.entry.finish(Err(TranslateError::cancelled(&request_id)));
        self.pump(&mut state);
    }

    fn expire(&self, id: &str) {
        let mut state = self.lock();
        if let Some(mut entry) = state.dequeue(id) {
            warn!("[SCHEDULER] {id} timed out in queue");
            entry.timer = None;
            let error = TranslateError::timeout(&entry.request_id, entry.timeout.as_millis() as u64);
            entry.finish(Err(error));
            return;
        }
        let Some(mut active) = state.active.remove(id) else {
            return;
        };
        warn!("[SCHEDULER] {id} timed out waiting for the worker");
        active.entry.timer = None;
        if active.cancelling.is_none() {
            state.send_cancel(id);
        }
        state.retire(id);
        let error = TranslateError::timeout(
            &active.entry.request_id,
            active.entry.timeout.as_millis() as u64,
        );
        active.finish(Err(error));
        self.pump(&mut state);
    }

    /// Reject everything queued or active with `error`. Returns the count.
    pub fn reject_all(&self, error: impl Fn(&str) -> TranslateError) -> usize {
        let mut state = self.lock();
        let queued = std::mem::take(&mut state.queue);
        state.index.clear();
        let active: Vec<(String, ActiveRequest)> = state.active.drain().collect();
        let count = queued.len() + active.len();
        for (_, entry) in queued {
            let e = error(&entry.request_id);
            entry.finish(Err(e));
        }
        for (id, mut active) in active {
            // The worker may still answer; that answer is expected.
            if active.cancelling.is_none() {
                state.send_cancel(&id);
            }
            state.retire(&id);
            if let Some(timer) = active.cancelling.take() {
                timer.abort();
            }
            let e = error(&active.entry.request_id);
            active.entry.finish(Err(e));
        }
        count
    }

    /// Reject everything with `RESET` and ask the supervisor for a fresh
    /// worker. The receiver resolves once the worker is back.
    pub fn reset_all(&self) -> oneshot::Receiver<Result<(), TranslateError>> {
        let rejected = self.reject_all(|_| TranslateError::reset());
        info!("[SCHEDULER] Reset: rejected {rejected} requests");
        let (done, rx) = oneshot::channel();
        let _ = self.signals.send(SupervisorSignal::Restart {
            recover: false,
            done: Some(done),
        });
        rx
    }

    /// Reject everything with a fatal `WORKER_INITIALIZATION_FAILED`.
    pub fn fail_all(&self, reason: &str) -> usize {
        self.reject_all(|_| TranslateError::new(ErrorKind::WorkerInitializationFailed, reason))
    }

    /// Start dispatching to a worker. Effective concurrency is the smaller
    /// of the configured limit and what the worker advertises.
    pub fn attach(&self, link: Sender<WorkerRequest>, worker_max_concurrency: usize) {
        let mut state = self.lock();
        state.max_concurrency = self
            .options
            .max_concurrency
            .min(worker_max_concurrency)
            .max(1);
        info!(
            "[SCHEDULER] Worker attached (concurrency {}, {} queued)",
            state.max_concurrency,
            state.queue.len()
        );
        state.link = Some(link);
        state.retired.clear();
        self.pump(&mut state);
    }

    /// Stop dispatching. Active requests stay where they are.
    pub fn detach(&self) {
        let mut state = self.lock();
        state.link = None;
        state.retired.clear();
    }

    /// Stop dispatching and move every in-flight request back into the
    /// queue, raising every queued request's priority by `boost`. Requests
    /// that were being cancelled are rejected with `CANCELLED` instead.
    /// Returns how many requests will be replayed.
    pub fn detach_for_recovery(&self, boost: i32) -> usize {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.link = None;
        state.retired.clear();

        let queued = std::mem::take(&mut state.queue);
        state.index.clear();
        let mut snapshot: Vec<QueuedRequest> = queued.into_values().collect();
        for (id, active) in state.active.drain() {
            match active.cancelling {
                Some(timer) => {
                    timer.abort();
                    debug!("[SCHEDULER] Dropping {id} from recovery, it was being cancelled");
                    let request_id = active.entry.request_id.clone();
                    active.entry.finish(Err(TranslateError::cancelled(&request_id)));
                }
                None => snapshot.push(active.entry),
            }
        }

        let count = snapshot.len();
        for mut entry in snapshot {
            entry.priority = entry.priority.saturating_add(boost);
            state.enqueue(entry);
        }
        info!("[SCHEDULER] Recovery snapshot: {count} requests re-queued with +{boost} priority");
        count
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = self.lock();
        let queue_length = state.queue.len();
        let active_count = state.active.len();
        SchedulerStatus {
            queue_length,
            active_count,
            retired_count: state.retired.len(),
            draining: state.link.is_some() && queue_length + active_count > 0,
            protocol_violations: state.protocol_violations,
        }
    }

    /// How long the oldest retired slot has been waiting for the worker.
    /// A long wait means a job is stuck past its deadline.
    pub fn stalled_for(&self) -> Option<Duration> {
        self.lock()
            .retired
            .values()
            .map(|retired_at| retired_at.elapsed())
            .max()
    }

    /// Queued correlation ids with their current priority, in dispatch order.
    pub fn queue_snapshot(&self) -> Vec<(String, i32)> {
        self.lock()
            .queue
            .values()
            .map(|entry| (entry.id.clone(), entry.priority))
            .collect()
    }
}
