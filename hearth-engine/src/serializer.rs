//! Single-slot gate in front of the model.
//!
//! One dedicated worker thread owns the [`ModelHandle`] and is the only code
//! that ever calls `generate`. Callers wait in a FIFO queue; a caller whose
//! deadline passes while still queued is withdrawn without touching the model.
//! A call that is already running is never preempted: the slot stays occupied
//! until `generate` returns, and a result that arrives after the deadline is
//! discarded.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, TimeoutStage};
use crate::models::{GenerationControl, GenerationOutput, ModelHandle, ModelInfo};
use crate::request::{FinishReason, InferenceRequest, InferenceResult};

type Reply = Result<InferenceResult, EngineError>;

// ── Queue state ───────────────────────────────────────────────────────────

struct Job {
    ticket: u64,
    request: InferenceRequest,
    deadline: Instant,
    enqueued_at: Instant,
    cancel: CancellationToken,
    reply: oneshot::Sender<Reply>,
}

struct InFlight {
    request_id: String,
    started_at: Instant,
}

struct QueueState {
    waiting: VecDeque<Job>,
    in_flight: Option<InFlight>,
    next_ticket: u64,
    shutdown: bool,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    rejected: AtomicU64,
    expired_in_queue: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out_running: AtomicU64,
    abandoned: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct Shared {
    state: Mutex<QueueState>,
    wakeup: Condvar,
    counters: Counters,
    capacity: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove a job that has not been admitted yet. Returns whether it was
    /// still waiting.
    fn withdraw(&self, ticket: u64) -> bool {
        let mut state = self.lock();
        match state.waiting.iter().position(|job| job.ticket == ticket) {
            Some(pos) => {
                state.waiting.remove(pos);
                true
            }
            None => false,
        }
    }
}

// ── Stats ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SerializerStats {
    pub queue_depth: usize,
    pub capacity: usize,
    pub in_flight: bool,
    pub enqueued: u64,
    pub rejected: u64,
    pub expired_in_queue: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out_running: u64,
    pub abandoned: u64,
}

// ── Serializer ────────────────────────────────────────────────────────────

pub struct InferenceSerializer {
    shared: Arc<Shared>,
    model: ModelInfo,
}

impl std::fmt::Debug for InferenceSerializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceSerializer")
            .field("model", &self.model.name)
            .field("capacity", &self.shared.capacity)
            .field("queue_depth", &self.queue_depth())
            .finish()
    }
}

impl InferenceSerializer {
    /// Move the model onto a dedicated worker thread. `capacity` bounds the
    /// number of requests waiting for the slot (the running one excluded).
    pub fn spawn(model: ModelHandle, capacity: usize) -> Result<Self, EngineError> {
        let info = model.info().clone();
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                waiting: VecDeque::with_capacity(capacity),
                in_flight: None,
                next_ticket: 0,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
            counters: Counters::default(),
            capacity,
        });

        let worker_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("hearth-inference".to_string())
            .spawn(move || worker_loop(worker_shared, model))?;

        tracing::debug!(model = %info.name, capacity, "Inference worker spawned");
        Ok(Self {
            shared,
            model: info,
        })
    }

    /// Place a request at the back of the queue.
    ///
    /// Fails immediately with `Rejected` when the queue is full and with
    /// `Timeout` when the deadline has already passed; neither case ever
    /// reaches the model.
    pub fn enqueue(&self, request: InferenceRequest, deadline: Instant) -> Result<Ticket, EngineError> {
        let now = Instant::now();
        if deadline <= now {
            bump(&self.shared.counters.expired_in_queue);
            return Err(EngineError::Timeout {
                stage: TimeoutStage::Queued,
                elapsed_ms: 0,
            });
        }

        let mut state = self.shared.lock();
        if state.shutdown {
            return Err(EngineError::ShuttingDown);
        }
        if state.waiting.len() >= self.shared.capacity {
            drop(state);
            bump(&self.shared.counters.rejected);
            return Err(EngineError::Rejected {
                capacity: self.shared.capacity,
            });
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        let (reply_tx, reply_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let request_id = request.id.clone();
        state.waiting.push_back(Job {
            ticket,
            request,
            deadline,
            enqueued_at: now,
            cancel: cancel.clone(),
            reply: reply_tx,
        });
        let queue_depth = state.waiting.len();
        drop(state);

        self.shared.wakeup.notify_one();
        bump(&self.shared.counters.enqueued);
        tracing::debug!(request_id = %request_id, ticket, queue_depth, "Request queued");

        Ok(Ticket {
            shared: Arc::clone(&self.shared),
            ticket,
            request_id,
            deadline,
            enqueued_at: now,
            reply: reply_rx,
            cancel,
            settled: false,
        })
    }

    /// Enqueue and wait for the outcome.
    pub async fn run(&self, request: InferenceRequest, deadline: Instant) -> Reply {
        self.enqueue(request, deadline)?.wait().await
    }

    pub fn model(&self) -> &ModelInfo {
        &self.model
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.lock().waiting.len()
    }

    /// Whether a `generate` call is currently running.
    pub fn is_busy(&self) -> bool {
        self.shared.lock().in_flight.is_some()
    }

    /// Request id occupying the slot and how long it has been running.
    pub fn in_flight_request(&self) -> Option<(String, Duration)> {
        self.shared
            .lock()
            .in_flight
            .as_ref()
            .map(|f| (f.request_id.clone(), f.started_at.elapsed()))
    }

    pub fn stats(&self) -> SerializerStats {
        let (queue_depth, in_flight) = {
            let state = self.shared.lock();
            (state.waiting.len(), state.in_flight.is_some())
        };
        let c = &self.shared.counters;
        SerializerStats {
            queue_depth,
            capacity: self.shared.capacity,
            in_flight,
            enqueued: c.enqueued.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            expired_in_queue: c.expired_in_queue.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            timed_out_running: c.timed_out_running.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
        }
    }

    /// Stop admitting work. Waiting requests fail with `ShuttingDown`; the
    /// running call, if any, completes and its caller gets the result.
    pub fn shutdown(&self) {
        let drained: Vec<Job> = {
            let mut state = self.shared.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.waiting.drain(..).collect()
        };
        self.shared.wakeup.notify_all();

        if !drained.is_empty() {
            tracing::info!(drained = drained.len(), "Failing queued requests on shutdown");
        }
        for job in drained {
            let _ = job.reply.send(Err(EngineError::ShuttingDown));
        }
    }
}

impl Drop for InferenceSerializer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Ticket ────────────────────────────────────────────────────────────────

/// A caller's place in the queue.
///
/// Dropping an unsettled ticket withdraws the request if it is still waiting
/// and asks a running generation to stop at its next token boundary.
pub struct Ticket {
    shared: Arc<Shared>,
    ticket: u64,
    request_id: String,
    deadline: Instant,
    enqueued_at: Instant,
    reply: oneshot::Receiver<Reply>,
    cancel: CancellationToken,
    settled: bool,
}

impl Ticket {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the outcome.
    ///
    /// If the deadline passes while still queued, returns `Timeout` at the
    /// deadline. If the request is already running, waits for the call to
    /// return; the worker then reports `Timeout` in place of the late result.
    pub async fn wait(mut self) -> Reply {
        let deadline = tokio::time::Instant::from_std(self.deadline);
        let received = match tokio::time::timeout_at(deadline, &mut self.reply).await {
            Ok(received) => received,
            Err(_) => {
                if self.shared.withdraw(self.ticket) {
                    self.settled = true;
                    bump(&self.shared.counters.expired_in_queue);
                    let elapsed_ms = self.enqueued_at.elapsed().as_millis() as u64;
                    tracing::debug!(request_id = %self.request_id, elapsed_ms, "Deadline passed while queued");
                    return Err(EngineError::Timeout {
                        stage: TimeoutStage::Queued,
                        elapsed_ms,
                    });
                }
                (&mut self.reply).await
            }
        };
        self.settled = true;
        received.unwrap_or_else(|_| Err(EngineError::ShuttingDown))
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if self.shared.withdraw(self.ticket) {
            tracing::debug!(request_id = %self.request_id, "Caller left while queued");
        }
        self.cancel.cancel();
    }
}

// ── Worker ────────────────────────────────────────────────────────────────

fn worker_loop(shared: Arc<Shared>, mut model: ModelHandle) {
    tracing::debug!("Inference worker started");

    while let Some(job) = next_job(&shared) {
        let Job {
            ticket,
            request,
            deadline,
            enqueued_at,
            cancel,
            reply,
        } = job;
        let queued_for = enqueued_at.elapsed();
        let control = GenerationControl::new(deadline, cancel);

        tracing::debug!(request_id = %request.id, ticket, queued_ms = queued_for.as_millis() as u64, "Inference started");
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| model.generate(&request, &control)))
            .unwrap_or_else(|payload| {
                Err(EngineError::Inference(format!(
                    "model panicked: {}",
                    panic_message(payload.as_ref())
                )))
            });
        let elapsed = started.elapsed();

        shared.lock().in_flight = None;

        let result = settle(&shared, &request, deadline, enqueued_at, queued_for, elapsed, outcome);
        if reply.send(result).is_err() {
            bump(&shared.counters.abandoned);
            tracing::debug!(request_id = %request.id, "Caller gone; result discarded");
        }
    }

    tracing::debug!("Inference worker stopped");
}

/// Block until there is an admissible job or the serializer shuts down.
fn next_job(shared: &Shared) -> Option<Job> {
    let mut state = shared.lock();
    loop {
        if state.shutdown {
            return None;
        }
        while let Some(job) = state.waiting.pop_front() {
            if Instant::now() >= job.deadline {
                bump(&shared.counters.expired_in_queue);
                let elapsed_ms = job.enqueued_at.elapsed().as_millis() as u64;
                let _ = job.reply.send(Err(EngineError::Timeout {
                    stage: TimeoutStage::Queued,
                    elapsed_ms,
                }));
                continue;
            }
            state.in_flight = Some(InFlight {
                request_id: job.request.id.clone(),
                started_at: Instant::now(),
            });
            return Some(job);
        }
        state = shared
            .wakeup
            .wait(state)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

fn settle(
    shared: &Shared,
    request: &InferenceRequest,
    deadline: Instant,
    enqueued_at: Instant,
    queued_for: Duration,
    elapsed: Duration,
    outcome: Result<GenerationOutput, EngineError>,
) -> Reply {
    match outcome {
        Err(e) => {
            bump(&shared.counters.failed);
            tracing::warn!(request_id = %request.id, error = %e, "Inference failed");
            Err(e)
        }
        Ok(output) if output.finish_reason == FinishReason::Timeout || Instant::now() >= deadline => {
            bump(&shared.counters.timed_out_running);
            let elapsed_ms = enqueued_at.elapsed().as_millis() as u64;
            tracing::info!(request_id = %request.id, elapsed_ms, "Deadline passed while running; result discarded");
            Err(EngineError::Timeout {
                stage: TimeoutStage::Running,
                elapsed_ms,
            })
        }
        Ok(output) => {
            bump(&shared.counters.completed);
            tracing::info!(
                request_id = %request.id,
                tokens = output.completion_tokens,
                elapsed_ms = elapsed.as_millis() as u64,
                finish_reason = output.finish_reason.as_str(),
                "Inference completed"
            );
            Ok(InferenceResult {
                id: request.id.clone(),
                text: output.text,
                prompt_tokens: output.prompt_tokens,
                tokens_generated: output.completion_tokens,
                finish_reason: output.finish_reason,
                elapsed,
                queued_for,
            })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
