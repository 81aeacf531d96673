use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use hearth_resilience::{HealthMonitor, HealthState, RateWindow, WindowStats};
use serde::Serialize;

use crate::error::{EngineError, TimeoutStage};
use crate::request::{InferenceRequest, InferenceResult};
use crate::serializer::{InferenceSerializer, SerializerStats};

// ── Configuration ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct GateConfig {
    /// Requests allowed to wait for the inference slot.
    pub queue_capacity: usize,
    pub default_timeout: Duration,
    /// Upper bound for a caller-supplied timeout.
    pub max_timeout: Duration,
    /// Span of the rolling rejection window.
    pub overload_window: Duration,
    /// Rejection ratio above which the window counts as overloaded.
    pub overload_reject_ratio: f64,
    /// Decisions needed in the window before it can count as overloaded.
    pub overload_min_samples: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 8,
            default_timeout: Duration::from_secs(120),
            max_timeout: Duration::from_secs(300),
            overload_window: Duration::from_secs(30),
            overload_reject_ratio: 0.5,
            overload_min_samples: 5,
        }
    }
}

// ── Stats ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct GateCounters {
    submitted: AtomicU64,
    invalid: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
    failed: AtomicU64,
    completed: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GateStats {
    pub submitted: u64,
    pub invalid: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub failed: u64,
    pub completed: u64,
    pub window_total: usize,
    pub window_rejected: usize,
    pub serializer: SerializerStats,
}

// ── Gate ──────────────────────────────────────────────────────────────────

/// Admission control in front of the Inference Serializer.
///
/// Stamps each request's deadline, rejects outright when the waiting queue
/// is full, and turns admission outcomes into health signals.
pub struct RequestGate {
    serializer: InferenceSerializer,
    health: Arc<HealthMonitor>,
    config: GateConfig,
    window: Mutex<RateWindow>,
    counters: GateCounters,
}

impl std::fmt::Debug for RequestGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGate")
            .field("config", &self.config)
            .field("serializer", &self.serializer)
            .finish()
    }
}

impl RequestGate {
    pub fn new(serializer: InferenceSerializer, health: Arc<HealthMonitor>, config: GateConfig) -> Self {
        let window = Mutex::new(RateWindow::new(config.overload_window));
        Self {
            serializer,
            health,
            config,
            window,
            counters: GateCounters::default(),
        }
    }

    /// Spawn the serializer for `model` and put a gate in front of it.
    pub fn start(
        model: crate::models::ModelHandle,
        health: Arc<HealthMonitor>,
        config: GateConfig,
    ) -> Result<Self, EngineError> {
        let serializer = InferenceSerializer::spawn(model, config.queue_capacity)?;
        Ok(Self::new(serializer, health, config))
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn serializer(&self) -> &InferenceSerializer {
        &self.serializer
    }

    /// The timeout a request will get: its own, capped, or the default.
    pub fn resolve_timeout(&self, requested: Option<Duration>) -> Duration {
        requested
            .map(|t| t.min(self.config.max_timeout))
            .unwrap_or(self.config.default_timeout)
    }

    /// Admit a request and wait for its result.
    pub async fn submit(&self, request: InferenceRequest) -> Result<InferenceResult, EngineError> {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let state = self.health.state();
        if state == HealthState::Loading {
            return Err(EngineError::NotReady(format!("model is {state}")));
        }

        let context_length = self.serializer.model().params.context_length;
        if let Err(reason) = request.params.validate(context_length) {
            self.counters.invalid.fetch_add(1, Ordering::Relaxed);
            return Err(EngineError::InvalidRequest(reason));
        }

        let timeout = self.resolve_timeout(request.timeout);
        let admitted_at = Instant::now();
        let deadline = admitted_at + timeout;
        let request_id = request.id.clone();

        if timeout.is_zero() {
            self.record_decision(admitted_at, false);
            self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(request_id = %request_id, "Zero timeout; not admitted");
            return Err(EngineError::Timeout {
                stage: TimeoutStage::Queued,
                elapsed_ms: 0,
            });
        }

        let ticket = match self.serializer.enqueue(request, deadline) {
            Ok(ticket) => {
                self.record_decision(admitted_at, false);
                ticket
            }
            Err(e @ EngineError::Rejected { .. }) => {
                self.record_decision(admitted_at, true);
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    request_id = %request_id,
                    capacity = self.serializer.capacity(),
                    "Queue full; request rejected"
                );
                return Err(e);
            }
            Err(e) => {
                if matches!(e, EngineError::Timeout { .. }) {
                    self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                }
                return Err(e);
            }
        };

        let outcome = ticket.wait().await;
        match &outcome {
            Ok(_) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                self.health.record_inference_success();
            }
            Err(EngineError::Inference(_)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.health.record_inference_failure();
            }
            Err(EngineError::Timeout { .. }) => {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {}
        }
        outcome
    }

    /// Re-evaluate the window without a new decision, so `Overloaded` can
    /// recover once traffic stops. Called on a timer.
    pub fn evaluate_load(&self) -> HealthState {
        let stats = self.lock_window().stats(Instant::now());
        self.signal(stats)
    }

    pub fn stats(&self) -> GateStats {
        let window = self.lock_window().stats(Instant::now());
        let c = &self.counters;
        GateStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            invalid: c.invalid.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            window_total: window.total,
            window_rejected: window.rejected,
            serializer: self.serializer.stats(),
        }
    }

    /// Stop admitting work and fail everything still waiting.
    pub fn shutdown(&self) {
        self.serializer.shutdown();
    }

    fn record_decision(&self, at: Instant, rejected: bool) {
        let stats = {
            let mut window = self.lock_window();
            window.record(at, rejected);
            window.stats(at)
        };
        self.signal(stats);
    }

    fn signal(&self, stats: WindowStats) -> HealthState {
        if stats.exceeds(self.config.overload_reject_ratio, self.config.overload_min_samples) {
            self.health.signal_overload()
        } else {
            self.health.signal_underload()
        }
    }

    fn lock_window(&self) -> std::sync::MutexGuard<'_, RateWindow> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
