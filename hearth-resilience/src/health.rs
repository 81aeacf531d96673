use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

// ── Health state ──────────────────────────────────────────────────────────

/// Process lifecycle state as reported to the health-check boundary.
///
/// `Loading -> Ready` once the model is in memory, `Loading -> Unhealthy` if it
/// never gets there. `Ready <-> Overloaded` follows sustained admission
/// pressure. `Unhealthy` is terminal for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Loading,
    Ready,
    Overloaded,
    Unhealthy,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Overloaded => "overloaded",
            Self::Unhealthy => "unhealthy",
        }
    }

    /// Whether the health boundary answers with a success status.
    pub fn is_serving(&self) -> bool {
        matches!(self, Self::Ready | Self::Overloaded)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Unhealthy)
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Policy ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    /// Consecutive overload (or underload) signals required to flip between
    /// `Ready` and `Overloaded`.
    pub overload_hysteresis: u32,
    /// Consecutive inference failures that make the process `Unhealthy`.
    pub failure_threshold: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            overload_hysteresis: 3,
            failure_threshold: 5,
        }
    }
}

// ── Snapshot ──────────────────────────────────────────────────────────────

/// Point-in-time view of the monitor, cheap to clone into a response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub state: HealthState,
    pub in_state_secs: u64,
    pub uptime_secs: u64,
    pub consecutive_failures: u32,
    pub transitions: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ── Monitor ───────────────────────────────────────────────────────────────

struct Inner {
    state: HealthState,
    entered_at: Instant,
    overload_streak: u32,
    underload_streak: u32,
    consecutive_failures: u32,
    transitions: u64,
    reason: Option<String>,
}

/// Owner of the service health state. All mutation goes through the signal
/// methods below; nothing else writes the state.
pub struct HealthMonitor {
    policy: HealthPolicy,
    started_at: Instant,
    inner: Mutex<Inner>,
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("policy", &self.policy)
            .field("state", &self.state())
            .finish()
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthPolicy::default())
    }
}

impl HealthMonitor {
    /// Create a monitor in the `Loading` state.
    pub fn new(policy: HealthPolicy) -> Self {
        let now = Instant::now();
        Self {
            policy: HealthPolicy {
                overload_hysteresis: policy.overload_hysteresis.max(1),
                failure_threshold: policy.failure_threshold.max(1),
            },
            started_at: now,
            inner: Mutex::new(Inner {
                state: HealthState::Loading,
                entered_at: now,
                overload_streak: 0,
                underload_streak: 0,
                consecutive_failures: 0,
                transitions: 0,
                reason: None,
            }),
        }
    }

    pub fn policy(&self) -> HealthPolicy {
        self.policy
    }

    pub fn state(&self) -> HealthState {
        self.lock().state
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Model load finished. Only valid from `Loading`; returns whether the
    /// transition happened.
    pub fn mark_ready(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != HealthState::Loading {
            return false;
        }
        transition(&mut inner, HealthState::Ready, None);
        true
    }

    /// Model load failed. Terminal.
    pub fn mark_load_failed(&self, reason: impl Into<String>) {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return;
        }
        transition(&mut inner, HealthState::Unhealthy, Some(reason.into()));
    }

    /// The admission window saw sustained rejection.
    pub fn signal_overload(&self) -> HealthState {
        let mut inner = self.lock();
        match inner.state {
            HealthState::Ready => {
                inner.underload_streak = 0;
                inner.overload_streak += 1;
                if inner.overload_streak >= self.policy.overload_hysteresis {
                    let reason = format!(
                        "{} consecutive overload signals",
                        inner.overload_streak
                    );
                    transition(&mut inner, HealthState::Overloaded, Some(reason));
                }
            }
            HealthState::Overloaded => {
                inner.underload_streak = 0;
            }
            HealthState::Loading | HealthState::Unhealthy => {}
        }
        inner.state
    }

    /// The admission window is back under the rejection threshold.
    pub fn signal_underload(&self) -> HealthState {
        let mut inner = self.lock();
        match inner.state {
            HealthState::Overloaded => {
                inner.overload_streak = 0;
                inner.underload_streak += 1;
                if inner.underload_streak >= self.policy.overload_hysteresis {
                    transition(&mut inner, HealthState::Ready, None);
                }
            }
            HealthState::Ready => {
                inner.overload_streak = 0;
            }
            HealthState::Loading | HealthState::Unhealthy => {}
        }
        inner.state
    }

    /// A request ended in an inference error. Timeouts and rejections must not
    /// be reported here.
    pub fn record_inference_failure(&self) -> HealthState {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        if inner.state.is_serving() && inner.consecutive_failures >= self.policy.failure_threshold
        {
            let reason = format!(
                "{} consecutive inference failures",
                inner.consecutive_failures
            );
            transition(&mut inner, HealthState::Unhealthy, Some(reason));
        }
        inner.state
    }

    /// A request completed. Resets the failure streak; never leaves `Unhealthy`.
    pub fn record_inference_success(&self) {
        self.lock().consecutive_failures = 0;
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let inner = self.lock();
        HealthSnapshot {
            state: inner.state,
            in_state_secs: inner.entered_at.elapsed().as_secs(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            consecutive_failures: inner.consecutive_failures,
            transitions: inner.transitions,
            reason: inner.reason.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn transition(inner: &mut Inner, to: HealthState, reason: Option<String>) {
    let from = inner.state;
    match to {
        HealthState::Unhealthy => {
            tracing::error!(%from, %to, reason = reason.as_deref().unwrap_or(""), "Health transition")
        }
        HealthState::Overloaded => {
            tracing::warn!(%from, %to, reason = reason.as_deref().unwrap_or(""), "Health transition")
        }
        _ => tracing::info!(%from, %to, "Health transition"),
    }
    inner.state = to;
    inner.entered_at = Instant::now();
    inner.overload_streak = 0;
    inner.underload_streak = 0;
    inner.transitions += 1;
    inner.reason = reason;
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_monitor(hysteresis: u32, failures: u32) -> HealthMonitor {
        let monitor = HealthMonitor::new(HealthPolicy {
            overload_hysteresis: hysteresis,
            failure_threshold: failures,
        });
        assert!(monitor.mark_ready());
        monitor
    }

    // ── lifecycle ────────────────────────────────────────────────────────

    #[test]
    fn starts_loading_and_not_serving() {
        let monitor = HealthMonitor::default();
        assert_eq!(monitor.state(), HealthState::Loading);
        assert!(!monitor.state().is_serving());
    }

    #[test]
    fn load_success_goes_ready_once() {
        let monitor = HealthMonitor::default();
        assert!(monitor.mark_ready());
        assert_eq!(monitor.state(), HealthState::Ready);
        assert!(!monitor.mark_ready());
        assert_eq!(monitor.snapshot().transitions, 1);
    }

    #[test]
    fn load_failure_is_terminal() {
        let monitor = HealthMonitor::default();
        monitor.mark_load_failed("model file not found");
        assert_eq!(monitor.state(), HealthState::Unhealthy);
        assert!(!monitor.mark_ready());
        assert_eq!(monitor.state(), HealthState::Unhealthy);
        assert_eq!(
            monitor.snapshot().reason.as_deref(),
            Some("model file not found")
        );
    }

    #[test]
    fn signals_ignored_while_loading() {
        let monitor = HealthMonitor::new(HealthPolicy {
            overload_hysteresis: 1,
            failure_threshold: 1,
        });
        assert_eq!(monitor.signal_overload(), HealthState::Loading);
        assert_eq!(monitor.record_inference_failure(), HealthState::Loading);
    }

    // ── overload hysteresis ──────────────────────────────────────────────

    #[test]
    fn overload_requires_consecutive_signals() {
        let monitor = ready_monitor(3, 5);
        assert_eq!(monitor.signal_overload(), HealthState::Ready);
        assert_eq!(monitor.signal_overload(), HealthState::Ready);
        assert_eq!(monitor.signal_overload(), HealthState::Overloaded);
    }

    #[test]
    fn underload_breaks_overload_streak() {
        let monitor = ready_monitor(3, 5);
        monitor.signal_overload();
        monitor.signal_overload();
        monitor.signal_underload();
        monitor.signal_overload();
        monitor.signal_overload();
        assert_eq!(monitor.state(), HealthState::Ready);
        monitor.signal_overload();
        assert_eq!(monitor.state(), HealthState::Overloaded);
    }

    #[test]
    fn recovery_requires_consecutive_underload() {
        let monitor = ready_monitor(2, 5);
        monitor.signal_overload();
        monitor.signal_overload();
        assert_eq!(monitor.state(), HealthState::Overloaded);

        monitor.signal_underload();
        monitor.signal_overload();
        monitor.signal_underload();
        assert_eq!(monitor.state(), HealthState::Overloaded);
        monitor.signal_underload();
        assert_eq!(monitor.state(), HealthState::Ready);
    }

    #[test]
    fn overloaded_still_serving() {
        let monitor = ready_monitor(1, 5);
        monitor.signal_overload();
        assert!(monitor.state().is_serving());
    }

    // ── failure escalation ───────────────────────────────────────────────

    #[test]
    fn consecutive_failures_make_unhealthy() {
        let monitor = ready_monitor(3, 3);
        monitor.record_inference_failure();
        monitor.record_inference_failure();
        assert_eq!(monitor.state(), HealthState::Ready);
        assert_eq!(monitor.record_inference_failure(), HealthState::Unhealthy);
    }

    #[test]
    fn success_resets_failure_streak() {
        let monitor = ready_monitor(3, 3);
        monitor.record_inference_failure();
        monitor.record_inference_failure();
        monitor.record_inference_success();
        monitor.record_inference_failure();
        monitor.record_inference_failure();
        assert_eq!(monitor.state(), HealthState::Ready);
        assert_eq!(monitor.snapshot().consecutive_failures, 2);
    }

    #[test]
    fn unhealthy_survives_later_success() {
        let monitor = ready_monitor(3, 2);
        monitor.record_inference_failure();
        monitor.record_inference_failure();
        monitor.record_inference_success();
        monitor.signal_underload();
        assert_eq!(monitor.state(), HealthState::Unhealthy);
    }

    #[test]
    fn failures_escalate_from_overloaded() {
        let monitor = ready_monitor(1, 1);
        monitor.signal_overload();
        assert_eq!(monitor.record_inference_failure(), HealthState::Unhealthy);
    }

    #[test]
    fn zero_policy_values_are_clamped() {
        let monitor = HealthMonitor::new(HealthPolicy {
            overload_hysteresis: 0,
            failure_threshold: 0,
        });
        assert_eq!(monitor.policy().overload_hysteresis, 1);
        assert_eq!(monitor.policy().failure_threshold, 1);
    }

    // ── serialization ────────────────────────────────────────────────────

    #[test]
    fn snapshot_serializes_lowercase_state() {
        let monitor = ready_monitor(3, 3);
        let json = serde_json::to_value(monitor.snapshot()).unwrap();
        assert_eq!(json["state"], "ready");
        assert!(json.get("reason").is_none());
    }
}
