use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Sliding time window of admission outcomes.
///
/// Callers pass the clock in so the window can be driven deterministically.
#[derive(Debug, Clone)]
pub struct RateWindow {
    span: Duration,
    events: VecDeque<(Instant, bool)>,
    rejected: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowStats {
    pub total: usize,
    pub rejected: usize,
}

impl WindowStats {
    /// Fraction of rejected events, 0.0 for an empty window.
    pub fn rejection_ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.rejected as f64 / self.total as f64
    }

    /// Whether this window counts as overloaded under the given thresholds.
    pub fn exceeds(&self, ratio: f64, min_samples: usize) -> bool {
        self.total >= min_samples.max(1) && self.rejection_ratio() > ratio
    }
}

impl RateWindow {
    pub fn new(span: Duration) -> Self {
        Self {
            span,
            events: VecDeque::new(),
            rejected: 0,
        }
    }

    pub fn span(&self) -> Duration {
        self.span
    }

    /// Record one admission decision.
    pub fn record(&mut self, at: Instant, rejected: bool) {
        self.prune(at);
        self.events.push_back((at, rejected));
        if rejected {
            self.rejected += 1;
        }
    }

    /// Drop events older than the window span and return what remains.
    pub fn stats(&mut self, now: Instant) -> WindowStats {
        self.prune(now);
        WindowStats {
            total: self.events.len(),
            rejected: self.rejected,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(at, rejected)) = self.events.front() {
            if now.saturating_duration_since(at) <= self.span {
                break;
            }
            self.events.pop_front();
            if rejected {
                self.rejected -= 1;
            }
        }
    }
}
