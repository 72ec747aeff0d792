use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Retention of the per-kind risk windows.
pub const RISK_RETENTION: Duration = Duration::from_secs(5 * 60);
/// Retention of the interaction window used for activity estimation.
pub const ACTIVITY_RETENTION: Duration = Duration::from_secs(60);
/// Retention of the short burst ("stress") window.
pub const BURST_RETENTION: Duration = Duration::from_secs(30);

/// Ordered timestamps bounded by a retention duration. Expired entries are
/// purged lazily whenever the window is touched.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    retention: Duration,
    stamps: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            stamps: VecDeque::new(),
        }
    }

    pub fn record(&mut self, at: Instant) {
        self.prune(at);
        // Callers may hand in slightly stale instants; keep the deque sorted.
        let pos = self.stamps.partition_point(|stamp| *stamp <= at);
        self.stamps.insert(pos, at);
    }

    /// Number of entries no older than `now - retention`.
    pub fn count(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.stamps.len()
    }

    fn prune(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.retention) else {
            return;
        };
        while let Some(front) = self.stamps.front() {
            if *front < cutoff {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }
}
