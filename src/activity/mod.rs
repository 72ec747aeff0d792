//! Interaction-rate estimation driving the sampling multiplier.
//!
//! Interactions are appended as they happen but the rate is only recomputed
//! on a 10 second tick, so a burst of taps costs one deque push each and
//! nothing more.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use crate::risk::window::{SlidingWindow, ACTIVITY_RETENTION};
use crate::utils::ticker::PeriodicTask;

const ENABLE_LOGS: bool = true;

use crate::log_debug;

pub const TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Above this many interactions per minute events are heavily throttled.
pub const BUSY_THRESHOLD: usize = 30;
/// Below this many interactions per minute every event is kept.
pub const QUIET_THRESHOLD: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityState {
    pub interactions_per_minute: usize,
    pub multiplier: f64,
}

impl Default for ActivityState {
    fn default() -> Self {
        Self {
            interactions_per_minute: 0,
            multiplier: multiplier_for(0),
        }
    }
}

/// Three hard bands, no hysteresis.
pub fn multiplier_for(interactions_per_minute: usize) -> f64 {
    if interactions_per_minute > BUSY_THRESHOLD {
        0.3
    } else if interactions_per_minute < QUIET_THRESHOLD {
        1.0
    } else {
        0.6
    }
}

struct ActivityWindow {
    window: SlidingWindow,
    state: ActivityState,
}

pub struct ActivityEstimator {
    inner: Arc<Mutex<ActivityWindow>>,
    ticker: PeriodicTask,
}

impl ActivityEstimator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ActivityWindow {
                window: SlidingWindow::new(ACTIVITY_RETENTION),
                state: ActivityState::default(),
            })),
            ticker: PeriodicTask::new("activity"),
        }
    }

    pub fn record_interaction(&self) {
        self.record_interaction_at(Instant::now());
    }

    pub fn record_interaction_at(&self, at: Instant) {
        lock(&self.inner).window.record(at);
    }

    /// Last state computed by a tick (or by an explicit `recompute`).
    pub fn state(&self) -> ActivityState {
        lock(&self.inner).state
    }

    pub fn recompute(&self) -> ActivityState {
        recompute_at(&self.inner, Instant::now())
    }

    pub fn recompute_at(&self, now: Instant) -> ActivityState {
        recompute_at(&self.inner, now)
    }

    /// Begin the periodic recompute on `handle`. No-op if already started.
    pub fn start(&self, handle: &Handle) {
        let inner = Arc::clone(&self.inner);
        self.ticker.start(handle, TICK_INTERVAL, move || {
            let state = recompute_at(&inner, Instant::now());
            log_debug!(
                "activity tick: {} interactions/min, multiplier {}",
                state.interactions_per_minute,
                state.multiplier
            );
        });
    }

    /// Idempotent; safe before `start`.
    pub fn stop(&self) {
        self.ticker.stop();
    }

    pub fn is_running(&self) -> bool {
        self.ticker.is_running()
    }
}

impl Default for ActivityEstimator {
    fn default() -> Self {
        Self::new()
    }
}

fn recompute_at(inner: &Mutex<ActivityWindow>, now: Instant) -> ActivityState {
    let mut guard = lock(inner);
    let count = guard.window.count(now);
    let state = ActivityState {
        interactions_per_minute: count,
        multiplier: multiplier_for(count),
    };
    guard.state = state;
    state
}

fn lock(inner: &Mutex<ActivityWindow>) -> std::sync::MutexGuard<'_, ActivityWindow> {
    match inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_map_rate_to_multiplier() {
        assert_eq!(multiplier_for(0), 1.0);
        assert_eq!(multiplier_for(4), 1.0);
        assert_eq!(multiplier_for(5), 0.6);
        assert_eq!(multiplier_for(30), 0.6);
        assert_eq!(multiplier_for(31), 0.3);
    }

    #[test]
    fn state_only_changes_on_recompute() {
        let estimator = ActivityEstimator::new();
        let t0 = Instant::now();
        for i in 0..40 {
            estimator.record_interaction_at(t0 + Duration::from_millis(i * 500));
        }
        assert_eq!(estimator.state(), ActivityState::default());

        let state = estimator.recompute_at(t0 + Duration::from_secs(20));
        assert_eq!(state.interactions_per_minute, 40);
        assert_eq!(state.multiplier, 0.3);
        assert_eq!(estimator.state(), state);
    }

    #[test]
    fn old_interactions_fall_out_of_the_minute_window() {
        let estimator = ActivityEstimator::new();
        let t0 = Instant::now();
        for i in 0..10 {
            estimator.record_interaction_at(t0 + Duration::from_secs(i));
        }
        assert_eq!(estimator.recompute_at(t0 + Duration::from_secs(30)).multiplier, 0.6);

        let state = estimator.recompute_at(t0 + Duration::from_secs(67));
        // Cutoff is t0 + 7s: entries at 7, 8 and 9 seconds remain.
        assert_eq!(state.interactions_per_minute, 3);
        assert_eq!(state.multiplier, 1.0);
    }

    #[tokio::test]
    async fn stop_twice_leaves_estimator_stopped() {
        let estimator = ActivityEstimator::new();
        estimator.stop();
        estimator.start(&Handle::current());
        assert!(estimator.is_running());
        estimator.stop();
        estimator.stop();
        assert!(!estimator.is_running());
        // Recording still works while stopped; only the tick is gone.
        estimator.record_interaction();
        assert_eq!(estimator.recompute().interactions_per_minute, 1);
    }
}
