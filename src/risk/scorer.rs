use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::config::{RiskThresholds, SignalWeights};
use crate::models::{Signal, SignalKind};

use super::window::{SlidingWindow, BURST_RETENTION, RISK_RETENTION};
use super::{RiskState, RiskTier};

/// Scorer tuning; see `ObserverConfig` for the defaults.
#[derive(Debug, Clone, Copy)]
pub struct RiskConfig {
    pub weights: SignalWeights,
    pub decay: f64,
    pub thresholds: RiskThresholds,
    pub previous_crash_bonus: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            weights: SignalWeights::default(),
            decay: 0.8,
            thresholds: RiskThresholds::default(),
            previous_crash_bonus: 30.0,
        }
    }
}

/// Windows that feed the score. Errors and crashes share one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScoredWindow {
    RageTap,
    DeadClick,
    ErrorOrCrash,
    UiHang,
    HttpError,
}

impl ScoredWindow {
    const ALL: [ScoredWindow; 5] = [
        ScoredWindow::RageTap,
        ScoredWindow::DeadClick,
        ScoredWindow::ErrorOrCrash,
        ScoredWindow::UiHang,
        ScoredWindow::HttpError,
    ];

    fn for_kind(kind: SignalKind) -> Option<Self> {
        match kind {
            SignalKind::RageTap => Some(ScoredWindow::RageTap),
            SignalKind::DeadClick => Some(ScoredWindow::DeadClick),
            SignalKind::Error | SignalKind::Crash => Some(ScoredWindow::ErrorOrCrash),
            SignalKind::UiHang => Some(ScoredWindow::UiHang),
            SignalKind::HttpError => Some(ScoredWindow::HttpError),
            SignalKind::GhostTouch => None,
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    /// The kind whose weight this window carries.
    fn kind(self) -> SignalKind {
        match self {
            ScoredWindow::RageTap => SignalKind::RageTap,
            ScoredWindow::DeadClick => SignalKind::DeadClick,
            ScoredWindow::ErrorOrCrash => SignalKind::Error,
            ScoredWindow::UiHang => SignalKind::UiHang,
            ScoredWindow::HttpError => SignalKind::HttpError,
        }
    }
}

struct ScorerWindows {
    per_kind: [SlidingWindow; 5],
    burst: SlidingWindow,
}

/// Geometric diminishing-returns contribution of `n` occurrences of a kind
/// with weight `weight`: `Σ_{i<n} weight·decay^i`. Bounded above by
/// `weight / (1 - decay)` for every `n`.
pub fn contribution(n: usize, weight: f64, decay: f64) -> f64 {
    if n == 0 || weight == 0.0 {
        return 0.0;
    }
    let exponent = i32::try_from(n).unwrap_or(i32::MAX);
    weight * (1.0 - decay.powi(exponent)) / (1.0 - decay)
}

/// Continuously recomputed session risk from per-kind sliding windows.
pub struct RiskScorer {
    config: RiskConfig,
    windows: Mutex<ScorerWindows>,
    had_crash_in_previous_session: AtomicBool,
}

impl RiskScorer {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(ScorerWindows {
                per_kind: std::array::from_fn(|_| SlidingWindow::new(RISK_RETENTION)),
                burst: SlidingWindow::new(BURST_RETENTION),
            }),
            had_crash_in_previous_session: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Set once at startup from the crash marker / pending report check.
    pub fn set_had_crash_in_previous_session(&self, value: bool) {
        self.had_crash_in_previous_session
            .store(value, Ordering::SeqCst);
    }

    pub fn had_crash_in_previous_session(&self) -> bool {
        self.had_crash_in_previous_session.load(Ordering::SeqCst)
    }

    pub fn record(&self, signal: &Signal) -> RiskState {
        self.record_at(signal.kind, Instant::now())
    }

    /// Record an occurrence of `kind` at `at` and return the recomputed state.
    pub fn record_at(&self, kind: SignalKind, at: Instant) -> RiskState {
        let mut windows = self.lock_windows();
        if let Some(window) = ScoredWindow::for_kind(kind) {
            windows.per_kind[window.index()].record(at);
        }
        windows.burst.record(at);
        self.compute(&mut windows, at)
    }

    pub fn score(&self) -> u32 {
        self.state().score
    }

    pub fn score_at(&self, now: Instant) -> u32 {
        self.state_at(now).score
    }

    pub fn state(&self) -> RiskState {
        self.state_at(Instant::now())
    }

    pub fn state_at(&self, now: Instant) -> RiskState {
        let mut windows = self.lock_windows();
        self.compute(&mut windows, now)
    }

    fn compute(&self, windows: &mut ScorerWindows, now: Instant) -> RiskState {
        let mut total = 0.0;
        for window in ScoredWindow::ALL {
            let n = windows.per_kind[window.index()].count(now);
            let weight = self.config.weights.for_kind(window.kind()).unwrap_or(0.0);
            total += contribution(n, weight, self.config.decay);
        }
        if self.had_crash_in_previous_session() {
            total += self.config.previous_crash_bonus;
        }

        let score = total.round().clamp(0.0, 100.0) as u32;
        RiskState {
            score,
            tier: RiskTier::from_score(score, &self.config.thresholds),
            burst: windows.burst.count(now),
        }
    }

    fn lock_windows(&self) -> std::sync::MutexGuard<'_, ScorerWindows> {
        match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn scorer() -> RiskScorer {
        RiskScorer::new(RiskConfig::default())
    }

    #[test]
    fn contribution_matches_term_by_term_sum() {
        let expected: f64 = (0..5).map(|i| 15.0 * 0.8_f64.powi(i)).sum();
        assert!((contribution(5, 15.0, 0.8) - expected).abs() < 1e-9);
        assert!((contribution(5, 15.0, 0.8) - 50.424).abs() < 1e-9);
        assert_eq!(contribution(0, 15.0, 0.8), 0.0);
        assert!((contribution(1, 15.0, 0.8) - 15.0).abs() < 1e-9);
        assert!((contribution(2, 15.0, 0.8) - 27.0).abs() < 1e-9);
    }

    #[test]
    fn contribution_stays_below_asymptote() {
        for weight in [8.0, 10.0, 15.0, 20.0, 25.0] {
            let bound = weight / (1.0 - 0.8);
            for n in [1, 2, 3, 10, 50, 1_000, 100_000, usize::MAX] {
                assert!(contribution(n, weight, 0.8) <= bound, "n={n} w={weight}");
            }
            for n in 1..=60 {
                assert!(contribution(n, weight, 0.8) < bound, "n={n} w={weight}");
            }
        }
    }

    #[test]
    fn score_never_decreases_as_same_kind_count_grows() {
        let scorer = scorer();
        let t0 = Instant::now();
        let mut previous = 0;
        for i in 0..200 {
            let at = t0 + Duration::from_millis(i * 100);
            let state = scorer.record_at(SignalKind::HttpError, at);
            assert!(state.score >= previous, "score dropped at occurrence {i}");
            previous = state.score;
        }
        // Asymptote for weight 8 is 40.
        assert_eq!(previous, 40);
    }

    #[test]
    fn five_rage_taps_land_in_medium_tier() {
        let scorer = scorer();
        let t0 = Instant::now();
        for i in 0..5 {
            scorer.record_at(SignalKind::RageTap, t0 + Duration::from_secs(i * 30));
        }
        let state = scorer.state_at(t0 + Duration::from_secs(150));
        assert_eq!(state.score, 50);
        assert_eq!(state.tier, RiskTier::Medium);
    }

    #[test]
    fn crash_plus_previous_session_bonus_is_medium_not_high() {
        let scorer = scorer();
        scorer.set_had_crash_in_previous_session(true);
        let t0 = Instant::now();
        let state = scorer.record_at(SignalKind::Crash, t0);
        assert_eq!(state.score, 50);
        assert_eq!(state.tier, RiskTier::Medium);
    }

    #[test]
    fn expired_signals_stop_counting() {
        let scorer = scorer();
        let t0 = Instant::now();
        scorer.record_at(SignalKind::UiHang, t0);
        assert_eq!(scorer.score_at(t0 + Duration::from_secs(60)), 25);

        let after = t0 + RISK_RETENTION + Duration::from_millis(1);
        assert_eq!(scorer.score_at(after), 0);
    }

    #[test]
    fn previous_crash_bonus_does_not_decay() {
        let scorer = scorer();
        scorer.set_had_crash_in_previous_session(true);
        let t0 = Instant::now();
        assert_eq!(scorer.score_at(t0), 30);
        assert_eq!(scorer.score_at(t0 + Duration::from_secs(3_600)), 30);
    }

    #[test]
    fn score_is_capped_at_one_hundred() {
        let scorer = scorer();
        scorer.set_had_crash_in_previous_session(true);
        let t0 = Instant::now();
        for kind in [
            SignalKind::RageTap,
            SignalKind::DeadClick,
            SignalKind::Error,
            SignalKind::UiHang,
            SignalKind::HttpError,
        ] {
            for _ in 0..10 {
                scorer.record_at(kind, t0);
            }
        }
        let state = scorer.state_at(t0);
        assert_eq!(state.score, 100);
        assert_eq!(state.tier, RiskTier::High);
    }

    #[test]
    fn configured_weights_drive_the_score() {
        let scorer = RiskScorer::new(RiskConfig {
            weights: SignalWeights {
                http_error: 50.0,
                ..SignalWeights::default()
            },
            ..RiskConfig::default()
        });
        let t0 = Instant::now();
        assert_eq!(scorer.record_at(SignalKind::HttpError, t0).score, 50);
        // Handled errors and crashes share the error weight and window.
        scorer.record_at(SignalKind::Error, t0);
        assert_eq!(scorer.record_at(SignalKind::Crash, t0).score, 50 + 36);
    }

    #[test]
    fn ghost_touch_feeds_burst_but_not_score() {
        let scorer = scorer();
        let t0 = Instant::now();
        let state = scorer.record_at(SignalKind::GhostTouch, t0);
        assert_eq!(state.score, 0);
        assert_eq!(state.burst, 1);
        assert_eq!(scorer.state_at(t0 + Duration::from_secs(31)).burst, 0);
    }
}
