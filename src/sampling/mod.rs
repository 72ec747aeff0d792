//! Per-event transmit/drop decisions.
//!
//! Rules are evaluated in order and the first match wins:
//! 1. critical screen: always transmit
//! 2. high risk: always transmit
//! 3. medium risk: sample at `min(base * 1.5, 1.0)`
//! 4. always-critical event kind: always transmit
//! 5. otherwise: sample at `base * activity multiplier`

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::activity::ActivityState;
use crate::models::EventKind;
use crate::risk::{RiskState, RiskTier};

pub const MEDIUM_RISK_BOOST: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DecisionReason {
    CriticalScreen,
    HighRisk,
    MediumRisk,
    CriticalEvent,
    BaseRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingDecision {
    pub transmit: bool,
    pub effective_rate: f64,
    pub reason: DecisionReason,
}

/// Everything a decision depends on besides the random draw.
#[derive(Debug, Clone, Copy)]
pub struct SamplingInput<'a> {
    pub kind: &'a EventKind,
    pub screen: Option<&'a str>,
    pub base_rate: f64,
    pub risk: RiskState,
    pub activity: ActivityState,
}

pub struct SamplingEngine {
    critical_screens: HashSet<String>,
    rng: Mutex<StdRng>,
    dropped: AtomicU64,
}

impl SamplingEngine {
    pub fn new(critical_screens: HashSet<String>) -> Self {
        Self::with_rng(critical_screens, StdRng::from_entropy())
    }

    /// Deterministic draws, for tests and replayable simulations.
    pub fn with_seed(critical_screens: HashSet<String>, seed: u64) -> Self {
        Self::with_rng(critical_screens, StdRng::seed_from_u64(seed))
    }

    fn with_rng(critical_screens: HashSet<String>, rng: StdRng) -> Self {
        Self {
            critical_screens,
            rng: Mutex::new(rng),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn is_critical_screen(&self, screen: &str) -> bool {
        self.critical_screens.contains(screen)
    }

    /// Decide for one event, drawing from the engine's generator when the
    /// outcome is probabilistic. Drops are counted.
    pub fn should_transmit(&self, input: SamplingInput<'_>) -> SamplingDecision {
        let decision = self.decide_with(input, || {
            let mut rng = match self.rng.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            rng.gen::<f64>()
        });
        if !decision.transmit {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        decision
    }

    /// Pure rule evaluation. `draw` is only called for probabilistic rules
    /// and must return a value in `[0, 1)`.
    pub fn decide_with<F>(&self, input: SamplingInput<'_>, draw: F) -> SamplingDecision
    where
        F: FnOnce() -> f64,
    {
        let base_rate = input.base_rate.clamp(0.0, 1.0);

        if input.screen.is_some_and(|screen| self.is_critical_screen(screen)) {
            return always(DecisionReason::CriticalScreen);
        }

        match input.risk.tier {
            RiskTier::High => return always(DecisionReason::HighRisk),
            RiskTier::Medium => {
                let rate = (base_rate * MEDIUM_RISK_BOOST).min(1.0);
                return sampled(rate, draw(), DecisionReason::MediumRisk);
            }
            RiskTier::Low => {}
        }

        if input.kind.is_always_critical() {
            return always(DecisionReason::CriticalEvent);
        }

        let rate = (base_rate * input.activity.multiplier).clamp(0.0, 1.0);
        sampled(rate, draw(), DecisionReason::BaseRate)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Read and zero the drop counter, e.g. when reporting it upstream.
    pub fn take_dropped_count(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }
}

fn always(reason: DecisionReason) -> SamplingDecision {
    SamplingDecision {
        transmit: true,
        effective_rate: 1.0,
        reason,
    }
}

fn sampled(rate: f64, draw: f64, reason: DecisionReason) -> SamplingDecision {
    SamplingDecision {
        transmit: draw < rate,
        effective_rate: rate,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SignalKind;

    fn engine() -> SamplingEngine {
        SamplingEngine::with_seed(["checkout".to_string()].into_iter().collect(), 7)
    }

    fn risk(tier: RiskTier) -> RiskState {
        RiskState {
            score: match tier {
                RiskTier::Low => 0,
                RiskTier::Medium => 50,
                RiskTier::High => 80,
            },
            tier,
            burst: 0,
        }
    }

    fn activity(multiplier: f64) -> ActivityState {
        ActivityState {
            interactions_per_minute: 0,
            multiplier,
        }
    }

    fn input<'a>(kind: &'a EventKind, screen: Option<&'a str>, base_rate: f64, tier: RiskTier, multiplier: f64) -> SamplingInput<'a> {
        SamplingInput {
            kind,
            screen,
            base_rate,
            risk: risk(tier),
            activity: activity(multiplier),
        }
    }

    #[test]
    fn critical_screen_always_transmits_even_at_zero_rate() {
        let engine = engine();
        let kind = EventKind::Custom("scroll".into());
        for tier in [RiskTier::Low, RiskTier::Medium, RiskTier::High] {
            for _ in 0..100 {
                let decision = engine.should_transmit(input(&kind, Some("checkout"), 0.0, tier, 0.3));
                assert!(decision.transmit);
                assert_eq!(decision.effective_rate, 1.0);
                assert_eq!(decision.reason, DecisionReason::CriticalScreen);
            }
        }
        assert_eq!(engine.dropped_count(), 0);
    }

    #[test]
    fn high_risk_overrides_activity_throttling() {
        let engine = engine();
        let kind = EventKind::ScreenView;
        for _ in 0..1_000 {
            let decision = engine.should_transmit(input(&kind, Some("home"), 0.1, RiskTier::High, 0.3));
            assert!(decision.transmit);
            assert_eq!(decision.effective_rate, 1.0);
        }
    }

    #[test]
    fn medium_risk_boosts_base_rate_and_caps_at_one() {
        let engine = engine();
        let kind = EventKind::ScreenView;
        let decision = engine.decide_with(input(&kind, None, 0.1, RiskTier::Medium, 0.3), || 0.149);
        assert!((decision.effective_rate - 0.15).abs() < 1e-12);
        assert!(decision.transmit);

        let decision = engine.decide_with(input(&kind, None, 0.1, RiskTier::Medium, 0.3), || 0.151);
        assert!(!decision.transmit);

        let decision = engine.decide_with(input(&kind, None, 0.9, RiskTier::Medium, 1.0), || 0.99);
        assert_eq!(decision.effective_rate, 1.0);
        assert!(decision.transmit);
    }

    #[test]
    fn medium_risk_is_probabilistic_even_for_critical_kinds() {
        let engine = engine();
        let kind = EventKind::Signal(SignalKind::Crash);
        let decision = engine.decide_with(input(&kind, None, 0.1, RiskTier::Medium, 1.0), || 0.5);
        assert_eq!(decision.reason, DecisionReason::MediumRisk);
        assert!(!decision.transmit);
    }

    #[test]
    fn critical_kinds_bypass_sampling_at_low_risk() {
        let engine = engine();
        for kind in [
            EventKind::Signal(SignalKind::Crash),
            EventKind::Signal(SignalKind::UiHang),
            EventKind::Signal(SignalKind::RageTap),
            EventKind::Signal(SignalKind::DeadClick),
            EventKind::SessionStart,
            EventKind::SessionEnd,
            EventKind::MemoryWarning,
        ] {
            let decision = engine.decide_with(input(&kind, None, 0.0, RiskTier::Low, 0.3), || {
                panic!("critical kinds must not draw")
            });
            assert!(decision.transmit, "{kind:?}");
            assert_eq!(decision.reason, DecisionReason::CriticalEvent);
        }
    }

    #[test]
    fn base_rate_scales_with_activity_multiplier() {
        let engine = engine();
        let kind = EventKind::Signal(SignalKind::HttpError);
        let decision = engine.decide_with(input(&kind, None, 0.5, RiskTier::Low, 0.6), || 0.29);
        assert!((decision.effective_rate - 0.3).abs() < 1e-12);
        assert!(decision.transmit);

        let decision = engine.decide_with(input(&kind, None, 0.5, RiskTier::Low, 0.6), || 0.31);
        assert!(!decision.transmit);
        assert_eq!(decision.reason, DecisionReason::BaseRate);
    }

    #[test]
    fn zero_rate_drops_and_counts_everything_non_critical() {
        let engine = engine();
        let kind = EventKind::Custom("scroll".into());
        for _ in 0..25 {
            assert!(!engine.should_transmit(input(&kind, Some("home"), 0.0, RiskTier::Low, 1.0)).transmit);
        }
        assert_eq!(engine.dropped_count(), 25);
        assert_eq!(engine.take_dropped_count(), 25);
        assert_eq!(engine.dropped_count(), 0);
    }

    #[test]
    fn seeded_sampling_rate_is_roughly_honoured() {
        let engine = engine();
        let kind = EventKind::ScreenView;
        let sent = (0..10_000)
            .filter(|_| engine.should_transmit(input(&kind, None, 0.5, RiskTier::Low, 0.6)).transmit)
            .count();
        // Expected 3000; allow a generous band for the seeded stream.
        assert!((2_700..3_300).contains(&sent), "sent {sent}");
    }
}
