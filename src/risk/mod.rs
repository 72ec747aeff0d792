pub mod scorer;
pub mod window;

pub use scorer::{contribution, RiskConfig, RiskScorer};
pub use window::SlidingWindow;

use serde::{Deserialize, Serialize};

use crate::config::RiskThresholds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum RiskTier {
    #[default]
    Low,
    Medium,
    High,
}

impl RiskTier {
    pub fn from_score(score: u32, thresholds: &RiskThresholds) -> Self {
        if score >= thresholds.high {
            RiskTier::High
        } else if score >= thresholds.medium {
            RiskTier::Medium
        } else {
            RiskTier::Low
        }
    }
}

/// Derived risk view; recomputed on every read, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RiskState {
    pub score: u32,
    pub tier: RiskTier,
    /// Signals of any kind seen in the last 30 seconds.
    pub burst: usize,
}
