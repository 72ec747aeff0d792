use std::{collections::HashSet, fs, path::Path, path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::SignalKind;

/// Score thresholds at which the risk tier steps up.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RiskThresholds {
    pub medium: u32,
    pub high: u32,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            medium: 40,
            high: 70,
        }
    }
}

/// Per-kind weights: the contribution of the first occurrence in a window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SignalWeights {
    pub rage_tap: f64,
    pub dead_click: f64,
    /// Shared by handled errors and crashes.
    pub error: f64,
    pub ui_hang: f64,
    pub http_error: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            rage_tap: 15.0,
            dead_click: 10.0,
            error: 20.0,
            ui_hang: 25.0,
            http_error: 8.0,
        }
    }
}

impl SignalWeights {
    pub fn for_kind(&self, kind: SignalKind) -> Option<f64> {
        match kind {
            SignalKind::RageTap => Some(self.rage_tap),
            SignalKind::DeadClick => Some(self.dead_click),
            SignalKind::Error | SignalKind::Crash => Some(self.error),
            SignalKind::UiHang => Some(self.ui_hang),
            SignalKind::HttpError => Some(self.http_error),
            SignalKind::GhostTouch => None,
        }
    }
}

/// Host-supplied configuration. Every field has a default, so an empty JSON
/// object (or no file at all) yields a working setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObserverConfig {
    pub api_key: String,
    pub base_url: String,
    /// Parent directory for the SDK's cache subdirectory.
    pub cache_dir: PathBuf,
    pub app_version: String,
    pub base_sample_rate: f64,
    pub flush_interval_secs: u64,
    pub max_batch_size: usize,
    pub max_queue_size: usize,
    pub critical_screens: HashSet<String>,
    pub risk_thresholds: RiskThresholds,
    pub decay_factor: f64,
    pub weights: SignalWeights,
    pub previous_crash_bonus: f64,
    pub breadcrumb_capacity: usize,
    pub sync_send_timeout_ms: u64,
    pub environment_interval_secs: u64,
    pub memory_warning_ratio: f64,
    pub install_crash_handlers: bool,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "http://127.0.0.1:8080".into(),
            cache_dir: std::env::temp_dir(),
            app_version: "0.0.0".into(),
            base_sample_rate: 0.1,
            flush_interval_secs: 10,
            max_batch_size: 20,
            max_queue_size: 500,
            critical_screens: HashSet::new(),
            risk_thresholds: RiskThresholds::default(),
            decay_factor: 0.8,
            weights: SignalWeights::default(),
            previous_crash_bonus: 30.0,
            breadcrumb_capacity: 50,
            sync_send_timeout_ms: 2_000,
            environment_interval_secs: 30,
            memory_warning_ratio: 0.9,
            install_crash_handlers: true,
        }
    }
}

impl ObserverConfig {
    /// Load from a JSON file. A missing file yields the defaults; a file that
    /// exists but cannot be read or parsed is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config {}", path.display()))?
        } else {
            Self::default()
        };
        Ok(config.with_env_overrides())
    }

    /// `FRICTIONWATCH_DEBUG=1` flushes every second so uploads are visible
    /// while developing against a local collector.
    pub fn with_env_overrides(mut self) -> Self {
        let debug_mode = std::env::var("FRICTIONWATCH_DEBUG")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if debug_mode {
            self.flush_interval_secs = 1;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.base_sample_rate) {
            bail!(
                "baseSampleRate must be within 0.0..=1.0, got {}",
                self.base_sample_rate
            );
        }
        if !(self.decay_factor > 0.0 && self.decay_factor < 1.0) {
            bail!("decayFactor must be within (0.0, 1.0), got {}", self.decay_factor);
        }
        if self.risk_thresholds.medium > self.risk_thresholds.high {
            bail!(
                "riskThresholds.medium ({}) exceeds riskThresholds.high ({})",
                self.risk_thresholds.medium,
                self.risk_thresholds.high
            );
        }
        if self.max_batch_size == 0 {
            bail!("maxBatchSize must be greater than zero");
        }
        if self.max_queue_size < self.max_batch_size {
            bail!(
                "maxQueueSize ({}) must be at least maxBatchSize ({})",
                self.max_queue_size,
                self.max_batch_size
            );
        }
        if self.flush_interval_secs == 0 {
            bail!("flushIntervalSeconds must be greater than zero");
        }
        if self.breadcrumb_capacity == 0 {
            bail!("breadcrumbCapacity must be greater than zero");
        }
        let weights = [
            self.weights.rage_tap,
            self.weights.dead_click,
            self.weights.error,
            self.weights.ui_hang,
            self.weights.http_error,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            bail!("signal weights must be finite and non-negative");
        }
        Ok(())
    }

    /// The SDK's own directory under `cache_dir`.
    pub fn storage_dir(&self) -> PathBuf {
        self.cache_dir.join("frictionwatch")
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn sync_send_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_send_timeout_ms)
    }

    pub fn environment_interval(&self) -> Duration {
        Duration::from_secs(self.environment_interval_secs.max(1))
    }
}
