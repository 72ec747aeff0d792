//! Maps raw detections reported by UI/OS adapters onto the closed signal
//! taxonomy. Every producer goes through here before the scorer sees
//! anything, so the scorer's vocabulary never grows behind its back.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::models::{Signal, SignalKind};

/// A raw occurrence as described by the adapter that detected it.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// Several taps landing close together in a short span.
    RageTap {
        tap_count: u32,
        span: Duration,
        radius_pt: f64,
    },
    /// A tap on something that looks interactive but produced no response.
    DeadClick { target: String },
    /// A touch the user did not make (phantom input).
    GhostTouch,
    /// The main thread stopped servicing input for `duration`.
    MainThreadStall { duration: Duration },
    HandledError { message: String },
    UncaughtException { name: String },
    HttpFailure { status: u16 },
    FatalCrash,
}

impl Detection {
    /// Short human-readable description, used for breadcrumbs.
    pub fn describe(&self) -> String {
        match self {
            Detection::RageTap {
                tap_count,
                span,
                radius_pt,
            } => format!(
                "rage tap: {tap_count} taps in {}ms within {radius_pt:.0}pt",
                span.as_millis()
            ),
            Detection::DeadClick { target } => format!("dead click on {target}"),
            Detection::GhostTouch => "ghost touch".to_string(),
            Detection::MainThreadStall { duration } => {
                format!("main thread unresponsive for {}ms", duration.as_millis())
            }
            Detection::HandledError { message } => format!("error: {message}"),
            Detection::UncaughtException { name } => format!("uncaught exception: {name}"),
            Detection::HttpFailure { status } => format!("http failure: status {status}"),
            Detection::FatalCrash => "fatal crash".to_string(),
        }
    }
}

pub fn classify(detection: &Detection) -> Signal {
    classify_at(detection, Utc::now())
}

pub fn classify_at(detection: &Detection, observed_at: DateTime<Utc>) -> Signal {
    let kind = match detection {
        Detection::RageTap { .. } => SignalKind::RageTap,
        Detection::DeadClick { .. } => SignalKind::DeadClick,
        Detection::GhostTouch => SignalKind::GhostTouch,
        Detection::MainThreadStall { .. } => SignalKind::UiHang,
        Detection::HandledError { .. } => SignalKind::Error,
        Detection::HttpFailure { .. } => SignalKind::HttpError,
        Detection::UncaughtException { .. } | Detection::FatalCrash => SignalKind::Crash,
    };
    Signal::new(kind, observed_at)
}
