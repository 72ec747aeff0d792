use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The closed taxonomy of friction and fault signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    RageTap,
    DeadClick,
    GhostTouch,
    UiHang,
    Error,
    HttpError,
    Crash,
}

impl SignalKind {
    pub const ALL: [SignalKind; 7] = [
        SignalKind::RageTap,
        SignalKind::DeadClick,
        SignalKind::GhostTouch,
        SignalKind::UiHang,
        SignalKind::Error,
        SignalKind::HttpError,
        SignalKind::Crash,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::RageTap => "rage_tap",
            SignalKind::DeadClick => "dead_click",
            SignalKind::GhostTouch => "ghost_touch",
            SignalKind::UiHang => "ui_hang",
            SignalKind::Error => "error",
            SignalKind::HttpError => "http_error",
            SignalKind::Crash => "crash",
        }
    }

    /// Whether the signal stems from the user touching the screen, and so
    /// counts toward the activity level.
    pub fn is_interaction(&self) -> bool {
        matches!(
            self,
            SignalKind::RageTap | SignalKind::DeadClick | SignalKind::GhostTouch
        )
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub kind: SignalKind,
    pub observed_at: DateTime<Utc>,
}

impl Signal {
    pub fn new(kind: SignalKind, observed_at: DateTime<Utc>) -> Self {
        Self { kind, observed_at }
    }
}

/// Everything that can leave the device as an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Signal(SignalKind),
    SessionStart,
    SessionEnd,
    ScreenView,
    MemoryWarning,
    Custom(String),
}

impl EventKind {
    pub fn wire_name(&self) -> &str {
        match self {
            EventKind::Signal(kind) => kind.as_str(),
            EventKind::SessionStart => "session_start",
            EventKind::SessionEnd => "session_end",
            EventKind::ScreenView => "screen_view",
            EventKind::MemoryWarning => "memory_warning",
            EventKind::Custom(name) => name,
        }
    }

    /// Kinds exempt from sampling no matter the base rate or activity level.
    pub fn is_always_critical(&self) -> bool {
        matches!(
            self,
            EventKind::Signal(
                SignalKind::Crash | SignalKind::UiHang | SignalKind::RageTap | SignalKind::DeadClick
            ) | EventKind::SessionStart
                | EventKind::SessionEnd
                | EventKind::MemoryWarning
        )
    }
}

impl From<SignalKind> for EventKind {
    fn from(kind: SignalKind) -> Self {
        EventKind::Signal(kind)
    }
}
