use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::session::SessionInfo;
use super::signal::EventKind;
use super::value::ValueMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Breadcrumb {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl Breadcrumb {
    pub fn render(&self) -> String {
        format!("[{}] {}", self.timestamp.to_rfc3339(), self.message)
    }
}

/// A full crash record, persisted to disk before any upload attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrashReport {
    pub id: String,
    pub title: String,
    pub reason: String,
    pub stack_trace: String,
    pub observed_at: DateTime<Utc>,
    pub breadcrumbs: Vec<Breadcrumb>,
    pub environment: ValueMap,
    pub session: SessionInfo,
}

impl CrashReport {
    pub fn new(
        title: impl Into<String>,
        reason: impl Into<String>,
        stack_trace: impl Into<String>,
        breadcrumbs: Vec<Breadcrumb>,
        environment: ValueMap,
        session: SessionInfo,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            reason: reason.into(),
            stack_trace: stack_trace.into(),
            observed_at: Utc::now(),
            breadcrumbs,
            environment,
            session,
        }
    }

    /// Plain-text rendering handed to the host's `on_crash` callback.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}: {}", self.title, self.reason);
        let _ = writeln!(out, "observed at {}", self.observed_at.to_rfc3339());
        let _ = writeln!(out, "session {}", self.session.session_id);
        if let Some(screen) = &self.session.current_screen {
            let _ = writeln!(out, "screen {screen}");
        }
        if !self.stack_trace.is_empty() {
            let _ = writeln!(out, "\n{}", self.stack_trace.trim_end());
        }
        if !self.breadcrumbs.is_empty() {
            let _ = writeln!(out, "\nbreadcrumbs:");
            for crumb in &self.breadcrumbs {
                let _ = writeln!(out, "  {}", crumb.render());
            }
        }
        out
    }
}

/// An accepted (sampled-in) event waiting in the upload queue.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub kind: EventKind,
    pub observed_at: DateTime<Utc>,
    pub payload: ValueMap,
    pub session: SessionInfo,
}

impl EventRecord {
    pub fn new(kind: EventKind, payload: ValueMap, session: SessionInfo) -> Self {
        Self {
            kind,
            observed_at: Utc::now(),
            payload,
            session,
        }
    }
}
