//! Wire objects for the collector. Field names are camelCase and timestamps
//! RFC 3339.

use serde::Serialize;
use serde_json::Map;

use crate::error::EncodeError;
use crate::models::value::encode_map;
use crate::models::{Breadcrumb, CrashReport, EventRecord, SessionInfo};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EventPayload<'a> {
    event_type: &'a str,
    observed_at: String,
    payload: Map<String, serde_json::Value>,
    session: &'a SessionInfo,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CrashPayload<'a> {
    event_type: &'static str,
    observed_at: String,
    payload: Map<String, serde_json::Value>,
    session: &'a SessionInfo,
    id: &'a str,
    title: &'a str,
    reason: &'a str,
    stack_trace: &'a str,
    breadcrumbs: &'a [Breadcrumb],
    environment: Map<String, serde_json::Value>,
}

/// Encode one accepted event. Fails only on values JSON cannot carry.
pub fn encode_event(record: &EventRecord) -> Result<serde_json::Value, EncodeError> {
    let payload = EventPayload {
        event_type: record.kind.wire_name(),
        observed_at: record.observed_at.to_rfc3339(),
        payload: encode_map(&record.payload)?,
        session: &record.session,
    };
    Ok(serde_json::to_value(payload)?)
}

pub fn encode_crash(report: &CrashReport) -> Result<serde_json::Value, EncodeError> {
    let payload = CrashPayload {
        event_type: "crash",
        observed_at: report.observed_at.to_rfc3339(),
        payload: Map::new(),
        session: &report.session,
        id: &report.id,
        title: &report.title,
        reason: &report.reason,
        stack_trace: &report.stack_trace,
        breadcrumbs: &report.breadcrumbs,
        environment: encode_map(&report.environment)?,
    };
    Ok(serde_json::to_value(payload)?)
}

/// Request body: a JSON array of already-encoded objects.
pub fn encode_batch(items: &[serde_json::Value]) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(items)?)
}
