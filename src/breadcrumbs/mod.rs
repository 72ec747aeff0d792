//! Bounded, time-ordered log of recent user and system actions, mirrored to
//! disk so the next launch can attach it to a crash that killed this one.
//!
//! Critical entries (errors, screen views, explicit critical logs) are
//! flushed before the call returns; everything else is coalesced by the
//! store's writer thread.

pub mod store;

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;

use crate::models::Breadcrumb;

pub use store::BreadcrumbStore;

pub const DEFAULT_CAPACITY: usize = 50;

/// Upper bound on how long a critical log call waits for the disk.
pub const CRITICAL_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

pub struct Breadcrumbs {
    capacity: usize,
    entries: Mutex<VecDeque<Breadcrumb>>,
    store: Option<BreadcrumbStore>,
}

impl Breadcrumbs {
    /// Ring buffer mirrored to `<dir>/breadcrumbs.json`.
    pub fn persistent(capacity: usize, dir: &Path) -> Result<Self> {
        Ok(Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            store: Some(BreadcrumbStore::new(dir)?),
        })
    }

    /// Memory-only ring buffer.
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            store: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn log(&self, message: impl Into<String>) {
        self.append(message.into(), false);
    }

    pub fn log_critical(&self, message: impl Into<String>) {
        self.append(message.into(), true);
    }

    pub fn log_screen_view(&self, name: &str) {
        self.append(format!("screen: {name}"), true);
    }

    pub fn log_action(&self, kind: &str, target: &str) {
        self.append(format!("{kind}: {target}"), false);
    }

    pub fn log_network(&self, method: &str, url: &str) {
        self.append(format!("http: {} {url}", method.to_uppercase()), false);
    }

    pub fn log_error(&self, message: &str, context: Option<&str>) {
        let text = match context {
            Some(context) => format!("error: {message} ({context})"),
            None => format!("error: {message}"),
        };
        self.append(text, true);
    }

    /// Point-in-time copy, oldest first.
    pub fn entries(&self) -> Vec<Breadcrumb> {
        self.lock().iter().cloned().collect()
    }

    /// Rendered `[timestamp] message` lines, oldest first.
    pub fn logs(&self) -> Vec<String> {
        self.lock().iter().map(Breadcrumb::render).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Empty memory and the backing file. Call only after any pending crash
    /// replay has consumed the previous session's log.
    pub fn clear(&self) {
        self.lock().clear();
        if let Some(store) = &self.store {
            store.clear(CRITICAL_FLUSH_TIMEOUT);
        }
    }

    fn append(&self, message: String, critical: bool) {
        let pending_ack = {
            let mut entries = self.lock();
            let now = Utc::now();
            // Wall clock may step backwards; keep the log non-decreasing.
            let timestamp = match entries.back() {
                Some(last) if last.timestamp > now => last.timestamp,
                _ => now,
            };
            entries.push_back(Breadcrumb { timestamp, message });
            while entries.len() > self.capacity {
                entries.pop_front();
            }

            // Submit under the lock so snapshots reach the writer in order.
            let Some(store) = &self.store else {
                return;
            };
            let snapshot: Vec<Breadcrumb> = entries.iter().cloned().collect();
            if critical {
                store.submit_now(snapshot)
            } else {
                store.persist_throttled(snapshot);
                None
            }
        };

        if let Some(ack) = pending_ack {
            store::wait_for_write(&ack, CRITICAL_FLUSH_TIMEOUT);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Breadcrumb>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
