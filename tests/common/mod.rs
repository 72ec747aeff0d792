#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use frictionwatch_lib::{Endpoint, ObserverConfig, Transport, TransportError};

pub const WAIT: Duration = Duration::from_secs(5);

/// In-process collector that records every request body.
pub struct FakeCollector {
    status: AtomicU16,
    requests: Mutex<Vec<(Endpoint, serde_json::Value)>>,
}

impl FakeCollector {
    pub fn responding(status: u16) -> Arc<Self> {
        Arc::new(Self {
            status: AtomicU16::new(status),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<(Endpoint, serde_json::Value)> {
        self.requests.lock().unwrap().clone()
    }

    /// Every object sent to `endpoint`, flattened across batches.
    pub fn objects(&self, endpoint: Endpoint) -> Vec<serde_json::Value> {
        self.requests()
            .into_iter()
            .filter(|(e, _)| *e == endpoint)
            .flat_map(|(_, body)| body.as_array().cloned().unwrap_or_default())
            .collect()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.objects(Endpoint::Events)
            .iter()
            .filter_map(|event| event["eventType"].as_str().map(str::to_string))
            .collect()
    }
}

impl Transport for FakeCollector {
    fn send(&self, endpoint: Endpoint, body: &[u8], _timeout: Duration) -> Result<u16, TransportError> {
        let json = serde_json::from_slice(body).expect("collector received invalid JSON");
        self.requests.lock().unwrap().push((endpoint, json));
        Ok(self.status.load(Ordering::SeqCst))
    }
}

pub fn config(cache_dir: &Path) -> ObserverConfig {
    ObserverConfig {
        cache_dir: cache_dir.to_path_buf(),
        app_version: "4.2.0".into(),
        install_crash_handlers: false,
        ..ObserverConfig::default()
    }
}
