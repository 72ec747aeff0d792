//! Periodic device/process snapshot, persisted so a signal-only crash on the
//! next launch can still say what the device looked like just before it.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::models::{Value, ValueMap};

const ENABLE_LOGS: bool = true;

use crate::log_warn;

pub const ENVIRONMENT_FILE: &str = "environment.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSnapshot {
    pub captured_at: DateTime<Utc>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub host_name: Option<String>,
    pub cpu_count: usize,
    pub total_memory_mb: f64,
    pub used_memory_mb: f64,
    pub process_memory_mb: f64,
    pub process_cpu_percent: f32,
    pub app_version: String,
    pub sdk_version: String,
}

impl EnvironmentSnapshot {
    /// Fraction of device memory in use, `0.0` when unknown.
    pub fn memory_pressure(&self) -> f64 {
        if self.total_memory_mb <= 0.0 {
            0.0
        } else {
            self.used_memory_mb / self.total_memory_mb
        }
    }

    /// Flattened form attached to crash reports.
    pub fn to_map(&self) -> ValueMap {
        let mut map = ValueMap::new();
        map.insert("capturedAt".into(), Value::from(self.captured_at.to_rfc3339()));
        map.insert("osName".into(), Value::from(self.os_name.clone()));
        map.insert("osVersion".into(), Value::from(self.os_version.clone()));
        map.insert("hostName".into(), Value::from(self.host_name.clone()));
        map.insert("cpuCount".into(), Value::from(self.cpu_count));
        map.insert("totalMemoryMb".into(), Value::from(round2(self.total_memory_mb)));
        map.insert("usedMemoryMb".into(), Value::from(round2(self.used_memory_mb)));
        map.insert("processMemoryMb".into(), Value::from(round2(self.process_memory_mb)));
        map.insert(
            "processCpuPercent".into(),
            Value::from(round2(f64::from(self.process_cpu_percent))),
        );
        map.insert("appVersion".into(), Value::from(self.app_version.clone()));
        map.insert("sdkVersion".into(), Value::from(self.sdk_version.clone()));
        map
    }
}

fn round2(value: f64) -> f64 {
    if value.is_finite() {
        (value * 100.0).round() / 100.0
    } else {
        0.0
    }
}

struct MonitorState {
    system: System,
    pid: Pid,
    last: Option<EnvironmentSnapshot>,
}

pub struct EnvironmentMonitor {
    path: PathBuf,
    app_version: String,
    inner: Mutex<MonitorState>,
}

impl EnvironmentMonitor {
    pub fn new(dir: &Path, app_version: &str) -> Self {
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());

        // Initial refresh to establish a baseline for the CPU delta.
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        Self {
            path: dir.join(ENVIRONMENT_FILE),
            app_version: app_version.to_string(),
            inner: Mutex::new(MonitorState {
                system,
                pid,
                last: None,
            }),
        }
    }

    pub fn capture(&self) -> EnvironmentSnapshot {
        let mut state = self.lock();
        let pid = state.pid;
        state.system.refresh_memory();
        state.system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        let (process_memory_mb, process_cpu_percent) = match state.system.process(pid) {
            Some(process) => (bytes_to_mb(process.memory()), process.cpu_usage()),
            None => (0.0, 0.0),
        };

        let snapshot = EnvironmentSnapshot {
            captured_at: Utc::now(),
            os_name: System::name(),
            os_version: System::os_version(),
            host_name: System::host_name(),
            cpu_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            total_memory_mb: bytes_to_mb(state.system.total_memory()),
            used_memory_mb: bytes_to_mb(state.system.used_memory()),
            process_memory_mb,
            process_cpu_percent,
            app_version: self.app_version.clone(),
            sdk_version: crate::SDK_VERSION.to_string(),
        };
        state.last = Some(snapshot.clone());
        snapshot
    }

    /// The most recent snapshot, capturing one if none exists yet.
    pub fn latest(&self) -> EnvironmentSnapshot {
        if let Some(last) = self.lock().last.clone() {
            return last;
        }
        self.capture()
    }

    /// Capture and write to disk. Storage failures are logged, not returned.
    pub fn capture_and_persist(&self) -> EnvironmentSnapshot {
        let snapshot = self.capture();
        if let Err(err) = write_snapshot(&self.path, &snapshot) {
            log_warn!("failed to persist environment snapshot: {err:#}");
        }
        snapshot
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0
}

fn write_snapshot(path: &Path, snapshot: &EnvironmentSnapshot) -> Result<()> {
    let serialized = serde_json::to_vec_pretty(snapshot)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file =
            fs::File::create(&tmp).with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(&serialized)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to write environment snapshot {}", path.display()))
}

/// The snapshot persisted by the previous process, if any.
pub fn load(dir: &Path) -> Option<EnvironmentSnapshot> {
    let contents = fs::read_to_string(dir.join(ENVIRONMENT_FILE)).ok()?;
    serde_json::from_str(&contents).ok()
}
