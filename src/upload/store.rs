use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};

use crate::models::CrashReport;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

pub const PENDING_DIR: &str = "pending";

/// A crash report that is on disk and not yet acknowledged by the collector.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCrash {
    pub path: PathBuf,
    pub report: CrashReport,
}

/// Write-ahead storage for crash reports: `pending/<unix_ms>-<id>.json`.
#[derive(Debug, Clone)]
pub struct CrashStore {
    dir: PathBuf,
}

impl CrashStore {
    pub fn open(root: &Path) -> Result<Self> {
        let dir = root.join(PENDING_DIR);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create pending crash directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist and fsync `report`. Returns once the file is durable.
    pub fn persist(&self, report: &CrashReport) -> Result<PendingCrash> {
        let file_name = format!(
            "{}-{}.json",
            report.observed_at.timestamp_millis(),
            report.id
        );
        let path = self.dir.join(file_name);
        let tmp = path.with_extension("json.tmp");

        let serialized = serde_json::to_vec(report).context("failed to serialize crash report")?;
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            file.write_all(&serialized)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to move crash report into {}", path.display()))?;

        Ok(PendingCrash {
            path,
            report: report.clone(),
        })
    }

    /// Every pending report, oldest first. Files that do not parse are
    /// deleted so they cannot block the queue forever.
    pub fn load_all(&self) -> Vec<PendingCrash> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                log_warn!("failed to list {}: {err}", self.dir.display());
                return Vec::new();
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("json"))
            .collect();
        paths.sort();

        let mut pending = Vec::with_capacity(paths.len());
        for path in paths {
            let parsed = fs::read(&path)
                .map_err(anyhow::Error::from)
                .and_then(|bytes| serde_json::from_slice::<CrashReport>(&bytes).map_err(anyhow::Error::from));
            match parsed {
                Ok(report) => pending.push(PendingCrash { path, report }),
                Err(err) => {
                    log_warn!("discarding unreadable crash report {}: {err}", path.display());
                    self.remove(&path);
                }
            }
        }

        if !pending.is_empty() {
            log_info!("found {} pending crash report(s)", pending.len());
        }
        pending
    }

    pub fn contains(&self, report_id: &str) -> bool {
        let suffix = format!("-{report_id}.json");
        fs::read_dir(&self.dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .any(|entry| entry.file_name().to_string_lossy().ends_with(&suffix))
            })
            .unwrap_or(false)
    }

    /// Delete an acknowledged report. Failures are logged only.
    pub fn remove(&self, path: &Path) {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => log_warn!("failed to delete {}: {err}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SessionInfo, ValueMap};

    fn report(title: &str) -> CrashReport {
        CrashReport::new(title, "boom", "", Vec::new(), ValueMap::new(), SessionInfo::begin("1.0.0"))
    }

    #[test]
    fn persisted_reports_reload_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = CrashStore::open(dir.path()).unwrap();

        let mut first = report("first");
        first.observed_at = first.observed_at - chrono::Duration::seconds(5);
        let second = report("second");
        store.persist(&second).unwrap();
        store.persist(&first).unwrap();

        let loaded = store.load_all();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].report, first);
        assert_eq!(loaded[1].report, second);
        assert!(store.contains(&first.id));
    }

    #[test]
    fn unreadable_files_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = CrashStore::open(dir.path()).unwrap();
        let bad = store.dir().join("1-bad.json");
        fs::write(&bad, b"{\"title\":").unwrap();

        assert!(store.load_all().is_empty());
        assert!(!bad.exists());
    }

    #[test]
    fn remove_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = CrashStore::open(dir.path()).unwrap();
        let pending = store.persist(&report("gone")).unwrap();
        assert!(pending.path.exists());

        store.remove(&pending.path);
        assert!(!pending.path.exists());
        assert!(!store.contains(&pending.report.id));
    }
}
