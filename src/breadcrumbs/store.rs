use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{mpsc, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};

use crate::models::Breadcrumb;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_warn};

pub const BREADCRUMB_FILE: &str = "breadcrumbs.json";

/// Minimum spacing between throttled writes (~2 writes per second).
pub const MIN_WRITE_INTERVAL: Duration = Duration::from_millis(500);

enum StoreCommand {
    Persist {
        entries: Vec<Breadcrumb>,
        ack: Option<mpsc::Sender<()>>,
    },
    Clear {
        ack: mpsc::Sender<()>,
    },
    Shutdown,
}

/// Serial disk writer for the breadcrumb log. All file access happens on one
/// dedicated thread, in submission order.
pub struct BreadcrumbStore {
    path: PathBuf,
    sender: mpsc::Sender<StoreCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BreadcrumbStore {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create breadcrumb directory {}", dir.display()))?;
        let path = dir.join(BREADCRUMB_FILE);

        let (sender, receiver) = mpsc::channel::<StoreCommand>();
        let path_for_thread = path.clone();
        let worker = thread::Builder::new()
            .name("frictionwatch-breadcrumbs".into())
            .spawn(move || writer_loop(path_for_thread, receiver))
            .context("failed to spawn breadcrumb writer thread")?;

        Ok(Self {
            path,
            sender,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue a throttled write of `entries`; returns immediately.
    pub fn persist_throttled(&self, entries: Vec<Breadcrumb>) {
        if self
            .sender
            .send(StoreCommand::Persist { entries, ack: None })
            .is_err()
        {
            log_warn!("breadcrumb writer is gone; entry kept in memory only");
        }
    }

    /// Queue an immediate write of `entries`. The returned receiver fires once
    /// the snapshot is on disk; `None` if the writer is gone.
    pub fn submit_now(&self, entries: Vec<Breadcrumb>) -> Option<mpsc::Receiver<()>> {
        let (ack_tx, ack_rx) = mpsc::channel();
        match self.sender.send(StoreCommand::Persist {
            entries,
            ack: Some(ack_tx),
        }) {
            Ok(()) => Some(ack_rx),
            Err(_) => {
                log_warn!("breadcrumb writer is gone; critical entry kept in memory only");
                None
            }
        }
    }

    /// Remove the backing file, waiting for the writer to process it.
    pub fn clear(&self, timeout: Duration) {
        let (ack_tx, ack_rx) = mpsc::channel();
        if self.sender.send(StoreCommand::Clear { ack: ack_tx }).is_err() {
            return;
        }
        let _ = ack_rx.recv_timeout(timeout);
    }
}

impl Drop for BreadcrumbStore {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(StoreCommand::Shutdown) {
                log_error!("Failed to send shutdown to breadcrumb writer: {err}");
            }
            if let Err(join_err) = handle.join() {
                log_error!("Failed to join breadcrumb writer: {join_err:?}");
            }
        }
    }
}

pub fn wait_for_write(ack: &mpsc::Receiver<()>, timeout: Duration) {
    if ack.recv_timeout(timeout).is_err() {
        log_warn!("critical breadcrumb write did not finish within {}ms", timeout.as_millis());
    }
}

fn writer_loop(path: PathBuf, receiver: mpsc::Receiver<StoreCommand>) {
    let mut pending: Option<Vec<Breadcrumb>> = None;
    let mut last_write: Option<Instant> = None;

    loop {
        let command = match (&pending, last_write) {
            (Some(_), Some(written_at)) => {
                let due = written_at + MIN_WRITE_INTERVAL;
                match receiver.recv_timeout(due.saturating_duration_since(Instant::now())) {
                    Ok(command) => Some(command),
                    Err(mpsc::RecvTimeoutError::Timeout) => None,
                    Err(mpsc::RecvTimeoutError::Disconnected) => Some(StoreCommand::Shutdown),
                }
            }
            _ => match receiver.recv() {
                Ok(command) => Some(command),
                Err(_) => Some(StoreCommand::Shutdown),
            },
        };

        match command {
            // Throttle window elapsed with a pending snapshot.
            None => {
                if let Some(entries) = pending.take() {
                    write_entries(&path, &entries);
                    last_write = Some(Instant::now());
                }
            }
            Some(StoreCommand::Persist { entries, ack }) => {
                let throttled = last_write
                    .map(|written_at| written_at.elapsed() < MIN_WRITE_INTERVAL)
                    .unwrap_or(false);
                if ack.is_some() || !throttled {
                    pending = None;
                    write_entries(&path, &entries);
                    last_write = Some(Instant::now());
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                } else {
                    pending = Some(entries);
                }
            }
            Some(StoreCommand::Clear { ack }) => {
                pending = None;
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => log_warn!("failed to remove {}: {err}", path.display()),
                }
                let _ = ack.send(());
            }
            Some(StoreCommand::Shutdown) => {
                if let Some(entries) = pending.take() {
                    write_entries(&path, &entries);
                }
                log_debug!("breadcrumb writer shutting down");
                break;
            }
        }
    }
}

/// Storage failures are logged and swallowed.
fn write_entries(path: &Path, entries: &[Breadcrumb]) {
    if let Err(err) = write_atomically(path, entries) {
        log_warn!("failed to persist breadcrumbs to {}: {err:#}", path.display());
    }
}

fn write_atomically(path: &Path, entries: &[Breadcrumb]) -> Result<()> {
    let serialized = serde_json::to_vec(entries)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(&serialized)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path).with_context(|| format!("failed to move {} into place", tmp.display()))
}

/// Read the breadcrumb log left behind by the previous process.
/// Missing or unreadable files yield an empty log.
pub fn load(dir: &Path) -> Vec<Breadcrumb> {
    let path = dir.join(BREADCRUMB_FILE);
    match fs::read(&path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
            log_warn!("ignoring unreadable breadcrumb log {}: {err}", path.display());
            Vec::new()
        }),
        Err(_) => Vec::new(),
    }
}
