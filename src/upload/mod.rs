//! Batching uploader with write-ahead crash persistence.
//!
//! Events and crash reports wait in two in-memory buffers. A buffer is
//! flushed when it reaches the batch size or when the flush timer fires.
//! All network I/O happens on one worker thread, in submission order; a
//! failed batch goes back to the front of its buffer. Crash reports are on
//! disk before any send is attempted and are only deleted after a 2xx.

pub mod payload;
pub mod store;
pub mod transport;

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::runtime::Handle;

use crate::config::ObserverConfig;
use crate::error::TransportError;
use crate::models::{CrashReport, EventRecord};
use crate::utils::ticker::PeriodicTask;

pub use store::{CrashStore, PendingCrash};
pub use transport::{Endpoint, HttpTransport, Transport};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

pub const UPLOAD_THREAD_NAME: &str = "frictionwatch-upload";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UploaderSettings {
    pub max_batch_size: usize,
    pub max_queue_size: usize,
    pub flush_interval: Duration,
    /// Timeout for regular batch requests.
    pub request_timeout: Duration,
}

impl Default for UploaderSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 20,
            max_queue_size: 500,
            flush_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl UploaderSettings {
    pub fn from_config(config: &ObserverConfig) -> Self {
        Self {
            max_batch_size: config.max_batch_size.max(1),
            max_queue_size: config.max_queue_size.max(1),
            flush_interval: config.flush_interval(),
            ..Self::default()
        }
    }
}

enum UploadCommand {
    Events(Vec<serde_json::Value>),
    Crashes(Vec<PendingCrash>),
    SendCrashNow {
        crash: PendingCrash,
        reply: mpsc::Sender<Result<(), TransportError>>,
    },
    Barrier(mpsc::Sender<()>),
    Shutdown,
}

#[derive(Default)]
struct UploadQueue {
    events: VecDeque<serde_json::Value>,
    crashes: VecDeque<PendingCrash>,
}

struct Shared {
    settings: UploaderSettings,
    store: CrashStore,
    queue: Mutex<UploadQueue>,
    sender: mpsc::Sender<UploadCommand>,
    overflow_dropped: AtomicU64,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, UploadQueue> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn dispatch(&self, command: UploadCommand) {
        if self.sender.send(command).is_err() {
            log_warn!("upload worker is gone; batch dropped from this session");
        }
    }

    /// Drain full batches, or everything when `force` is set.
    fn flush(&self, force: bool) {
        let batch_size = self.settings.max_batch_size;
        let (event_batches, crash_batches) = {
            let mut queue = self.lock();
            let mut event_batches = Vec::new();
            while queue.events.len() >= batch_size || (force && !queue.events.is_empty()) {
                let take = queue.events.len().min(batch_size);
                event_batches.push(queue.events.drain(..take).collect::<Vec<_>>());
            }
            let mut crash_batches = Vec::new();
            while queue.crashes.len() >= batch_size || (force && !queue.crashes.is_empty()) {
                let take = queue.crashes.len().min(batch_size);
                crash_batches.push(queue.crashes.drain(..take).collect::<Vec<_>>());
            }
            (event_batches, crash_batches)
        };

        // Crashes first: they matter more than anything else in flight.
        for batch in crash_batches {
            self.dispatch(UploadCommand::Crashes(batch));
        }
        for batch in event_batches {
            self.dispatch(UploadCommand::Events(batch));
        }
    }

    fn requeue_events(&self, batch: Vec<serde_json::Value>) {
        let mut queue = self.lock();
        for event in batch.into_iter().rev() {
            queue.events.push_front(event);
        }
        let mut dropped = 0;
        while queue.events.len() > self.settings.max_queue_size {
            queue.events.pop_front();
            dropped += 1;
        }
        if dropped > 0 {
            self.overflow_dropped.fetch_add(dropped, Ordering::Relaxed);
        }
    }

    fn requeue_crashes(&self, batch: Vec<PendingCrash>) {
        let mut queue = self.lock();
        for crash in batch.into_iter().rev() {
            queue.crashes.push_front(crash);
        }
    }
}

pub struct Uploader {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    ticker: PeriodicTask,
    stopped: AtomicBool,
    recovered: usize,
}

impl Uploader {
    /// Open the crash store under `root`, start the worker, and replay any
    /// reports a previous process left in `pending/`.
    pub fn new(settings: UploaderSettings, root: &Path, transport: Box<dyn Transport>) -> Result<Self> {
        let store = CrashStore::open(root)?;
        let (sender, receiver) = mpsc::channel::<UploadCommand>();

        let shared = Arc::new(Shared {
            settings,
            store,
            queue: Mutex::new(UploadQueue::default()),
            sender,
            overflow_dropped: AtomicU64::new(0),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(UPLOAD_THREAD_NAME.into())
            .spawn(move || worker_loop(worker_shared, transport, receiver))
            .context("failed to spawn upload worker thread")?;

        let recovered = shared.store.load_all();
        let recovered_count = recovered.len();
        if recovered_count > 0 {
            log_info!("replaying {recovered_count} crash report(s) from a previous launch");
            shared.lock().crashes.extend(recovered);
            shared.flush(true);
        }

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
            ticker: PeriodicTask::new("upload-flush"),
            stopped: AtomicBool::new(false),
            recovered: recovered_count,
        })
    }

    /// Number of reports found in `pending/` at construction.
    pub fn recovered_crashes(&self) -> usize {
        self.recovered
    }

    pub fn store(&self) -> &CrashStore {
        &self.shared.store
    }

    /// Start the periodic flush on `handle`. No-op if already running.
    pub fn start(&self, handle: &Handle) {
        let shared = Arc::clone(&self.shared);
        self.ticker
            .start(handle, self.shared.settings.flush_interval, move || shared.flush(true));
    }

    /// Buffer an accepted event. Events that cannot be encoded are dropped.
    pub fn enqueue_event(&self, record: &EventRecord) {
        let encoded = match payload::encode_event(record) {
            Ok(encoded) => encoded,
            Err(err) => {
                log_error!("dropping {} event: {err}", record.kind.wire_name());
                return;
            }
        };

        let full = {
            let mut queue = self.shared.lock();
            queue.events.push_back(encoded);
            while queue.events.len() > self.shared.settings.max_queue_size {
                queue.events.pop_front();
                self.shared.overflow_dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.events.len() >= self.shared.settings.max_batch_size
        };
        if full {
            self.shared.flush(false);
        }
    }

    /// Persist `report` and buffer it for the next flush.
    pub fn enqueue_crash(&self, report: &CrashReport) -> Result<()> {
        let pending = self.persist(report)?;
        self.enqueue_pending(pending);
        Ok(())
    }

    /// Buffer a report that is already on disk.
    pub fn enqueue_pending(&self, crash: PendingCrash) {
        let full = {
            let mut queue = self.shared.lock();
            queue.crashes.push_back(crash);
            queue.crashes.len() >= self.shared.settings.max_batch_size
        };
        if full {
            self.shared.flush(false);
        }
    }

    /// Validate and write `report` to `pending/` without queueing it.
    pub fn persist(&self, report: &CrashReport) -> Result<PendingCrash> {
        payload::encode_crash(report)
            .map_err(|err| anyhow!("crash report {} cannot be encoded: {err}", report.id))?;
        self.shared.store.persist(report)
    }

    /// Persist, then send on the worker and block until it answers or
    /// `timeout` elapses. The report stays on disk if the send fails.
    pub fn send_crash_now(&self, report: &CrashReport, timeout: Duration) -> Result<(), TransportError> {
        let pending = self.persist(report).map_err(|err| {
            log_error!("failed to persist crash before sending: {err:#}");
            TransportError::Unreachable(err.to_string())
        })?;
        self.send_pending_now(pending, timeout)
    }

    /// Send an already persisted report, blocking up to `timeout`.
    pub fn send_pending_now(&self, crash: PendingCrash, timeout: Duration) -> Result<(), TransportError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.shared
            .sender
            .send(UploadCommand::SendCrashNow {
                crash,
                reply: reply_tx,
            })
            .map_err(|_| TransportError::WorkerGone)?;

        match reply_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(TransportError::Timeout(timeout.as_millis() as u64)),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(TransportError::WorkerGone),
        }
    }

    /// Hand everything buffered to the worker.
    pub fn flush(&self) {
        self.shared.flush(true);
    }

    /// Wait until every command submitted so far has been processed.
    /// Returns `false` on timeout or if the worker is gone.
    pub fn barrier(&self, timeout: Duration) -> bool {
        let (done_tx, done_rx) = mpsc::channel();
        if self.shared.sender.send(UploadCommand::Barrier(done_tx)).is_err() {
            return false;
        }
        done_rx.recv_timeout(timeout).is_ok()
    }

    pub fn pending_events(&self) -> usize {
        self.shared.lock().events.len()
    }

    pub fn pending_crashes(&self) -> usize {
        self.shared.lock().crashes.len()
    }

    /// Events evicted because the buffer was full.
    pub fn overflow_dropped(&self) -> u64 {
        self.shared.overflow_dropped.load(Ordering::Relaxed)
    }

    pub fn is_flush_timer_running(&self) -> bool {
        self.ticker.is_running()
    }

    /// Cancel the flush timer and shut the worker down after it finishes
    /// what was already submitted. Idempotent.
    pub fn stop(&self) {
        self.ticker.stop();
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = guard.take() {
            if let Err(err) = self.shared.sender.send(UploadCommand::Shutdown) {
                log_error!("Failed to send shutdown to upload worker: {err}");
            }
            // The worker may be the caller, e.g. a panic hook on that thread.
            if thread::current().id() == handle.thread().id() {
                return;
            }
            if let Err(join_err) = handle.join() {
                log_error!("Failed to join upload worker: {join_err:?}");
            }
        }
    }
}

impl Drop for Uploader {
    fn drop(&mut self) {
        self.stop();
    }
}

/// True when called from the uploader's own worker thread.
pub fn on_upload_thread() -> bool {
    thread::current().name() == Some(UPLOAD_THREAD_NAME)
}

fn worker_loop(shared: Arc<Shared>, transport: Box<dyn Transport>, receiver: mpsc::Receiver<UploadCommand>) {
    let timeout = shared.settings.request_timeout;

    while let Ok(command) = receiver.recv() {
        match command {
            UploadCommand::Events(batch) => {
                if let Err(err) = send_events(transport.as_ref(), &batch, timeout) {
                    log_warn!("event batch of {} not delivered, will retry: {err}", batch.len());
                    shared.requeue_events(batch);
                }
            }
            UploadCommand::Crashes(batch) => match send_crashes(transport.as_ref(), &batch, timeout) {
                Ok(()) => {
                    for crash in &batch {
                        shared.store.remove(&crash.path);
                    }
                }
                Err(err) => {
                    log_warn!("crash batch of {} not delivered, will retry: {err}", batch.len());
                    shared.requeue_crashes(batch);
                }
            },
            UploadCommand::SendCrashNow { crash, reply } => {
                let batch = vec![crash];
                let result = send_crashes(transport.as_ref(), &batch, timeout);
                match &result {
                    Ok(()) => shared.store.remove(&batch[0].path),
                    Err(err) => {
                        log_warn!("synchronous crash send failed, kept on disk: {err}");
                        shared.requeue_crashes(batch);
                    }
                }
                let _ = reply.send(result);
            }
            UploadCommand::Barrier(done) => {
                let _ = done.send(());
            }
            UploadCommand::Shutdown => break,
        }
    }

    log_debug!("upload worker shutting down");
}

fn send_events(
    transport: &dyn Transport,
    batch: &[serde_json::Value],
    timeout: Duration,
) -> Result<(), TransportError> {
    let body = payload::encode_batch(batch).map_err(|err| TransportError::Unreachable(err.to_string()))?;
    deliver(transport, Endpoint::Events, &body, timeout)
}

fn send_crashes(transport: &dyn Transport, batch: &[PendingCrash], timeout: Duration) -> Result<(), TransportError> {
    let mut items = Vec::with_capacity(batch.len());
    for crash in batch {
        match payload::encode_crash(&crash.report) {
            Ok(item) => items.push(item),
            Err(err) => log_error!("skipping unencodable crash {}: {err}", crash.report.id),
        }
    }
    let body = payload::encode_batch(&items).map_err(|err| TransportError::Unreachable(err.to_string()))?;
    deliver(transport, Endpoint::Crashes, &body, timeout)
}

fn deliver(transport: &dyn Transport, endpoint: Endpoint, body: &[u8], timeout: Duration) -> Result<(), TransportError> {
    let status = transport.send(endpoint, body, timeout)?;
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(TransportError::Status(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventKind, SessionInfo, Value, ValueMap};
    use std::sync::atomic::AtomicU16;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct FakeCollector {
        status: AtomicU16,
        requests: Mutex<Vec<(Endpoint, serde_json::Value)>>,
    }

    impl FakeCollector {
        fn responding(status: u16) -> Arc<Self> {
            let collector = Self::default();
            collector.status.store(status, Ordering::SeqCst);
            Arc::new(collector)
        }

        fn requests(&self) -> Vec<(Endpoint, serde_json::Value)> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl Transport for FakeCollector {
        fn send(&self, endpoint: Endpoint, body: &[u8], _timeout: Duration) -> Result<u16, TransportError> {
            let json = serde_json::from_slice(body).expect("valid JSON body");
            self.requests.lock().unwrap().push((endpoint, json));
            Ok(self.status.load(Ordering::SeqCst))
        }
    }

    fn settings(max_batch_size: usize) -> UploaderSettings {
        UploaderSettings {
            max_batch_size,
            max_queue_size: 5,
            flush_interval: Duration::from_secs(3600),
            request_timeout: Duration::from_secs(1),
        }
    }

    fn event(n: i64) -> EventRecord {
        let mut payload = ValueMap::new();
        payload.insert("n".into(), Value::from(n));
        EventRecord::new(EventKind::ScreenView, payload, SessionInfo::begin("1.0.0"))
    }

    fn crash() -> CrashReport {
        CrashReport::new("panic", "boom", "", Vec::new(), ValueMap::new(), SessionInfo::begin("1.0.0"))
    }

    #[test]
    fn reaching_batch_size_flushes_automatically() {
        let dir = tempfile::tempdir().unwrap();
        let collector = FakeCollector::responding(200);
        let uploader = Uploader::new(settings(2), dir.path(), Box::new(Arc::clone(&collector))).unwrap();

        uploader.enqueue_event(&event(1));
        uploader.enqueue_event(&event(2));
        uploader.enqueue_event(&event(3));
        assert!(uploader.barrier(WAIT));

        let requests = collector.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, Endpoint::Events);
        assert_eq!(requests[0].1.as_array().unwrap().len(), 2);
        assert_eq!(uploader.pending_events(), 1);
    }

    #[test]
    fn failed_batch_is_requeued_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let collector = FakeCollector::responding(503);
        let uploader = Uploader::new(settings(2), dir.path(), Box::new(Arc::clone(&collector))).unwrap();

        uploader.enqueue_event(&event(1));
        uploader.enqueue_event(&event(2));
        assert!(uploader.barrier(WAIT));
        assert_eq!(uploader.pending_events(), 2);

        collector.status.store(202, Ordering::SeqCst);
        uploader.flush();
        assert!(uploader.barrier(WAIT));
        assert_eq!(uploader.pending_events(), 0);

        let requests = collector.requests();
        let last = requests.last().unwrap().1.as_array().unwrap().clone();
        assert_eq!(last[0]["payload"]["n"], 1);
        assert_eq!(last[1]["payload"]["n"], 2);
    }

    #[test]
    fn queue_overflow_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let collector = FakeCollector::responding(200);
        let uploader = Uploader::new(settings(100), dir.path(), Box::new(Arc::clone(&collector))).unwrap();

        for n in 0..8 {
            uploader.enqueue_event(&event(n));
        }
        assert_eq!(uploader.pending_events(), 5);
        assert_eq!(uploader.overflow_dropped(), 3);

        uploader.flush();
        assert!(uploader.barrier(WAIT));
        let first = &collector.requests()[0].1[0];
        assert_eq!(first["payload"]["n"], 3);
    }

    #[test]
    fn unencodable_event_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let collector = FakeCollector::responding(200);
        let uploader = Uploader::new(settings(1), dir.path(), Box::new(Arc::clone(&collector))).unwrap();

        let mut payload = ValueMap::new();
        payload.insert("ratio".into(), Value::Double(f64::INFINITY));
        uploader.enqueue_event(&EventRecord::new(EventKind::Custom("x".into()), payload, SessionInfo::begin("1.0.0")));
        assert!(uploader.barrier(WAIT));

        assert!(collector.requests().is_empty());
        assert_eq!(uploader.pending_events(), 0);
    }

    #[test]
    fn crash_files_survive_failure_and_are_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let report = crash();
        {
            let collector = FakeCollector::responding(500);
            let uploader = Uploader::new(settings(1), dir.path(), Box::new(Arc::clone(&collector))).unwrap();
            uploader.enqueue_crash(&report).unwrap();
            assert!(uploader.barrier(WAIT));
            assert_eq!(uploader.pending_crashes(), 1);
            assert!(uploader.store().contains(&report.id));
            uploader.stop();
        }

        let collector = FakeCollector::responding(200);
        let uploader = Uploader::new(settings(10), dir.path(), Box::new(Arc::clone(&collector))).unwrap();
        assert_eq!(uploader.recovered_crashes(), 1);
        assert!(uploader.barrier(WAIT));

        let requests = collector.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, Endpoint::Crashes);
        assert_eq!(requests[0].1[0]["id"], report.id.as_str());
        assert!(!uploader.store().contains(&report.id));
    }

    #[test]
    fn send_crash_now_blocks_until_acknowledged() {
        let dir = tempfile::tempdir().unwrap();
        let collector = FakeCollector::responding(201);
        let uploader = Uploader::new(settings(10), dir.path(), Box::new(Arc::clone(&collector))).unwrap();

        let report = crash();
        uploader.send_crash_now(&report, Duration::from_secs(2)).unwrap();
        assert_eq!(collector.requests().len(), 1);
        assert!(!uploader.store().contains(&report.id));
    }

    #[test]
    fn send_crash_now_failure_keeps_report() {
        let dir = tempfile::tempdir().unwrap();
        let collector = FakeCollector::responding(500);
        let uploader = Uploader::new(settings(10), dir.path(), Box::new(Arc::clone(&collector))).unwrap();

        let report = crash();
        let result = uploader.send_crash_now(&report, Duration::from_secs(2));
        assert!(matches!(result, Err(TransportError::Status(500))));
        assert!(uploader.store().contains(&report.id));
        assert_eq!(uploader.pending_crashes(), 1);
    }

    #[tokio::test]
    async fn stop_twice_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let collector = FakeCollector::responding(200);
        let uploader = Uploader::new(settings(10), dir.path(), Box::new(Arc::clone(&collector))).unwrap();

        uploader.start(&Handle::current());
        assert!(uploader.is_flush_timer_running());
        uploader.stop();
        uploader.stop();
        assert!(!uploader.is_flush_timer_running());
        assert!(!uploader.barrier(Duration::from_millis(100)));
    }
}
