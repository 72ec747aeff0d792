//! Session-scoped entry point tying detection, scoring, sampling and upload
//! together. UI and OS adapters report through the `notify_*` methods; the
//! host optionally mirrors what it sees through an [`ObserverDelegate`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::runtime::{Builder, Runtime};

use crate::activity::{ActivityEstimator, ActivityState};
use crate::breadcrumbs::{self, Breadcrumbs};
use crate::classifier::{self, Detection};
use crate::config::ObserverConfig;
use crate::crash::{marker, panic_hook, CrashSink, MarkerRecord, PanicDetails};
use crate::environment::{self, EnvironmentMonitor, EnvironmentSnapshot};
use crate::models::{
    Breadcrumb, CrashReport, EventKind, EventRecord, SessionInfo, SessionTracker, Signal, SignalKind,
    Value, ValueMap,
};
use crate::risk::{RiskConfig, RiskScorer, RiskState};
use crate::sampling::{SamplingDecision, SamplingEngine, SamplingInput};
use crate::upload::{self, HttpTransport, Transport, Uploader, UploaderSettings};
use crate::utils::ticker::PeriodicTask;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// Present while a session runs; removed by a graceful shutdown.
pub const SESSION_SENTINEL: &str = "session.active";

/// Host callbacks. Both default to no-ops.
pub trait ObserverDelegate: Send + Sync {
    fn on_event(&self, _signal: &Signal) {}
    fn on_crash(&self, _report: &str) {}
}

/// A host-level fatal error (e.g. an uncaught exception in the UI layer)
/// about to take the process down. Missing snapshots are taken live.
#[derive(Debug, Clone, Default)]
pub struct CrashContext {
    pub title: String,
    pub reason: String,
    pub stack_trace: String,
    pub breadcrumbs: Option<Vec<Breadcrumb>>,
    pub environment: Option<ValueMap>,
}

struct Inner {
    config: ObserverConfig,
    marker_path: PathBuf,
    sentinel_path: PathBuf,
    session: SessionTracker,
    breadcrumbs: Breadcrumbs,
    scorer: RiskScorer,
    activity: ActivityEstimator,
    sampler: SamplingEngine,
    uploader: Uploader,
    environment: EnvironmentMonitor,
    environment_ticker: PeriodicTask,
    memory_warned: AtomicBool,
    /// The marker on disk came from a panic hook, not a host-declared crash.
    panic_marker: AtomicBool,
    delegate: Option<Arc<dyn ObserverDelegate>>,
    shut_down: AtomicBool,
}

pub struct Observer {
    inner: Arc<Inner>,
    runtime: Option<Runtime>,
}

impl Observer {
    /// Start a session: replay whatever the previous process left behind,
    /// install crash capture, start the timers and announce the session.
    pub fn start(
        config: ObserverConfig,
        transport: Box<dyn Transport>,
        delegate: Option<Arc<dyn ObserverDelegate>>,
    ) -> Result<Self> {
        config.validate()?;
        let dir = config.storage_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create storage directory {}", dir.display()))?;

        let marker_path = marker::marker_path(&dir);
        let previous_marker = marker::read(&marker_path);
        let previous_breadcrumbs = breadcrumbs::store::load(&dir);
        let previous_environment = environment::load(&dir);

        let sentinel_path = dir.join(SESSION_SENTINEL);
        let previous_unclean = sentinel_path.exists();
        if let Err(err) = std::fs::write(&sentinel_path, b"") {
            log_error!("failed to write session sentinel {}: {err}", sentinel_path.display());
        }

        let session = SessionTracker::new(SessionInfo::begin(&config.app_version));
        let uploader = Uploader::new(UploaderSettings::from_config(&config), &dir, transport)?;

        if let Some(record) = &previous_marker {
            log_warn!("previous session ended in a crash: {}", record.title());
            replay_marker(
                &uploader,
                record,
                previous_breadcrumbs,
                previous_environment.as_ref(),
                session.snapshot(),
            );
            if let Err(err) = marker::remove(&marker_path) {
                log_error!("{err:#}");
            }
        }

        let scorer = RiskScorer::new(RiskConfig {
            weights: config.weights,
            decay: config.decay_factor,
            thresholds: config.risk_thresholds,
            previous_crash_bonus: config.previous_crash_bonus,
        });
        // A pending report alone only counts when the previous session did
        // not shut down gracefully; a survived panic leaves one behind too.
        let recovered_after_crash = previous_unclean && uploader.recovered_crashes() > 0;
        scorer.set_had_crash_in_previous_session(previous_marker.is_some() || recovered_after_crash);

        // Only now is the previous session's log no longer needed.
        let crumbs = Breadcrumbs::persistent(config.breadcrumb_capacity, &dir)?;
        crumbs.clear();

        let environment = EnvironmentMonitor::new(&dir, &config.app_version);
        environment.capture_and_persist();

        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("frictionwatch-timer")
            .enable_all()
            .build()
            .context("failed to build timer runtime")?;

        let inner = Arc::new(Inner {
            sampler: SamplingEngine::new(config.critical_screens.clone()),
            config,
            marker_path,
            sentinel_path,
            session,
            breadcrumbs: crumbs,
            scorer,
            activity: ActivityEstimator::new(),
            uploader,
            environment,
            environment_ticker: PeriodicTask::new("environment"),
            memory_warned: AtomicBool::new(false),
            panic_marker: AtomicBool::new(false),
            delegate,
            shut_down: AtomicBool::new(false),
        });

        if inner.config.install_crash_handlers {
            marker::prepare(&inner.marker_path)?;
            marker::install()?;
            let sink: Weak<dyn CrashSink> = Arc::downgrade(&inner) as Weak<dyn CrashSink>;
            panic_hook::install(sink);
        }

        let handle = runtime.handle();
        inner.activity.start(handle);
        inner.uploader.start(handle);
        let weak = Arc::downgrade(&inner);
        inner
            .environment_ticker
            .start(handle, inner.config.environment_interval(), move || {
                if let Some(inner) = weak.upgrade() {
                    inner.environment_tick();
                }
            });

        let mut payload = ValueMap::new();
        payload.insert(
            "hadCrashInPreviousSession".into(),
            Value::from(inner.scorer.had_crash_in_previous_session()),
        );
        payload.insert(
            "recoveredCrashes".into(),
            Value::from(inner.uploader.recovered_crashes()),
        );
        inner.emit(EventKind::SessionStart, None, payload);

        log_info!(
            "session {} started (sample rate {})",
            inner.session.snapshot().session_id,
            inner.config.base_sample_rate
        );

        Ok(Self {
            inner,
            runtime: Some(runtime),
        })
    }

    /// Start with the HTTP transport built from `config`.
    pub fn start_with_http(
        config: ObserverConfig,
        delegate: Option<Arc<dyn ObserverDelegate>>,
    ) -> Result<Self> {
        let transport = HttpTransport::new(&config.base_url, &config.api_key);
        Self::start(config, Box::new(transport), delegate)
    }

    /// Report a detection from a UI or OS adapter. Returns the sampling
    /// decision taken for the resulting event.
    pub fn notify_signal(
        &self,
        detection: &Detection,
        screen: Option<&str>,
        metadata: ValueMap,
    ) -> SamplingDecision {
        let signal = classifier::classify(detection);
        let risk = self.inner.scorer.record(&signal);
        if signal.kind.is_interaction() {
            self.inner.activity.record_interaction();
        }

        match detection {
            Detection::HandledError { message } => self.inner.breadcrumbs.log_error(message, screen),
            Detection::MainThreadStall { .. }
            | Detection::UncaughtException { .. }
            | Detection::FatalCrash => self.inner.breadcrumbs.log_critical(detection.describe()),
            _ => self.inner.breadcrumbs.log(detection.describe()),
        }

        if let Some(delegate) = &self.inner.delegate {
            delegate.on_event(&signal);
        }

        let mut payload = detection_fields(detection);
        payload.extend(metadata);
        payload.insert("riskScore".into(), Value::from(risk.score));
        self.inner.emit(EventKind::Signal(signal.kind), screen, payload)
    }

    pub fn notify_screen_change(&self, name: &str) -> SamplingDecision {
        self.inner.session.set_screen(name);
        self.inner.breadcrumbs.log_screen_view(name);
        self.inner.activity.record_interaction();
        let mut payload = ValueMap::new();
        payload.insert("screen".into(), Value::from(name));
        self.inner.emit(EventKind::ScreenView, None, payload)
    }

    /// Capture a fatal host-level error. The report is on disk, the crash
    /// marker is written and a bounded synchronous send has been attempted
    /// by the time this returns. Returns the report id when it was persisted.
    pub fn notify_crash_possible(&self, context: CrashContext) -> Option<String> {
        self.inner
            .scorer
            .record(&Signal::new(SignalKind::Crash, Utc::now()));
        self.inner.breadcrumbs.log_critical(format!("crash: {}", context.title));
        let report_id = self.inner.capture_crash(context);
        self.inner.panic_marker.store(false, Ordering::SeqCst);
        report_id
    }

    /// OS memory-pressure notification.
    pub fn notify_memory_warning(&self) -> SamplingDecision {
        self.inner.memory_warning(None)
    }

    /// Host-defined event, sampled like everything else.
    pub fn track_event(&self, name: &str, payload: ValueMap) -> SamplingDecision {
        self.inner.breadcrumbs.log(format!("event: {name}"));
        self.inner.activity.record_interaction();
        self.inner.emit(EventKind::Custom(name.to_string()), None, payload)
    }

    pub fn risk(&self) -> RiskState {
        self.inner.scorer.state()
    }

    pub fn activity(&self) -> ActivityState {
        self.inner.activity.state()
    }

    pub fn breadcrumbs(&self) -> &Breadcrumbs {
        &self.inner.breadcrumbs
    }

    pub fn session(&self) -> SessionInfo {
        self.inner.session.snapshot()
    }

    pub fn had_crash_in_previous_session(&self) -> bool {
        self.inner.scorer.had_crash_in_previous_session()
    }

    pub fn recovered_crashes(&self) -> usize {
        self.inner.uploader.recovered_crashes()
    }

    pub fn uploader(&self) -> &Uploader {
        &self.inner.uploader
    }

    pub fn environment(&self) -> EnvironmentSnapshot {
        self.inner.environment.latest()
    }

    /// Events the sampler dropped so far this session.
    pub fn dropped_events(&self) -> u64 {
        self.inner.sampler.dropped_count()
    }

    pub fn flush(&self) {
        self.inner.uploader.flush();
    }

    /// Stop the timers, announce the end of the session and drain the
    /// upload queue (bounded by the sync send timeout). Idempotent.
    ///
    /// Reaching this outside an unwinding panic means the process survived
    /// every panic it saw, so their marker no longer stands for a crash. The
    /// reports themselves stay queued.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        inner.activity.stop();
        inner.environment_ticker.stop();

        let session = inner.session.snapshot();
        let dropped = inner.sampler.take_dropped_count() + inner.uploader.overflow_dropped();
        let mut payload = ValueMap::new();
        payload.insert("droppedEvents".into(), Value::from(dropped));
        payload.insert(
            "durationMs".into(),
            Value::from((Utc::now() - session.started_at).num_milliseconds()),
        );
        inner.emit(EventKind::SessionEnd, None, payload);

        inner.uploader.flush();
        if !inner.uploader.barrier(inner.config.sync_send_timeout()) {
            log_warn!("upload queue not drained before shutdown");
        }
        inner.uploader.stop();

        if !std::thread::panicking() {
            if inner.panic_marker.swap(false, Ordering::SeqCst) {
                log_info!("process survived its panics; clearing crash marker");
                if let Err(err) = marker::remove(&inner.marker_path) {
                    log_error!("{err:#}");
                }
            }
            if let Err(err) = std::fs::remove_file(&inner.sentinel_path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    log_error!("failed to remove session sentinel: {err}");
                }
            }
        }
        log_info!("session {} ended", session.session_id);
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl Inner {
    /// Sample and, if accepted, queue one event.
    fn emit(&self, kind: EventKind, screen: Option<&str>, mut payload: ValueMap) -> SamplingDecision {
        let session = self.session.snapshot();
        let screen = screen.map(str::to_string).or_else(|| session.current_screen.clone());

        let decision = self.sampler.should_transmit(SamplingInput {
            kind: &kind,
            screen: screen.as_deref(),
            base_rate: self.config.base_sample_rate,
            risk: self.scorer.state(),
            activity: self.activity.state(),
        });

        if decision.transmit {
            if let Some(screen) = screen {
                payload.entry("screen".into()).or_insert(Value::from(screen));
            }
            payload.insert("sampleRate".into(), Value::from(decision.effective_rate));
            self.uploader.enqueue_event(&EventRecord::new(kind, payload, session));
        } else {
            log_debug!(
                "dropped {} event (rate {:.3}, {:?})",
                kind.wire_name(),
                decision.effective_rate,
                decision.reason
            );
        }
        decision
    }

    fn capture_crash(&self, context: CrashContext) -> Option<String> {
        let breadcrumbs = context
            .breadcrumbs
            .unwrap_or_else(|| self.breadcrumbs.entries());
        let environment = context
            .environment
            .unwrap_or_else(|| self.environment.latest().to_map());
        let report = CrashReport::new(
            context.title,
            context.reason,
            context.stack_trace,
            breadcrumbs,
            environment,
            self.session.snapshot(),
        );

        let pending = match self.uploader.persist(&report) {
            Ok(pending) => Some(pending),
            Err(err) => {
                log_error!("failed to persist crash report: {err:#}");
                None
            }
        };

        let report_id = pending.as_ref().map(|p| p.report.id.clone());
        if let Err(err) = marker::write_exception(
            &self.marker_path,
            &report.title,
            &report.reason,
            report_id.as_deref(),
        ) {
            log_error!("{err:#}");
        }

        if let Some(delegate) = &self.delegate {
            delegate.on_crash(&report.render_text());
        }

        let pending = pending?;
        if upload::on_upload_thread() {
            // The worker cannot wait on itself; leave it for the next flush.
            self.uploader.enqueue_pending(pending);
        } else if let Err(err) = self
            .uploader
            .send_pending_now(pending, self.config.sync_send_timeout())
        {
            log_warn!("crash report {} kept for next launch: {err}", report.id);
        }
        report_id
    }

    fn environment_tick(&self) {
        let snapshot = self.environment.capture_and_persist();
        let pressure = snapshot.memory_pressure();
        if pressure >= self.config.memory_warning_ratio {
            if !self.memory_warned.swap(true, Ordering::SeqCst) {
                self.memory_warning(Some(pressure));
            }
        } else {
            self.memory_warned.store(false, Ordering::SeqCst);
        }
    }

    fn memory_warning(&self, pressure: Option<f64>) -> SamplingDecision {
        let mut payload = ValueMap::new();
        match pressure {
            Some(pressure) => {
                self.breadcrumbs
                    .log_critical(format!("memory warning: {:.0}% used", pressure * 100.0));
                payload.insert("memoryPressure".into(), Value::from(pressure));
            }
            None => self.breadcrumbs.log_critical("memory warning"),
        }
        self.emit(EventKind::MemoryWarning, None, payload)
    }
}

impl CrashSink for Inner {
    fn capture_panic(&self, details: PanicDetails) {
        self.scorer
            .record(&Signal::new(SignalKind::Crash, Utc::now()));
        let reason = details.reason();
        self.breadcrumbs.log_critical(format!("panic: {}", details.message));
        self.capture_crash(CrashContext {
            title: "panic".to_string(),
            reason,
            stack_trace: details.backtrace,
            breadcrumbs: None,
            environment: None,
        });
        self.panic_marker.store(true, Ordering::SeqCst);
    }
}

/// Turn a marker left by a dead process into a report, unless that process
/// already persisted a full one (which the uploader replays on its own).
fn replay_marker(
    uploader: &Uploader,
    record: &MarkerRecord,
    breadcrumbs: Vec<Breadcrumb>,
    environment: Option<&EnvironmentSnapshot>,
    session: SessionInfo,
) {
    if record.report_id().is_some() {
        log_debug!("crash marker refers to a persisted report; nothing to rebuild");
        return;
    }

    let mut report = CrashReport::new(
        record.title(),
        record.reason(),
        String::new(),
        breadcrumbs,
        environment.map(EnvironmentSnapshot::to_map).unwrap_or_default(),
        session,
    );
    if let Some(at) = record.observed_at() {
        report.observed_at = at;
    }

    match uploader.enqueue_crash(&report) {
        Ok(()) => uploader.flush(),
        Err(err) => log_error!("failed to queue recovered crash: {err:#}"),
    }
}

fn detection_fields(detection: &Detection) -> ValueMap {
    let mut fields = ValueMap::new();
    match detection {
        Detection::RageTap {
            tap_count,
            span,
            radius_pt,
        } => {
            fields.insert("tapCount".into(), Value::from(*tap_count));
            fields.insert("spanMs".into(), Value::from(duration_ms(*span)));
            fields.insert("radiusPt".into(), Value::from(*radius_pt));
        }
        Detection::DeadClick { target } => {
            fields.insert("target".into(), Value::from(target.as_str()));
        }
        Detection::MainThreadStall { duration } => {
            fields.insert("durationMs".into(), Value::from(duration_ms(*duration)));
        }
        Detection::HandledError { message } => {
            fields.insert("message".into(), Value::from(message.as_str()));
        }
        Detection::UncaughtException { name } => {
            fields.insert("name".into(), Value::from(name.as_str()));
        }
        Detection::HttpFailure { status } => {
            fields.insert("statusCode".into(), Value::from(u32::from(*status)));
        }
        Detection::GhostTouch | Detection::FatalCrash => {}
    }
    fields
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
