//! Durable crash marker.
//!
//! A fatal signal leaves a small file behind so the next launch knows the
//! previous process died. The handler only touches pre-resolved globals and
//! async-signal-safe libc calls: no allocation, no locks, no buffered I/O.

use std::ffi::CString;
use std::fs;
use std::io::Write;
use std::os::raw::c_int;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

pub const MARKER_FILE: &str = "crash.marker";

pub const FATAL_SIGNALS: [c_int; 7] = [
    libc::SIGABRT,
    libc::SIGILL,
    libc::SIGSEGV,
    libc::SIGFPE,
    libc::SIGBUS,
    libc::SIGPIPE,
    libc::SIGTRAP,
];

static MARKER_PATH: OnceLock<CString> = OnceLock::new();
static PREVIOUS: OnceLock<[libc::sigaction; FATAL_SIGNALS.len()]> = OnceLock::new();
static INSTALLED: AtomicBool = AtomicBool::new(false);
static HANDLING: AtomicBool = AtomicBool::new(false);

/// What the previous process left behind.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkerRecord {
    Signal {
        signal: i32,
        at: Option<DateTime<Utc>>,
    },
    Exception {
        name: String,
        reason: String,
        report_id: Option<String>,
        at: Option<DateTime<Utc>>,
    },
    /// The file exists but its content is unreadable. Still a crash.
    Unknown,
}

impl MarkerRecord {
    pub fn title(&self) -> String {
        match self {
            MarkerRecord::Signal { signal, .. } => signal_name(*signal).to_string(),
            MarkerRecord::Exception { name, .. } => name.clone(),
            MarkerRecord::Unknown => "UnknownCrash".to_string(),
        }
    }

    pub fn reason(&self) -> String {
        match self {
            MarkerRecord::Signal { signal, .. } => format!("fatal signal {signal}"),
            MarkerRecord::Exception { reason, .. } => reason.clone(),
            MarkerRecord::Unknown => "process terminated abnormally".to_string(),
        }
    }

    /// Id of a full report persisted alongside the marker, if any.
    pub fn report_id(&self) -> Option<&str> {
        match self {
            MarkerRecord::Exception { report_id, .. } => report_id.as_deref(),
            _ => None,
        }
    }

    pub fn observed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            MarkerRecord::Signal { at, .. } | MarkerRecord::Exception { at, .. } => *at,
            MarkerRecord::Unknown => None,
        }
    }
}

pub fn signal_name(signal: i32) -> &'static str {
    match signal {
        libc::SIGABRT => "SIGABRT",
        libc::SIGILL => "SIGILL",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGFPE => "SIGFPE",
        libc::SIGBUS => "SIGBUS",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGTRAP => "SIGTRAP",
        _ => "SIGNAL",
    }
}

pub fn marker_path(dir: &Path) -> std::path::PathBuf {
    dir.join(MARKER_FILE)
}

/// Resolve the marker path for the signal handler. Must run before
/// [`install`]. The first resolved path wins for the life of the process.
pub fn prepare(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create marker directory {}", parent.display()))?;
    }
    let resolved = path_to_cstring(path)?;
    if let Err(rejected) = MARKER_PATH.set(resolved) {
        if MARKER_PATH.get() != Some(&rejected) {
            log_warn!(
                "crash marker already bound to {:?}; ignoring {}",
                MARKER_PATH.get(),
                path.display()
            );
        }
    }
    Ok(())
}

fn path_to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).context("marker path contains a NUL byte")
}

/// Register the fatal-signal handlers. Second and later calls are no-ops.
///
/// Signals the process already ignores (Rust ignores `SIGPIPE` at startup)
/// are left alone so a broken socket does not turn into a crash.
pub fn install() -> Result<()> {
    if MARKER_PATH.get().is_none() {
        bail!("crash marker path not prepared");
    }
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    // SAFETY: zeroed sigaction is a valid "no handler" value; sigaction with a
    // null new action only reads the current disposition.
    let previous = PREVIOUS.get_or_init(|| unsafe {
        let mut table: [libc::sigaction; FATAL_SIGNALS.len()] = std::mem::zeroed();
        for (slot, &signal) in table.iter_mut().zip(FATAL_SIGNALS.iter()) {
            libc::sigaction(signal, std::ptr::null(), slot);
        }
        table
    });

    let mut installed = 0;
    for (index, &signal) in FATAL_SIGNALS.iter().enumerate() {
        if previous[index].sa_sigaction == libc::SIG_IGN {
            continue;
        }
        // SAFETY: the handler is an `extern "C"` fn with the SA_SIGINFO
        // signature and only uses async-signal-safe calls.
        let rc = unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handle_fatal_signal as libc::sighandler_t;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signal, &action, std::ptr::null_mut())
        };
        if rc == 0 {
            installed += 1;
        } else {
            log_warn!("failed to install handler for {}", signal_name(signal));
        }
    }
    log_info!("crash handlers installed for {installed} signals");
    Ok(())
}

extern "C" fn handle_fatal_signal(
    signal: c_int,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    // A fault inside the handler must not recurse into another write.
    if !HANDLING.swap(true, Ordering::SeqCst) {
        if let Some(path) = MARKER_PATH.get() {
            write_signal_record(path, signal);
        }
    }

    if let (Some(previous), Some(index)) = (
        PREVIOUS.get(),
        FATAL_SIGNALS.iter().position(|&s| s == signal),
    ) {
        let action = previous[index];
        let handler = action.sa_sigaction;
        if handler != libc::SIG_DFL && handler != libc::SIG_IGN {
            // SAFETY: the saved disposition was installed by someone else for
            // this very signal; the flag tells which signature it has.
            unsafe {
                if action.sa_flags & libc::SA_SIGINFO != 0 {
                    let chained: extern "C" fn(c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                        std::mem::transmute(handler);
                    chained(signal, info, context);
                } else {
                    let chained: extern "C" fn(c_int) = std::mem::transmute(handler);
                    chained(signal);
                }
            }
        }
    }

    // SAFETY: signal and raise are async-signal-safe.
    unsafe {
        libc::signal(signal, libc::SIG_DFL);
        libc::raise(signal);
    }
}

/// `signal=<n> time=<secs>.<millis>\n`, written with raw syscalls.
fn write_signal_record(path: &std::ffi::CStr, signal: c_int) {
    let mut buf = [0u8; 64];

    // SAFETY: zeroed timespec is valid; clock_gettime only writes into it.
    let now = unsafe {
        let mut now: libc::timespec = std::mem::zeroed();
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
        now
    };

    let mut len = push_bytes(&mut buf, 0, b"signal=");
    len = push_decimal(&mut buf, len, signal.max(0) as u64);
    len = push_bytes(&mut buf, len, b" time=");
    len = push_decimal(&mut buf, len, now.tv_sec.max(0) as u64);
    len = push_bytes(&mut buf, len, b".");
    let millis = (now.tv_nsec.max(0) as u64 / 1_000_000) % 1000;
    len = push_bytes(
        &mut buf,
        len,
        &[
            b'0' + (millis / 100) as u8,
            b'0' + (millis / 10 % 10) as u8,
            b'0' + (millis % 10) as u8,
        ],
    );
    len = push_bytes(&mut buf, len, b"\n");

    // SAFETY: path is NUL-terminated and buf[..len] is initialized. Every
    // failure is ignored.
    unsafe {
        let fd = libc::open(
            path.as_ptr(),
            libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC,
            0o644 as libc::c_uint,
        );
        if fd < 0 {
            return;
        }
        libc::write(fd, buf.as_ptr() as *const libc::c_void, len);
        libc::fsync(fd);
        libc::close(fd);
    }
}

fn push_bytes(buf: &mut [u8], len: usize, bytes: &[u8]) -> usize {
    let room = buf.len().saturating_sub(len);
    let take = bytes.len().min(room);
    buf[len..len + take].copy_from_slice(&bytes[..take]);
    len + take
}

fn push_decimal(buf: &mut [u8], len: usize, mut value: u64) -> usize {
    let mut digits = [0u8; 20];
    let mut count = 0;
    loop {
        digits[count] = b'0' + (value % 10) as u8;
        count += 1;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    digits[..count].reverse();
    push_bytes(buf, len, &digits[..count])
}

/// Marker written for an uncaught panic. Not signal-safe; runs on the
/// panicking thread.
pub fn write_exception(path: &Path, name: &str, reason: &str, report_id: Option<&str>) -> Result<()> {
    let now = Utc::now();
    let mut contents = format!(
        "exception={}\nreason={}\n",
        single_line(name),
        single_line(reason)
    );
    if let Some(id) = report_id {
        contents.push_str(&format!("report={}\n", single_line(id)));
    }
    contents.push_str(&format!(
        "time={}.{:03}\n",
        now.timestamp(),
        now.timestamp_subsec_millis()
    ));

    let mut file = fs::File::create(path)
        .with_context(|| format!("failed to create crash marker {}", path.display()))?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn single_line(text: &str) -> String {
    text.replace(['\n', '\r'], " ")
}

/// Existence is what matters: unreadable content still yields `Unknown`.
pub fn read(path: &Path) -> Option<MarkerRecord> {
    let bytes = fs::read(path).ok()?;
    let text = String::from_utf8_lossy(&bytes);
    Some(parse(&text).unwrap_or(MarkerRecord::Unknown))
}

fn parse(text: &str) -> Option<MarkerRecord> {
    let text = text.trim();
    if let Some(rest) = text.strip_prefix("signal=") {
        let mut parts = rest.split_whitespace();
        let signal = parts.next()?.parse().ok()?;
        let at = parts
            .next()
            .and_then(|part| part.strip_prefix("time="))
            .and_then(parse_time);
        return Some(MarkerRecord::Signal { signal, at });
    }

    if text.starts_with("exception=") {
        let mut name = None;
        let mut reason = String::new();
        let mut report_id = None;
        let mut at = None;
        for line in text.lines() {
            match line.split_once('=') {
                Some(("exception", value)) => name = Some(value.to_string()),
                Some(("reason", value)) => reason = value.to_string(),
                Some(("report", value)) if !value.is_empty() => report_id = Some(value.to_string()),
                Some(("time", value)) => at = parse_time(value),
                _ => {}
            }
        }
        return Some(MarkerRecord::Exception {
            name: name?,
            reason,
            report_id,
            at,
        });
    }

    None
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    let (secs, millis) = value.split_once('.').unwrap_or((value, "0"));
    let secs: i64 = secs.parse().ok()?;
    let millis: u32 = millis.parse().ok()?;
    Utc.timestamp_opt(secs, millis.min(999) * 1_000_000).single()
}

pub fn remove(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove crash marker {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_record_is_parseable() {
        let dir = tempfile::tempdir().unwrap();
        let path = marker_path(dir.path());
        let c_path = path_to_cstring(&path).unwrap();

        write_signal_record(&c_path, libc::SIGSEGV);

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.starts_with(&format!("signal={} time=", libc::SIGSEGV)));
        assert!(raw.ends_with('\n'));

        match read(&path) {
            Some(MarkerRecord::Signal { signal, at }) => {
                assert_eq!(signal, libc::SIGSEGV);
                let at = at.expect("timestamp");
                assert!((Utc::now() - at).num_seconds().abs() < 60);
            }
            other => panic!("unexpected marker {other:?}"),
        }
    }

    #[test]
    fn signal_record_truncates_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = marker_path(dir.path());
        fs::write(&path, "x".repeat(200)).unwrap();

        write_signal_record(&path_to_cstring(&path).unwrap(), libc::SIGABRT);
        let record = read(&path).unwrap();
        assert_eq!(record.title(), "SIGABRT");
    }

    #[test]
    fn exception_record_round_trips_report_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = marker_path(dir.path());
        write_exception(&path, "panic", "index out of bounds\nat main.rs", Some("abc-123")).unwrap();

        let record = read(&path).unwrap();
        assert_eq!(record.title(), "panic");
        assert_eq!(record.reason(), "index out of bounds at main.rs");
        assert_eq!(record.report_id(), Some("abc-123"));
        assert!(record.observed_at().is_some());
    }

    #[test]
    fn garbage_marker_still_counts_as_crash() {
        let dir = tempfile::tempdir().unwrap();
        let path = marker_path(dir.path());
        fs::write(&path, b"\xff\x00garbage").unwrap();
        assert_eq!(read(&path), Some(MarkerRecord::Unknown));
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = marker_path(dir.path());
        assert!(read(&path).is_none());
        fs::write(&path, "signal=6 time=1.000\n").unwrap();
        remove(&path).unwrap();
        remove(&path).unwrap();
        assert!(read(&path).is_none());
    }

    /// Set only in the re-executed child of `raised_signal_writes_marker_then_kills`.
    const CHILD_MARKER_ENV: &str = "FRICTIONWATCH_SIGNAL_CHILD_MARKER";

    extern "C" fn host_abort_handler(_signal: c_int) {
        let note = b"host abort handler ran\n";
        // SAFETY: write(2) is async-signal-safe; the buffer is static.
        unsafe {
            libc::write(2, note.as_ptr() as *const libc::c_void, note.len());
        }
    }

    /// Runs as a no-op in the normal test pass. In the child it installs a
    /// host handler, then ours on top of it, and aborts.
    #[test]
    fn abort_in_child_process() {
        let Some(path) = std::env::var_os(CHILD_MARKER_ENV) else {
            return;
        };
        // SAFETY: installs a plain handler that only calls write(2).
        unsafe {
            libc::signal(libc::SIGABRT, host_abort_handler as libc::sighandler_t);
        }
        prepare(Path::new(&path)).unwrap();
        install().unwrap();
        install().unwrap();
        // SAFETY: raising a signal for which handlers are installed.
        unsafe {
            libc::raise(libc::SIGABRT);
        }
        unreachable!("SIGABRT was re-raised with its default disposition");
    }

    #[test]
    fn raised_signal_writes_marker_then_kills() {
        use std::os::unix::process::ExitStatusExt;

        let dir = tempfile::tempdir().unwrap();
        let path = marker_path(dir.path());
        let output = std::process::Command::new(std::env::current_exe().unwrap())
            .args([
                "--exact",
                "crash::marker::tests::abort_in_child_process",
                "--test-threads=1",
                "--nocapture",
            ])
            .env(CHILD_MARKER_ENV, &path)
            .output()
            .unwrap();

        assert_eq!(output.status.signal(), Some(libc::SIGABRT), "{output:?}");
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert_eq!(stderr.matches("host abort handler ran").count(), 1);

        match read(&path) {
            Some(MarkerRecord::Signal { signal, at }) => {
                assert_eq!(signal, libc::SIGABRT);
                assert!(at.is_some());
            }
            other => panic!("unexpected marker {other:?}"),
        }
    }

    #[test]
    fn decimal_formatting_handles_edges() {
        let mut buf = [0u8; 32];
        let len = push_decimal(&mut buf, 0, 0);
        assert_eq!(&buf[..len], b"0");
        let len = push_decimal(&mut buf, 0, 1_700_000_000);
        assert_eq!(&buf[..len], b"1700000000");
    }
}
