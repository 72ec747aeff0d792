use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::Cell;
use std::panic;
use std::sync::Weak;

/// What the hook learned about a panic.
#[derive(Debug, Clone)]
pub struct PanicDetails {
    pub message: String,
    pub location: Option<String>,
    pub thread: Option<String>,
    pub backtrace: String,
}

impl PanicDetails {
    pub fn reason(&self) -> String {
        let mut reason = self.message.clone();
        if let Some(location) = &self.location {
            reason.push_str(&format!(" at {location}"));
        }
        if let Some(thread) = &self.thread {
            reason.push_str(&format!(" (thread '{thread}')"));
        }
        reason
    }
}

/// Receiver for panics observed by the hook.
pub trait CrashSink: Send + Sync {
    fn capture_panic(&self, details: PanicDetails);
}

thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// Chain a hook in front of the current one. The sink is held weakly: once
/// it is dropped the hook only forwards to the previous hook.
pub fn install(sink: Weak<dyn CrashSink>) {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        // A panic while capturing must not recurse.
        let reentered = IN_HOOK.with(|flag| flag.replace(true));
        if !reentered {
            if let Some(sink) = sink.upgrade() {
                let details = PanicDetails {
                    message: payload_message(info.payload()),
                    location: info
                        .location()
                        .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column())),
                    thread: std::thread::current().name().map(str::to_string),
                    backtrace: Backtrace::force_capture().to_string(),
                };
                sink.capture_panic(details);
            }
            IN_HOOK.with(|flag| flag.set(false));
        }
        previous(info);
    }));
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}
