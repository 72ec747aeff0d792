//! Crash capture: the signal-safe marker and the panic hook.

pub mod marker;
pub mod panic_hook;

pub use marker::MarkerRecord;
pub use panic_hook::{CrashSink, PanicDetails};
