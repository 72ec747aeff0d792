pub mod report;
pub mod session;
pub mod signal;
pub mod value;

pub use report::{Breadcrumb, CrashReport, EventRecord};
pub use session::{SessionInfo, SessionTracker};
pub use signal::{EventKind, Signal, SignalKind};
pub use value::{Value, ValueMap};
