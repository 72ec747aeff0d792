//! Gated logging macros plus the optional logger bootstrap for hosts.
//!
//! Every module that logs declares its own switch and then uses the macros
//! exported at the crate root:
//! ```ignore
//! const ENABLE_LOGS: bool = true;
//!
//! use crate::{log_info, log_warn};
//!
//! log_info!("flushed {} events", count);
//! ```
//! All records go to the `frictionwatch` target so a host can filter the SDK
//! with `RUST_LOG=frictionwatch=debug` without touching its own modules.

/// Log target shared by every SDK module.
pub const LOG_TARGET: &str = "frictionwatch";

/// Conditional debug logging, gated on the calling module's `ENABLE_LOGS`.
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::debug!(target: $crate::utils::logging::LOG_TARGET, $($arg)*);
        }
    };
}

/// Conditional info logging, gated on the calling module's `ENABLE_LOGS`.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!(target: $crate::utils::logging::LOG_TARGET, $($arg)*);
        }
    };
}

/// Conditional warn logging, gated on the calling module's `ENABLE_LOGS`.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!(target: $crate::utils::logging::LOG_TARGET, $($arg)*);
        }
    };
}

/// Conditional error logging, gated on the calling module's `ENABLE_LOGS`.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!(target: $crate::utils::logging::LOG_TARGET, $($arg)*);
        }
    };
}

/// Install an `env_logger` that honours `RUST_LOG`, defaulting to Info.
///
/// Hosts that already configured a logger keep theirs; the second
/// installation attempt is silently ignored.
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .try_init();
}
