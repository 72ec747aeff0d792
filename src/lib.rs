pub mod activity;
pub mod breadcrumbs;
pub mod classifier;
pub mod config;
pub mod crash;
pub mod environment;
pub mod error;
pub mod models;
pub mod observer;
pub mod risk;
pub mod sampling;
pub mod upload;
pub mod utils;

pub use activity::{ActivityEstimator, ActivityState};
pub use breadcrumbs::Breadcrumbs;
pub use classifier::{classify, Detection};
pub use config::{ObserverConfig, RiskThresholds, SignalWeights};
pub use error::{EncodeError, TransportError};
pub use models::{Breadcrumb, CrashReport, EventKind, SessionInfo, Signal, SignalKind, Value, ValueMap};
pub use observer::{CrashContext, Observer, ObserverDelegate};
pub use risk::{RiskScorer, RiskState, RiskTier};
pub use sampling::{DecisionReason, SamplingDecision, SamplingEngine};
pub use upload::{Endpoint, HttpTransport, Transport, Uploader};
pub use utils::logging::init_logging;

/// Reported in every environment snapshot.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");
