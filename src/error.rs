use thiserror::Error;

/// Failure to deliver a batch to the collector. Always treated as transient:
/// the batch stays buffered (and crash files stay on disk) for the next try.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("collector unreachable: {0}")]
    Unreachable(String),

    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("collector rejected batch with status {0}")]
    Status(u16),

    #[error("uploader worker is not running")]
    WorkerGone,
}

/// A dynamic payload value that cannot be expressed in the wire format.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodeError {
    #[error("non-finite number at '{path}'")]
    NonFiniteNumber { path: String },

    #[error("JSON serialization failed: {0}")]
    Json(String),
}

impl From<serde_json::Error> for EncodeError {
    fn from(err: serde_json::Error) -> Self {
        EncodeError::Json(err.to_string())
    }
}
