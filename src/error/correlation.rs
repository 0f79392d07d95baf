use thiserror::Error;

/// Terminal outcomes of a pending response other than a matching `Response`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("Timed out waiting for response {key}.")]
    Timeout { key: String },
    #[error("Connection carrying {key} was lost.")]
    ConnectionLost { key: String },
    #[error("Response {key} was cancelled.")]
    Cancelled { key: String },
}
