use thiserror::Error;

/// Outcome of a failed chat exchange. None of these leave partial state behind.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// Caller error: blank message or session id. Not worth retrying.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No usable chat client was configured (e.g. missing API key).
    #[error("chat service is not configured: {0}")]
    MisconfiguredService(String),

    /// The model call failed, timed out or produced nothing usable.
    /// Safe to retry with the same message.
    #[error("chat service unavailable: {0}")]
    ServiceUnavailable(String),
}
