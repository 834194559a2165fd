use thiserror::Error;

/// Errors that can occur during RPC operations.
///
/// Callers of [`RpcClient::call`](crate::RpcClient::call) can tell apart a
/// reply that never came (`Timeout`, `ConsumerCancelled`, `Cancelled`) from a
/// remote failure (`Handler`). A legitimately empty answer is not an error; it
/// is returned as `Ok(None)`.
#[derive(Error, Debug)]
pub enum RpcError {
    /// The broker could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// No reply arrived before the caller's deadline.
    #[error("request timed out")]
    Timeout,

    /// The broker cancelled the reply consumer (e.g. connection loss).
    #[error("consumer cancelled by broker")]
    ConsumerCancelled,

    /// The caller cancelled the pending request.
    #[error("request cancelled by caller")]
    Cancelled,

    /// The remote handler replied with `status: error`.
    ///
    /// Displays the remote message verbatim.
    #[error("{0}")]
    Handler(String),

    /// A request reached the server without the metadata or body it needs.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A reply carried the right correlation id but could not be decoded.
    #[error("invalid reply: {0}")]
    InvalidReply(String),

    /// Transport operation failed (declare, publish, consume, ack, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration rejected at startup.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RpcError {
    /// Build a handler failure carrying `msg` as the reply's `errorMessage`.
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    /// Whether a connection attempt that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Result type alias for RPC operations
pub type Result<T> = std::result::Result<T, RpcError>;
