use thiserror::Error;

/// Malformed address or element text. Always recoverable: parsing
/// surfaces `None`/`false` to callers instead of propagating this.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("address domain must not be empty")]
    EmptyDomain,

    #[error("unparseable address: {0}")]
    BadAddress(String),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("no correlated reply within deadline")]
    Timeout,

    #[error("handshake step failed: {0}")]
    Handshake(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("session is not ready")]
    NotReady,

    #[error("malformed value: {0}")]
    Format(#[from] FormatError),
}

impl ChatError {
    /// Whether retrying the failed operation can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::Timeout | ChatError::Transport(_) | ChatError::NotReady
        )
    }
}
