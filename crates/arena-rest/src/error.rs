use thiserror::Error;

#[derive(Debug, Error)]
pub enum RestError {
    #[error("request failed: {0}")]
    Http(String),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("response body did not decode: {0}")]
    Decode(String),

    #[error("bad url: {0}")]
    BadUrl(String),
}

impl RestError {
    /// Whether a retry of the same request can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RestError::Http(_) => true,
            RestError::Status(status) => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert!(RestError::Status(503).is_retryable());
        assert!(RestError::Status(429).is_retryable());
        assert!(RestError::Http("connection reset".into()).is_retryable());
    }

    #[test]
    fn client_errors_are_not() {
        assert!(!RestError::Status(403).is_retryable());
        assert!(!RestError::Decode("truncated".into()).is_retryable());
    }
}
