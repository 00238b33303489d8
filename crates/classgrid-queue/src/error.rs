//! Queue error types.

use thiserror::Error;

/// Result type alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors surfaced by a broker.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Broker unreachable, throttled, or timed out. Safe to retry; never
    /// implies the message was lost.
    #[error("transient broker error: {0}")]
    Transient(String),

    /// A stored message could not be decoded.
    #[error("malformed message {id}: {reason}")]
    Malformed { id: String, reason: String },

    /// Any other broker failure.
    #[error("broker error: {0}")]
    Backend(String),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Transient(_))
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_timeout()
            || e.is_connection_dropped()
            || e.is_connection_refusal()
            || e.is_io_error()
        {
            QueueError::Transient(e.to_string())
        } else {
            QueueError::Backend(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(QueueError::Transient("throttled".into()).is_transient());
        assert!(!QueueError::Backend("denied".into()).is_transient());
        assert!(
            !QueueError::Malformed {
                id: "m-1".into(),
                reason: "bad json".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn redis_io_errors_are_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: QueueError = redis::RedisError::from(io).into();
        assert!(err.is_transient());

        let typed: QueueError =
            redis::RedisError::from((redis::ErrorKind::TypeError, "wrong type")).into();
        assert!(matches!(typed, QueueError::Backend(_)));
    }
}
