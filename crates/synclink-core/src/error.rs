//! Error taxonomy shared across components.
//!
//! Each component has its own error enum; every one of them maps onto an
//! [`ErrorKind`] so callers can apply one propagation policy.

use std::fmt;

/// Coarse error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing, invalid or expired credential. Rejected before registration.
    Unauthenticated,
    /// The bus cannot accept the write. Surfaced only to durable publishers.
    TransportUnavailable,
    /// A socket failed. Handled by unregistering the connection.
    ConnectionLost,
    /// An outbound queue overflowed and a message was dropped for one device.
    SlowConsumer,
    /// The session/message store failed. Safe to retry.
    Store,
    /// The caller is authenticated but not allowed to do this.
    Forbidden,
    /// The request itself is malformed.
    InvalidRequest,
}

impl ErrorKind {
    /// Label used in logs, metrics and error bodies.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::TransportUnavailable => "transport_unavailable",
            ErrorKind::ConnectionLost => "connection_lost",
            ErrorKind::SlowConsumer => "slow_consumer",
            ErrorKind::Store => "store_error",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::InvalidRequest => "invalid_request",
        }
    }

    /// Whether repeating the same request may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::TransportUnavailable | ErrorKind::Store | ErrorKind::ConnectionLost
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::Store.is_retryable());
        assert!(ErrorKind::TransportUnavailable.is_retryable());
        assert!(!ErrorKind::Unauthenticated.is_retryable());
        assert!(!ErrorKind::Forbidden.is_retryable());
        assert_eq!(ErrorKind::SlowConsumer.to_string(), "slow_consumer");
    }
}
