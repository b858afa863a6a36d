//! Driver error types.

use std::time::Duration;

use thiserror::Error;

use crate::DriverKind;

/// Errors raised by driver construction, lookup and backend operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// No driver of this kind has been installed in the registry.
    #[error("{0} driver not initialized, connect a new one instead")]
    NotInitialized(DriverKind),

    /// The driver kind discriminator is not recognized.
    #[error("unsupported driver kind: {0:?}")]
    UnsupportedKind(String),

    /// The backend could not be reached or opened.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Connecting did not complete within the bounded timeout.
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    /// The driver was closed; no further operations are accepted.
    #[error("driver closed")]
    Closed,

    /// Underlying storage I/O failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// Encoding or decoding a stored value failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The addressed record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A record with the same unique key already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The token is malformed or its signature does not verify.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// The token is past its expiry.
    #[error("token expired")]
    TokenExpired,

    /// The token was issued before the user's refresh tokens were revoked.
    #[error("token revoked")]
    TokenRevoked,

    /// The credentials file is unreadable or incomplete.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
}

impl DriverError {
    /// Returns true if retrying the same call may succeed.
    ///
    /// Connection timeouts and I/O failures may clear up; everything else
    /// reflects state or input that a retry will not change.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Io(_) | Self::Connect(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_error_display() {
        let err = DriverError::NotInitialized(DriverKind::DocumentStore);
        assert_eq!(err.to_string(), "document-store driver not initialized, connect a new one instead");

        let err = DriverError::UnsupportedKind("redis".to_string());
        assert_eq!(err.to_string(), "unsupported driver kind: \"redis\"");

        let err = DriverError::Timeout(Duration::from_secs(10));
        assert_eq!(err.to_string(), "connect timed out after 10s");
    }

    #[test]
    fn transient_errors() {
        assert!(DriverError::Io("disk".to_string()).is_transient());
        assert!(DriverError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!DriverError::Closed.is_transient());
        assert!(!DriverError::TokenRevoked.is_transient());
    }
}
