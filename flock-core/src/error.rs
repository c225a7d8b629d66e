//! Error types for Flock
//!
//! Error taxonomy covering session, group, contention, and detection
//! failures.

use thiserror::Error;

/// Primary error type for all Flock operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlockError {
    // ========== Session errors ==========
    /// The coordination-service session expired
    #[error("session expired")]
    SessionExpired,

    /// The session timed out waiting for the connection to be restored
    #[error("session expired: timed out waiting for reconnection")]
    SessionTimedOut,

    /// The service rejected our credentials
    #[error("failed to authenticate with the coordination service: {message}")]
    AuthenticationFailed { message: String },

    // ========== Group errors ==========
    /// A non-retryable service failure took the group down
    #[error("group operation failed: {message}")]
    GroupFailed { message: String },

    /// Only memberships created through this group can be cancelled
    #[error("membership {sequence} is not owned by this group")]
    NotOwned { sequence: u64 },

    /// The member's node disappeared before its data could be read
    #[error("membership {sequence} is no longer part of the group")]
    MemberGone { sequence: u64 },

    // ========== Contention errors ==========
    /// A contender accepts a single contend() call
    #[error("cannot contend more than once")]
    AlreadyContending,

    /// withdraw() is only valid after contend()
    #[error("cannot withdraw before contending")]
    NotContending,

    // ========== Detection errors ==========
    /// The leader's payload did not parse into an identity
    #[error("malformed leader payload: {reason}")]
    MalformedIdentity { reason: String },

    // ========== Construction errors ==========
    /// The connection specification could not be parsed
    #[error("invalid connection specification: {reason}")]
    InvalidSpec { reason: String },

    /// The component's background task is gone
    #[error("component has shut down")]
    Shutdown,
}

impl FlockError {
    /// Returns true if this error ends the originating group for good.
    ///
    /// Terminal errors are sticky: once a group reports one, every
    /// subsequent operation on it fails with the same error.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlockError::SessionExpired
                | FlockError::SessionTimedOut
                | FlockError::AuthenticationFailed { .. }
                | FlockError::GroupFailed { .. }
        )
    }
}

/// Result type alias for Flock operations
pub type Result<T> = std::result::Result<T, FlockError>;
