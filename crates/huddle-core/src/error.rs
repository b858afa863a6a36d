//! Group error types.

use huddle_drivers::{DriverError, DriverKind};

use crate::{CodecError, PushError, SessionId};

/// Errors returned by [`crate::Group`] operations.
///
/// None of these leave the group in a partially mutated state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GroupError {
    /// Operation attempted after the group was closed.
    ///
    /// Create a new group to continue.
    #[error("group is closed")]
    ClosedGroup,

    /// `close` called on a group that is already closed.
    #[error("group already closed")]
    AlreadyClosed,

    /// A session with this connection ID is already a member.
    #[error("session {0} is already a member")]
    DuplicateSession(SessionId),

    /// No member matched the lookup. A normal negative result.
    #[error("member not found")]
    MemberNotFound,

    /// No driver of this kind has been installed in the registry.
    #[error("{0} driver not initialized, connect a new one instead")]
    DriverNotInitialized(DriverKind),

    /// The group already has a driver, of this kind.
    #[error("group already has a {0} driver")]
    DriverAlreadyAttached(DriverKind),

    /// Payload could not be serialized.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Driver connection or setup failed.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// Delivery to one member failed during a broadcast.
    #[error("push to session {session_id} failed: {source}")]
    Push {
        /// Session the push was addressed to
        session_id: SessionId,
        /// Underlying push failure
        source: PushError,
    },
}
