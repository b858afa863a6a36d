//! Session capability consumed by groups.
//!
//! A group never sees a transport. It only needs to identify a session and
//! hand it already-encoded bytes; everything else (handshake, framing,
//! attribute bags) belongs to the concrete session type.

use std::{future::Future, time::Duration};

use bytes::Bytes;

/// Connection-scoped session identifier, unique per live connection.
pub type SessionId = u64;

/// Application-assigned logical identity, bound once per session.
pub type Uid = u64;

/// Number of characters of the UUID used for the short display form.
pub const SHORT_UUID_LEN: usize = 8;

/// A live client connection as seen by a group.
///
/// # Invariants
///
/// - `id()` is stable for the lifetime of the session
/// - `uid()` changes at most once, from `None` to `Some`
/// - `uuid()` is globally unique and never changes
pub trait Session: Send + Sync + 'static {
    /// Connection-scoped identifier. Used as the group membership key.
    fn id(&self) -> SessionId;

    /// Bound logical identity, `None` until the application binds one.
    fn uid(&self) -> Option<Uid>;

    /// Globally unique string identifier.
    fn uuid(&self) -> &str;

    /// Shortened display form of [`Session::uuid`].
    fn short_uuid(&self) -> &str {
        let uuid = self.uuid();
        uuid.get(..SHORT_UUID_LEN).unwrap_or(uuid)
    }

    /// Deliver one encoded message tagged with `route`.
    ///
    /// A failure does not imply the session is dead; groups log it and move
    /// on to the next member.
    fn push(&self, route: &str, data: Bytes) -> impl Future<Output = Result<(), PushError>> + Send;
}

/// Errors from delivering a message to one session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    /// Session has been closed and accepts no more messages.
    #[error("session closed")]
    Closed,

    /// Outbound queue is full.
    ///
    /// Transient: the client is not draining fast enough.
    #[error("outbound queue full")]
    Backpressure,

    /// Push did not complete within the group's push timeout.
    #[error("push timed out after {0:?}")]
    Timeout(Duration),

    /// Underlying transport failed.
    #[error("transport error: {0}")]
    Transport(String),
}
