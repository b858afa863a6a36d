//! Concrete session for one client connection.
//!
//! Outbound packets go through a bounded queue drained by a single writer
//! task, so pushes never block on the network and a slow client surfaces as
//! [`PushError::Backpressure`] instead of stalling the group that pushes to it.

#![allow(clippy::disallowed_types, reason = "Synchronous attribute bag only")]

use std::{
    any::Any,
    collections::{HashMap, hash_map::Entry},
    fmt,
    sync::{
        Arc, Mutex, OnceLock, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use huddle_core::{PushError, Session, SessionId, Uid};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{stats::TrafficStats, transport::QuinnConnection, wire::Packet};

/// Default depth of a connection's outbound queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

type Attribute = Arc<dyn Any + Send + Sync>;

/// Errors from session-local operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// `bind` called on a session that already has a UID.
    #[error("session already bound to uid {0}")]
    AlreadyBound(Uid),

    /// Outbound delivery failed.
    #[error(transparent)]
    Push(#[from] PushError),
}

/// One live client connection.
pub struct Connection {
    id: SessionId,
    uid: OnceLock<Uid>,
    uuid: String,
    attributes: Mutex<HashMap<String, Attribute>>,
    outbound: mpsc::Sender<Packet>,
    closed: AtomicBool,
    transport: Option<QuinnConnection>,
}

impl Connection {
    /// Create a session with an outbound queue of `capacity` packets.
    ///
    /// Returns the receiving end of the queue; hand it to
    /// [`Connection::write_outbound`] (or read it directly in tests).
    pub fn new(
        id: SessionId,
        capacity: usize,
        transport: Option<QuinnConnection>,
    ) -> (Arc<Self>, mpsc::Receiver<Packet>) {
        let (outbound, receiver) = mpsc::channel(capacity.max(1));
        let connection = Arc::new(Self {
            id,
            uid: OnceLock::new(),
            uuid: uuid::Uuid::new_v4().to_string(),
            attributes: Mutex::new(HashMap::new()),
            outbound,
            closed: AtomicBool::new(false),
            transport,
        });
        (connection, receiver)
    }

    /// Bind the logical identity. Allowed once.
    pub fn bind(&self, uid: Uid) -> Result<(), SessionError> {
        self.uid.set(uid).map_err(|_| SessionError::AlreadyBound(self.uid().unwrap_or(uid)))?;
        tracing::debug!(session_id = self.id, uid, "session bound");
        Ok(())
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.attrs().insert(key.into(), Arc::new(value));
    }

    /// Store `value` under `key` unless the key is already taken.
    ///
    /// Returns whether `value` was stored. The check and the insert happen
    /// under one lock, so concurrent callers cannot both win.
    pub fn set_if_absent<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) -> bool {
        match self.attrs().entry(key.into()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(value));
                true
            },
        }
    }

    /// Value under `key` if present and of type `T`.
    pub fn value<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let attribute = self.attrs().get(key).cloned()?;
        attribute.downcast::<T>().ok()
    }

    /// Whether any value is stored under `key`.
    pub fn has_key(&self, key: &str) -> bool {
        self.attrs().contains_key(key)
    }

    /// Remove the value under `key`.
    pub fn remove(&self, key: &str) {
        self.attrs().remove(key);
    }

    /// Answer request `mid`.
    pub fn respond(&self, mid: u64, data: impl Into<Bytes>) -> Result<(), SessionError> {
        self.enqueue(Packet::response(mid, data)).map_err(SessionError::from)
    }

    /// Mark the session closed and drop its transport.
    ///
    /// Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(transport) = &self.transport {
            transport.close(0u32.into(), b"session closed");
        }
        tracing::debug!(session_id = self.id, uid = ?self.uid(), "session closed");
        true
    }

    /// Whether [`Connection::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Remote peer address, when backed by a real transport.
    pub fn remote_addr(&self) -> Option<std::net::SocketAddr> {
        self.transport.as_ref().map(QuinnConnection::remote_addr)
    }

    /// Drain `outbound` onto `stream` until the queue closes or a write fails.
    pub async fn write_outbound(
        session_id: SessionId,
        mut outbound: mpsc::Receiver<Packet>,
        mut stream: quinn::SendStream,
        stats: Arc<TrafficStats>,
    ) {
        while let Some(packet) = outbound.recv().await {
            let bytes = match packet.to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(session_id, route = %packet.route, error = %e, "dropping unencodable packet");
                    continue;
                },
            };

            if let Err(e) = stream.write_all(&bytes).await {
                tracing::debug!(session_id, error = %e, "outbound write failed");
                break;
            }
            stats.record_outbound(bytes.len());
        }

        let _ = stream.finish();
    }

    fn enqueue(&self, packet: Packet) -> Result<(), PushError> {
        if self.is_closed() {
            return Err(PushError::Closed);
        }
        self.outbound.try_send(packet).map_err(|e| match e {
            TrySendError::Full(_) => PushError::Backpressure,
            TrySendError::Closed(_) => PushError::Closed,
        })
    }

    fn attrs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Attribute>> {
        self.attributes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Session for Connection {
    fn id(&self) -> SessionId {
        self.id
    }

    fn uid(&self) -> Option<Uid> {
        self.uid.get().copied()
    }

    fn uuid(&self) -> &str {
        &self.uuid
    }

    async fn push(&self, route: &str, data: Bytes) -> Result<(), PushError> {
        self.enqueue(Packet::push(route, data))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("uid", &self.uid())
            .field("uuid", &self.uuid)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
