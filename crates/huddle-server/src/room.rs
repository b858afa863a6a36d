//! Chat rooms on top of session groups.
//!
//! Handles two routes:
//!
//! - `room.join` (request): bind the session, tell it who is already in the
//!   room (`onMembers`), announce it to everyone else (`onNewUser`), add it to
//!   the room and answer with a [`JoinResponse`].
//! - `room.message` (request or notify): broadcast a [`UserMessage`] to the
//!   room on `onMessage`.
//!
//! Backends are optional. With an identity provider installed, joining
//! requires a valid token. With a document store installed, rooms attach it
//! and every chat message is persisted to `huddle.messages` after it has been
//! broadcast.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bytes::Bytes;
use huddle_core::{Codec, CodecError, Group, GroupConfig, GroupError, PushError, Session};
use huddle_drivers::{DriverKind, DriverRegistry, document::Document};
use serde::{Deserialize, Serialize};
use tokio::{sync::RwLock, task::JoinHandle};

use crate::{
    session::{Connection, SessionError},
    wire::{Packet, PacketKind},
};

/// Route of the join request.
pub const JOIN_ROUTE: &str = "room.join";
/// Route of chat messages sent by clients.
pub const MESSAGE_ROUTE: &str = "room.message";
/// Push route carrying the current member list to a joiner.
pub const ON_MEMBERS: &str = "onMembers";
/// Push route announcing a new member.
pub const ON_NEW_USER: &str = "onNewUser";
/// Push route carrying chat messages.
pub const ON_MESSAGE: &str = "onMessage";

/// Room joined when the request names none.
pub const DEFAULT_ROOM_ID: u32 = 1;

/// Database and collection chat messages are persisted to.
pub const MESSAGES_DATABASE: &str = "huddle";
/// See [`MESSAGES_DATABASE`].
pub const MESSAGES_COLLECTION: &str = "messages";

const ROOM_KEY: &str = "ROOM_ID";
const IDENTITY_KEY: &str = "IDENTITY_UID";

/// Body of a `room.join` request. An empty body joins the default room.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Room to join.
    #[serde(default)]
    pub room: Option<u32>,
    /// Identity token, required when an identity provider is installed.
    #[serde(default)]
    pub token: Option<String>,
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    /// Sender display name.
    pub name: String,
    /// Message text.
    pub content: String,
}

/// `onNewUser` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    /// Human-readable announcement.
    pub content: String,
}

/// `onMembers` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllMembers {
    /// Short UUIDs of the members present before the joiner.
    pub members: Vec<String>,
}

/// Successful answer to `room.join`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    /// Zero on success.
    pub code: u16,
    /// `"success"`.
    pub result: String,
    /// Short UUID the joiner is known by.
    pub username: String,
}

/// Answer to a failed request, or the acknowledgement of a message request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    /// Zero on success, otherwise an HTTP-like status.
    pub code: u16,
    /// Outcome description.
    pub result: String,
}

/// Errors from room handlers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    /// Message sent before joining a room.
    #[error("not joined to a room")]
    NotJoined,

    /// Join sent by a session that is already in a room.
    #[error("already joined room {0}")]
    AlreadyJoined(u32),

    /// No handler for the route.
    #[error("unknown route {0:?}")]
    UnknownRoute(String),

    /// Only requests and notifications are handled.
    #[error("unexpected {0:?} packet from client")]
    UnexpectedKind(PacketKind),

    /// Token missing or rejected by the identity provider.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Payload could not be decoded or encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Group rejected the operation.
    #[error(transparent)]
    Group(#[from] GroupError),

    /// Session rejected the operation.
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl RoomError {
    /// Status code sent back to the client.
    pub fn code(&self) -> u16 {
        match self {
            Self::NotJoined | Self::Codec(_) | Self::UnexpectedKind(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::UnknownRoute(_) => 404,
            Self::AlreadyJoined(_) => 409,
            Self::Group(_) | Self::Session(_) => 500,
        }
    }
}

/// One chat room.
#[derive(Debug)]
pub struct Room {
    id: u32,
    group: Group<Connection>,
}

impl Room {
    /// Room number.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Members of the room.
    pub fn group(&self) -> &Group<Connection> {
        &self.group
    }
}

/// Owns every room and routes client packets to them.
pub struct RoomManager {
    rooms: RwLock<HashMap<u32, Arc<Room>>>,
    registry: DriverRegistry,
    config: GroupConfig,
}

impl RoomManager {
    /// Create a manager whose rooms use `config` and the drivers in `registry`.
    pub fn new(registry: DriverRegistry, config: GroupConfig) -> Self {
        Self { rooms: RwLock::new(HashMap::new()), registry, config }
    }

    fn codec(&self) -> Codec {
        self.config.codec
    }

    /// Handle one client packet, answering it when it is a request.
    ///
    /// The returned error has already been reported to the client for
    /// requests; callers only need to log it.
    pub async fn handle(&self, session: &Arc<Connection>, packet: Packet) -> Result<(), RoomError> {
        let outcome = self.dispatch(session, &packet).await;

        if packet.kind == PacketKind::Request {
            let body = match &outcome {
                Ok(body) => body.clone(),
                Err(e) => self.codec().encode(&Reply { code: e.code(), result: e.to_string() })?,
            };
            session.respond(packet.mid, body)?;
        }

        outcome.map(|_| ())
    }

    async fn dispatch(&self, session: &Arc<Connection>, packet: &Packet) -> Result<Bytes, RoomError> {
        if !matches!(packet.kind, PacketKind::Request | PacketKind::Notify) {
            return Err(RoomError::UnexpectedKind(packet.kind));
        }

        match packet.route.as_str() {
            JOIN_ROUTE => {
                let request = if packet.data.is_empty() {
                    JoinRequest::default()
                } else {
                    self.codec().decode(&packet.data)?
                };
                let response = self.join(session, request).await?;
                Ok(self.codec().encode(&response)?)
            },
            MESSAGE_ROUTE => {
                let message: UserMessage = self.codec().decode(&packet.data)?;
                self.message(session, message).await?;
                Ok(self.codec().encode(&Reply { code: 0, result: "ok".to_string() })?)
            },
            other => Err(RoomError::UnknownRoute(other.to_string())),
        }
    }

    /// Join `session` to the requested room.
    ///
    /// The room is claimed on the session before anything is awaited, so a
    /// second join racing this one fails with [`RoomError::AlreadyJoined`].
    pub async fn join(&self, session: &Arc<Connection>, request: JoinRequest) -> Result<JoinResponse, RoomError> {
        if session.is_closed() {
            return Err(SessionError::Push(PushError::Closed).into());
        }

        let room_id = request.room.unwrap_or(DEFAULT_ROOM_ID);
        if !session.set_if_absent(ROOM_KEY, room_id) {
            let current = session.value::<u32>(ROOM_KEY).map_or(room_id, |room| *room);
            return Err(RoomError::AlreadyJoined(current));
        }

        let outcome = self.enter(session, room_id, request.token).await;
        if outcome.is_err() {
            session.remove(ROOM_KEY);
        }
        outcome
    }

    /// Add `session`, which holds the claim on `room_id`, to that room.
    async fn enter(
        &self,
        session: &Arc<Connection>,
        room_id: u32,
        token: Option<String>,
    ) -> Result<JoinResponse, RoomError> {
        if let Some(identity) = self.authenticate(token).await? {
            session.set(IDENTITY_KEY, identity);
        }
        if session.uid().is_none() {
            session.bind(session.id())?;
        }

        let room = self.room(room_id).await?;
        let group = room.group();

        let members = AllMembers { members: group.members_short_uuid().await };
        if let Err(e) = session.push(ON_MEMBERS, self.codec().encode(&members)?).await {
            tracing::warn!(session_id = session.id(), error = %e, "failed to push member list");
        }

        let announcement = NewUser { content: format!("New user: {}", session.short_uuid()) };
        match group.broadcast(ON_NEW_USER, &announcement).await {
            Ok(()) | Err(GroupError::Push { .. }) => {},
            Err(e) => return Err(e.into()),
        }

        group.add(Arc::clone(session)).await?;

        // A close that ran its hooks before the add above missed this room
        if session.is_closed() {
            let _ = group.leave(session).await;
            return Err(SessionError::Push(PushError::Closed).into());
        }

        tracing::info!(room = room.id, session_id = session.id(), uuid = session.uuid(), "joined room");
        Ok(JoinResponse {
            code: 0,
            result: "success".to_string(),
            username: session.short_uuid().to_string(),
        })
    }

    /// Broadcast `message` to the sender's room and persist it.
    pub async fn message(&self, session: &Arc<Connection>, message: UserMessage) -> Result<(), RoomError> {
        let room_id = session.value::<u32>(ROOM_KEY).ok_or(RoomError::NotJoined)?;
        let room = self.rooms.read().await.get(&room_id).cloned().ok_or(RoomError::NotJoined)?;

        match room.group().broadcast(ON_MESSAGE, &message).await {
            Ok(()) | Err(GroupError::Push { .. }) => {},
            Err(e) => return Err(e.into()),
        }

        self.persist(&room, session, message);
        Ok(())
    }

    /// Remove `session` from its room. Used as the on-closed hook.
    pub async fn leave(&self, session: &Connection) {
        let Some(room_id) = session.value::<u32>(ROOM_KEY) else {
            return;
        };
        session.remove(ROOM_KEY);

        let room = self.rooms.read().await.get(&room_id).cloned();
        if let Some(room) = room {
            match room.group().leave(session).await {
                Ok(()) => tracing::info!(room = room.id, session_id = session.id(), "left room"),
                Err(e) => tracing::debug!(room = room.id, session_id = session.id(), error = %e, "leave skipped"),
            }
        }
    }

    /// Existing room `id`, created on first use.
    pub async fn room(&self, id: u32) -> Result<Arc<Room>, RoomError> {
        if let Some(room) = self.rooms.read().await.get(&id) {
            return Ok(Arc::clone(room));
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(&id) {
            return Ok(Arc::clone(room));
        }

        let name = format!("room-{id}");
        let group = if self.registry.contains(DriverKind::DocumentStore) {
            Group::with_existing_driver(name, DriverKind::DocumentStore, &self.registry)?.configured(self.config)
        } else {
            Group::with_config(name, self.config)
        };

        let room = Arc::new(Room { id, group });
        rooms.insert(id, Arc::clone(&room));
        tracing::info!(room = id, "room created");
        Ok(room)
    }

    /// Member count of every room, sorted by room number.
    pub async fn room_counts(&self) -> Vec<(u32, usize)> {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();

        let mut counts = Vec::with_capacity(rooms.len());
        for room in rooms {
            counts.push((room.id, room.group().count().await));
        }
        counts.sort_unstable();
        counts
    }

    /// Log member counts every `interval` until the task is aborted.
    pub fn spawn_reporter(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for (room, count) in manager.room_counts().await {
                    tracing::info!(room, count, "room members");
                }
            }
        })
    }

    /// Close every room.
    pub async fn shutdown(&self) {
        let rooms: Vec<Arc<Room>> = self.rooms.write().await.drain().map(|(_, room)| room).collect();
        for room in rooms {
            if let Err(e) = room.group().close().await {
                tracing::debug!(room = room.id, error = %e, "room already closed");
            }
        }
    }

    async fn authenticate(&self, token: Option<String>) -> Result<Option<String>, RoomError> {
        let Ok(driver) = self.registry.get(DriverKind::IdentityProvider) else {
            return Ok(None);
        };
        let Some(provider) = driver.identity_provider().cloned() else {
            return Ok(None);
        };
        let token = token.ok_or_else(|| RoomError::Unauthorized("token required".to_string()))?;

        let verified = tokio::task::spawn_blocking(move || provider.verify_id_token(&token, true))
            .await
            .map_err(|e| RoomError::Unauthorized(e.to_string()))?
            .map_err(|e| RoomError::Unauthorized(e.to_string()))?;

        Ok(Some(verified.uid))
    }

    fn persist(&self, room: &Room, session: &Connection, message: UserMessage) {
        let Some(store) = room.group().driver().and_then(|driver| driver.document_store()).cloned() else {
            return;
        };

        let mut document = Document::new();
        document.insert("room".to_string(), room.id.into());
        document.insert("session".to_string(), session.uuid().into());
        document.insert("uid".to_string(), session.uid().into());
        document.insert("name".to_string(), message.name.into());
        document.insert("content".to_string(), message.content.into());
        if let Some(identity) = session.value::<String>(IDENTITY_KEY) {
            document.insert("identity".to_string(), identity.as_str().into());
        }

        let room_id = room.id;
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.collection(MESSAGES_DATABASE, MESSAGES_COLLECTION).insert_one(document) {
                tracing::warn!(room = room_id, error = %e, "failed to persist message");
            }
        });
    }
}

impl std::fmt::Debug for RoomManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomManager")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
