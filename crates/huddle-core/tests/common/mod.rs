//! Shared test session for group integration tests.

#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use huddle_core::{PushError, Session, SessionId, Uid};

/// How a [`MockSession`] answers pushes.
#[derive(Debug, Clone, Default)]
pub enum Behavior {
    /// Accept every push.
    #[default]
    Accept,
    /// Reject every push with this error.
    Fail(PushError),
    /// Sleep before accepting.
    Slow(Duration),
}

/// In-memory session recording every push it accepts.
#[derive(Debug)]
pub struct MockSession {
    id: SessionId,
    uid: Option<Uid>,
    uuid: String,
    behavior: Behavior,
    received: Mutex<Vec<(String, Bytes)>>,
}

impl MockSession {
    pub fn new(id: SessionId) -> Arc<Self> {
        Self::build(id, Some(id + 1000), Behavior::Accept)
    }

    pub fn unbound(id: SessionId) -> Arc<Self> {
        Self::build(id, None, Behavior::Accept)
    }

    pub fn with_behavior(id: SessionId, behavior: Behavior) -> Arc<Self> {
        Self::build(id, Some(id + 1000), behavior)
    }

    fn build(id: SessionId, uid: Option<Uid>, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            id,
            uid,
            uuid: format!("{id:016x}-{:016x}", id.wrapping_mul(0x9e37_79b9_7f4a_7c15)),
            behavior,
            received: Mutex::new(Vec::new()),
        })
    }

    pub fn received(&self) -> Vec<(String, Bytes)> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

impl Session for MockSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn uid(&self) -> Option<Uid> {
        self.uid
    }

    fn uuid(&self) -> &str {
        &self.uuid
    }

    async fn push(&self, route: &str, data: Bytes) -> Result<(), PushError> {
        match &self.behavior {
            Behavior::Accept => {},
            Behavior::Fail(error) => return Err(error.clone()),
            Behavior::Slow(delay) => tokio::time::sleep(*delay).await,
        }
        self.received.lock().unwrap().push((route.to_string(), data));
        Ok(())
    }
}
