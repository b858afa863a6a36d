//! Connection lifetime hooks.
//!
//! Application components register async callbacks that run once for every
//! connection that closes, typically to remove the session from whatever
//! groups it joined.

#![allow(clippy::disallowed_types, reason = "Hook list is only cloned under the lock")]

use std::{
    future::Future,
    sync::{Arc, PoisonError, RwLock},
};

use futures::future::BoxFuture;

use crate::session::Connection;

type Hook = Arc<dyn Fn(Arc<Connection>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Registry of on-closed hooks.
#[derive(Default)]
pub struct Lifetime {
    on_closed: RwLock<Vec<Hook>>,
}

impl Lifetime {
    /// Create an empty hook registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `hook` for every connection that closes from now on.
    pub fn on_closed<F, Fut>(&self, hook: F)
    where
        F: Fn(Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: Hook = Arc::new(move |connection| Box::pin(hook(connection)));
        self.on_closed.write().unwrap_or_else(PoisonError::into_inner).push(hook);
    }

    /// Close `connection` and run the hooks, in registration order.
    ///
    /// Hooks run only for the call that actually closed the connection.
    pub async fn closed(&self, connection: Arc<Connection>) {
        if !connection.close() {
            return;
        }

        let hooks = self.on_closed.read().unwrap_or_else(PoisonError::into_inner).clone();
        for hook in hooks {
            hook(Arc::clone(&connection)).await;
        }
    }

    /// Number of registered hooks.
    pub fn len(&self) -> usize {
        self.on_closed.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no hooks are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Lifetime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifetime").field("on_closed", &self.len()).finish()
    }
}
