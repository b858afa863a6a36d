//! Registry of already-connected drivers.
//!
//! The application connects drivers at startup, installs them here and hands
//! the registry to whatever builds groups. Groups created from the registry
//! share its drivers; only [`DriverRegistry::shutdown`] closes them.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use crate::{DriverError, DriverKind, DriverRef};

/// Lookup of connected drivers by kind, at most one per kind.
///
/// Thread-safe via Arc<RwLock<_>>. Clone shares the same underlying map.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: Arc<RwLock<HashMap<DriverKind, DriverRef>>>,
}

impl DriverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `driver` for its kind.
    ///
    /// Returns the driver previously installed for that kind. The replaced
    /// driver is not closed; the caller owns it again.
    pub fn install(&self, driver: DriverRef) -> Option<DriverRef> {
        let kind = driver.kind();
        tracing::info!(%kind, "driver installed");
        self.drivers.write().unwrap_or_else(PoisonError::into_inner).insert(kind, driver)
    }

    /// Driver installed for `kind`.
    pub fn get(&self, kind: DriverKind) -> Result<DriverRef, DriverError> {
        self.drivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .ok_or(DriverError::NotInitialized(kind))
    }

    /// Whether a driver is installed for `kind`.
    pub fn contains(&self, kind: DriverKind) -> bool {
        self.drivers.read().unwrap_or_else(PoisonError::into_inner).contains_key(&kind)
    }

    /// Remove and return the driver for `kind` without closing it.
    pub fn remove(&self, kind: DriverKind) -> Option<DriverRef> {
        self.drivers.write().unwrap_or_else(PoisonError::into_inner).remove(&kind)
    }

    /// Close and remove every installed driver.
    pub fn shutdown(&self) {
        let drivers: Vec<DriverRef> = self
            .drivers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, driver)| driver)
            .collect();

        for driver in drivers {
            tracing::info!(kind = %driver.kind(), "closing driver");
            driver.as_driver().close();
        }
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let drivers = self.drivers.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("DriverRegistry").field("kinds", &drivers.keys().collect::<Vec<_>>()).finish()
    }
}
