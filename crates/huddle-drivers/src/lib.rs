//! Pluggable backends for huddle session groups.
//!
//! A group may carry at most one driver: a document store for persistence or
//! an identity provider for user records and tokens. Drivers live outside the
//! broadcast path; groups only hold a reference so application code can reach
//! the backend through the group it is working with.
//!
//! # Components
//!
//! - [`Driver`]: the uniform init/close contract every backend satisfies
//! - [`DriverKind`]: closed discriminator for the supported backends
//! - [`DriverRef`]: shared handle to one concrete driver
//! - [`DriverRegistry`]: application-owned lookup of already-connected drivers
//! - [`DocumentStore`]: redb-backed collections with change streams
//! - [`IdentityProvider`]: redb-backed users with signed tokens

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod document;
mod error;
pub mod identity;
mod registry;

use std::{fmt, path::PathBuf, str::FromStr, sync::Arc, time::Duration};

pub use document::DocumentStore;
pub use error::DriverError;
pub use identity::IdentityProvider;
use redb::Database;
pub use registry::DriverRegistry;

/// Upper bound on opening a backend before the connect attempt fails.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Uniform lifecycle contract for backends attachable to a group.
///
/// Both methods are idempotent. `init` runs once during construction and may
/// be called again safely; `close` releases the backend and every later
/// operation on the driver fails with [`DriverError::Closed`].
pub trait Driver: Send + Sync + 'static {
    /// Which backend this is.
    fn kind(&self) -> DriverKind;

    /// Prepare backend state (tables, indexes).
    fn init(&self) -> Result<(), DriverError>;

    /// Tear the backend down.
    fn close(&self);

    /// Whether `close` has been called.
    fn is_closed(&self) -> bool;
}

/// Supported driver kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    /// Collection-scoped document persistence.
    DocumentStore,
    /// User records and token issuance/verification.
    IdentityProvider,
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DocumentStore => f.write_str("document-store"),
            Self::IdentityProvider => f.write_str("identity-provider"),
        }
    }
}

impl FromStr for DriverKind {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "document" | "document-store" | "mongo" => Ok(Self::DocumentStore),
            "identity" | "identity-provider" | "firebase" => Ok(Self::IdentityProvider),
            _ => Err(DriverError::UnsupportedKind(s.to_string())),
        }
    }
}

/// Shared handle to a connected driver.
///
/// Clones point at the same backend. Whoever connected the driver decides
/// when it is closed; holders of a clone never close it on their own.
#[derive(Clone)]
pub enum DriverRef {
    /// Document store handle.
    DocumentStore(Arc<DocumentStore>),
    /// Identity provider handle.
    IdentityProvider(Arc<IdentityProvider>),
}

impl DriverRef {
    /// Connect a new driver of `kind`.
    ///
    /// The connection string is a document store URI (`redb://<path>` or a
    /// bare path) or the path of an identity provider credentials file.
    /// Connection errors are returned unchanged.
    pub async fn connect(kind: DriverKind, connection_string: &str) -> Result<Self, DriverError> {
        match kind {
            DriverKind::DocumentStore => {
                Ok(Self::DocumentStore(Arc::new(DocumentStore::connect(connection_string).await?)))
            },
            DriverKind::IdentityProvider => Ok(Self::IdentityProvider(Arc::new(
                IdentityProvider::connect(connection_string).await?,
            ))),
        }
    }

    /// Kind of the referenced driver.
    pub fn kind(&self) -> DriverKind {
        self.as_driver().kind()
    }

    /// The driver behind this handle as a trait object.
    pub fn as_driver(&self) -> &dyn Driver {
        match self {
            Self::DocumentStore(store) => store.as_ref(),
            Self::IdentityProvider(provider) => provider.as_ref(),
        }
    }

    /// Document store, if this handle refers to one.
    pub fn document_store(&self) -> Option<&Arc<DocumentStore>> {
        match self {
            Self::DocumentStore(store) => Some(store),
            Self::IdentityProvider(_) => None,
        }
    }

    /// Identity provider, if this handle refers to one.
    pub fn identity_provider(&self) -> Option<&Arc<IdentityProvider>> {
        match self {
            Self::IdentityProvider(provider) => Some(provider),
            Self::DocumentStore(_) => None,
        }
    }

    /// Whether both handles point at the same driver instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::DocumentStore(a), Self::DocumentStore(b)) => Arc::ptr_eq(a, b),
            (Self::IdentityProvider(a), Self::IdentityProvider(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for DriverRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRef")
            .field("kind", &self.kind())
            .field("closed", &self.as_driver().is_closed())
            .finish()
    }
}

impl From<Arc<DocumentStore>> for DriverRef {
    fn from(store: Arc<DocumentStore>) -> Self {
        Self::DocumentStore(store)
    }
}

impl From<Arc<IdentityProvider>> for DriverRef {
    fn from(provider: Arc<IdentityProvider>) -> Self {
        Self::IdentityProvider(provider)
    }
}

/// Open or create a redb database on a blocking thread, bounded by `timeout`.
async fn open_database(path: PathBuf, timeout: Duration) -> Result<Database, DriverError> {
    let open = tokio::task::spawn_blocking(move || Database::create(path));

    match tokio::time::timeout(timeout, open).await {
        Err(_) => Err(DriverError::Timeout(timeout)),
        Ok(Err(join)) => Err(DriverError::Connect(join.to_string())),
        Ok(Ok(result)) => result.map_err(|e| DriverError::Connect(e.to_string())),
    }
}

/// Milliseconds since the Unix epoch.
#[allow(clippy::disallowed_methods)]
fn unix_now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_kind_parses_known_names() {
        assert_eq!("mongo".parse::<DriverKind>(), Ok(DriverKind::DocumentStore));
        assert_eq!("Document".parse::<DriverKind>(), Ok(DriverKind::DocumentStore));
        assert_eq!("firebase".parse::<DriverKind>(), Ok(DriverKind::IdentityProvider));
        assert_eq!("identity-provider".parse::<DriverKind>(), Ok(DriverKind::IdentityProvider));
    }

    #[test]
    fn driver_kind_rejects_unknown_names() {
        assert_eq!(
            "postgres".parse::<DriverKind>(),
            Err(DriverError::UnsupportedKind("postgres".to_string()))
        );
        assert!("".parse::<DriverKind>().is_err());
    }

    #[test]
    fn driver_kind_display_round_trips() {
        for kind in [DriverKind::DocumentStore, DriverKind::IdentityProvider] {
            assert_eq!(kind.to_string().parse::<DriverKind>(), Ok(kind));
        }
    }

    #[tokio::test]
    async fn connect_propagates_open_failure() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened as a database file.
        let result = DriverRef::connect(DriverKind::DocumentStore, dir.path().to_str().unwrap()).await;
        assert!(matches!(result, Err(DriverError::Connect(_))));
    }
}
