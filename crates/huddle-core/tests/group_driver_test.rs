//! Driver attachment tests for Group

mod common;

use std::sync::Arc;

use common::MockSession;
use huddle_core::{DriverKind, DriverRef, DriverRegistry, Group, GroupError};
use huddle_drivers::{Driver, DriverError, DocumentStore, document::Document};
use serde_json::json;

async fn shared_store(dir: &tempfile::TempDir) -> DriverRef {
    let path = dir.path().join("shared.redb");
    let store = DocumentStore::connect(path.to_str().unwrap()).await.unwrap();
    DriverRef::from(Arc::new(store))
}

#[tokio::test]
async fn existing_driver_requires_registry_entry() {
    let registry = DriverRegistry::new();

    let err = Group::<MockSession>::with_existing_driver("room", DriverKind::DocumentStore, &registry).unwrap_err();

    assert_eq!(err, GroupError::DriverNotInitialized(DriverKind::DocumentStore));
}

#[tokio::test]
async fn existing_driver_is_shared_and_survives_close() {
    let dir = tempfile::tempdir().unwrap();
    let registry = DriverRegistry::new();
    let driver = shared_store(&dir).await;
    registry.install(driver.clone());

    let first = Group::<MockSession>::with_existing_driver("a", DriverKind::DocumentStore, &registry).unwrap();
    let second = Group::<MockSession>::with_existing_driver("b", DriverKind::DocumentStore, &registry).unwrap();
    assert!(first.driver().unwrap().ptr_eq(&driver));
    assert!(second.driver().unwrap().ptr_eq(&driver));

    first.close().await.unwrap();

    assert!(!driver.as_driver().is_closed());
    let store = second.driver().and_then(DriverRef::document_store).unwrap();
    let mut doc = Document::new();
    doc.insert("content".to_string(), json!("still open"));
    store.collection("huddle", "messages").insert_one(doc).unwrap();
}

#[tokio::test]
async fn new_driver_is_owned_and_closed_with_group() {
    let dir = tempfile::tempdir().unwrap();
    let uri = format!("redb://{}", dir.path().join("owned.redb").display());

    let group = Group::with_new_driver("owned", DriverKind::DocumentStore, &uri).await.unwrap();
    group.add(MockSession::new(1)).await.unwrap();
    let driver = group.driver().cloned().unwrap();
    assert_eq!(driver.kind(), DriverKind::DocumentStore);

    group.close().await.unwrap();

    assert!(driver.as_driver().is_closed());
    let store = driver.document_store().unwrap();
    assert_eq!(store.list_databases().unwrap_err(), DriverError::Closed);
}

#[tokio::test]
async fn new_driver_connection_error_is_propagated() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing-credentials.toml");

    let err = Group::<MockSession>::with_new_driver("id", DriverKind::IdentityProvider, missing.to_str().unwrap())
        .await
        .unwrap_err();

    assert!(matches!(err, GroupError::Driver(DriverError::InvalidCredentials(_))));
}

#[tokio::test]
async fn closed_registry_driver_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let registry = DriverRegistry::new();
    let driver = shared_store(&dir).await;
    registry.install(driver.clone());
    driver.as_driver().close();

    let err = Group::<MockSession>::with_existing_driver("late", DriverKind::DocumentStore, &registry).unwrap_err();

    assert_eq!(err, GroupError::Driver(DriverError::Closed));
}

#[tokio::test]
async fn driver_can_be_attached_after_construction() {
    let dir = tempfile::tempdir().unwrap();
    let driver = shared_store(&dir).await;

    let group = Group::<MockSession>::new("late");
    group.add(MockSession::new(1)).await.unwrap();
    group.attach_driver(driver.clone()).await.unwrap();
    assert!(group.driver().unwrap().ptr_eq(&driver));

    let err = group.attach_driver(driver.clone()).await.unwrap_err();
    assert_eq!(err, GroupError::DriverAlreadyAttached(DriverKind::DocumentStore));

    group.close().await.unwrap();
    assert!(!driver.as_driver().is_closed());
}

#[tokio::test]
async fn attaching_to_a_closed_group_fails() {
    let dir = tempfile::tempdir().unwrap();
    let driver = shared_store(&dir).await;
    let group = Group::<MockSession>::new("closed");
    group.close().await.unwrap();

    assert_eq!(group.attach_driver(driver).await.unwrap_err(), GroupError::ClosedGroup);

    let uri = format!("redb://{}", dir.path().join("never.redb").display());
    assert_eq!(group.init_driver(DriverKind::DocumentStore, &uri).await.unwrap_err(), GroupError::ClosedGroup);
    assert!(group.driver().is_none());
    assert!(!dir.path().join("never.redb").exists());
}

#[tokio::test]
async fn init_driver_connects_and_owns_the_driver() {
    let dir = tempfile::tempdir().unwrap();
    let uri = format!("redb://{}", dir.path().join("init.redb").display());

    let group = Group::<MockSession>::new("init");
    group.init_driver(DriverKind::DocumentStore, &uri).await.unwrap();
    let driver = group.driver().cloned().unwrap();
    assert_eq!(driver.kind(), DriverKind::DocumentStore);

    let second = format!("redb://{}", dir.path().join("second.redb").display());
    let err = group.init_driver(DriverKind::DocumentStore, &second).await.unwrap_err();
    assert_eq!(err, GroupError::DriverAlreadyAttached(DriverKind::DocumentStore));

    group.close().await.unwrap();
    assert!(driver.as_driver().is_closed());
}

#[tokio::test]
async fn init_driver_connection_error_leaves_group_without_driver() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing-credentials.toml");
    let group = Group::<MockSession>::new("id");

    let err = group.init_driver(DriverKind::IdentityProvider, missing.to_str().unwrap()).await.unwrap_err();

    assert!(matches!(err, GroupError::Driver(DriverError::InvalidCredentials(_))));
    assert!(group.driver().is_none());
    assert!(!group.is_closed());
}

#[test]
fn unknown_kind_fails_before_any_group_exists() {
    let err = "postgres".parse::<DriverKind>().unwrap_err();
    assert_eq!(err, DriverError::UnsupportedKind("postgres".to_string()));
}
