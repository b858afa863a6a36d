//! Redb-backed document store.
//!
//! Documents are JSON-shaped maps grouped into named collections inside named
//! databases. Every document lives in one redb table keyed by
//! `database \0 collection \0 _id` and is stored CBOR-encoded, so a collection
//! is a contiguous key range.
//!
//! Writes are published on an in-process change stream. Subscribers see each
//! committed insert or update once; slow subscribers skip events rather than
//! block writers.

#![allow(clippy::disallowed_types, reason = "Synchronous handle bookkeeping only")]

use std::{
    collections::BTreeSet,
    path::PathBuf,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use redb::{Database, ReadableTable, TableDefinition};
use serde_json::Value;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};

use crate::{DEFAULT_CONNECT_TIMEOUT, Driver, DriverError, DriverKind, open_database};

/// Table: documents
/// Key: `database \0 collection \0 _id` as UTF-8 bytes
/// Value: CBOR-encoded document
const DOCUMENTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("documents");

/// Buffered change events per subscriber before it starts lagging.
const CHANGE_CAPACITY: usize = 1024;

/// Field holding a document's unique identifier.
pub const ID_FIELD: &str = "_id";

/// URI scheme accepted by [`DocumentStore::connect`].
pub const URI_SCHEME: &str = "redb://";

/// A stored document.
pub type Document = serde_json::Map<String, Value>;

/// Update operator applied by [`Collection::update_one`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    /// Overwrite or add the given fields.
    Set,
    /// Remove the given fields (values are ignored).
    Unset,
}

/// Outcome of [`Collection::insert_one`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertOneResult {
    /// `_id` of the stored document.
    pub inserted_id: String,
}

/// Outcome of [`Collection::update_one`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateResult {
    /// Documents that matched the filter (0 or 1).
    pub matched: u64,
    /// Documents whose content actually changed (0 or 1).
    pub modified: u64,
}

/// Kind of write reported on a change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOperation {
    /// A new document was inserted.
    Insert,
    /// An existing document was modified.
    Update,
}

/// A committed write, as seen by change stream subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// What happened.
    pub operation: ChangeOperation,
    /// Database the document belongs to.
    pub database: String,
    /// Collection the document belongs to.
    pub collection: String,
    /// Document state after the write.
    pub document: Document,
}

/// Durable document store.
///
/// Thread-safe through redb's internal locking. After [`Driver::close`] the
/// database file is released once in-flight operations finish, change streams
/// end, and every call fails with [`DriverError::Closed`].
pub struct DocumentStore {
    path: PathBuf,
    db: Mutex<Option<Arc<Database>>>,
    changes: Mutex<Option<broadcast::Sender<ChangeEvent>>>,
    closed: AtomicBool,
}

impl DocumentStore {
    /// Connect using [`DEFAULT_CONNECT_TIMEOUT`].
    pub async fn connect(uri: &str) -> Result<Self, DriverError> {
        Self::connect_with_timeout(uri, DEFAULT_CONNECT_TIMEOUT).await
    }

    /// Open or create the store at `uri` (`redb://<path>` or a bare path).
    pub async fn connect_with_timeout(uri: &str, timeout: Duration) -> Result<Self, DriverError> {
        let path = parse_uri(uri)?;
        let db = open_database(path.clone(), timeout).await?;

        let (tx, _) = broadcast::channel(CHANGE_CAPACITY);
        let store = Self {
            path,
            db: Mutex::new(Some(Arc::new(db))),
            changes: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        };
        store.init()?;

        tracing::info!(path = %store.path.display(), "document store connected");
        Ok(store)
    }

    /// Filesystem path of the backing database.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Handle to a collection. Collections exist implicitly.
    pub fn collection(&self, database: &str, name: &str) -> Collection<'_> {
        Collection { store: self, database: database.to_string(), name: name.to_string() }
    }

    /// Names of every database holding at least one document.
    pub fn list_databases(&self) -> Result<Vec<String>, DriverError> {
        let db = self.database()?;
        let txn = db.begin_read().map_err(|e| DriverError::Io(e.to_string()))?;
        let table = txn.open_table(DOCUMENTS).map_err(|e| DriverError::Io(e.to_string()))?;

        let mut names = BTreeSet::new();
        for result in table.iter().map_err(|e| DriverError::Io(e.to_string()))? {
            let (key, _) = result.map_err(|e| DriverError::Io(e.to_string()))?;
            let key = key.value();
            let end = key.iter().position(|b| *b == 0).unwrap_or(key.len());
            names.insert(String::from_utf8_lossy(&key[..end]).into_owned());
        }

        Ok(names.into_iter().collect())
    }

    fn database(&self) -> Result<Arc<Database>, DriverError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::Closed);
        }
        self.db.lock().unwrap_or_else(PoisonError::into_inner).clone().ok_or(DriverError::Closed)
    }

    fn subscribe(&self) -> Result<broadcast::Receiver<ChangeEvent>, DriverError> {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .ok_or(DriverError::Closed)
    }

    fn publish(&self, event: ChangeEvent) {
        if let Some(tx) = self.changes.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            // No subscribers is not an error.
            let _ = tx.send(event);
        }
    }
}

impl Driver for DocumentStore {
    fn kind(&self) -> DriverKind {
        DriverKind::DocumentStore
    }

    fn init(&self) -> Result<(), DriverError> {
        let db = self.database()?;
        let txn = db.begin_write().map_err(|e| DriverError::Io(e.to_string()))?;
        {
            let _ = txn.open_table(DOCUMENTS).map_err(|e| DriverError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| DriverError::Io(e.to_string()))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.db.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.changes.lock().unwrap_or_else(PoisonError::into_inner).take();
        tracing::info!(path = %self.path.display(), "document store closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// A named collection inside one database of a [`DocumentStore`].
#[derive(Debug, Clone)]
pub struct Collection<'a> {
    store: &'a DocumentStore,
    database: String,
    name: String,
}

impl Collection<'_> {
    /// Database this collection belongs to.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert a document.
    ///
    /// A string `_id` in the document is kept; otherwise a UUID is assigned.
    /// Inserting an `_id` that already exists fails with
    /// [`DriverError::AlreadyExists`] and leaves the stored document alone.
    pub fn insert_one(&self, mut document: Document) -> Result<InsertOneResult, DriverError> {
        let id = match document.get(ID_FIELD) {
            Some(Value::String(id)) => id.clone(),
            _ => {
                let id = uuid::Uuid::new_v4().to_string();
                document.insert(ID_FIELD.to_string(), Value::String(id.clone()));
                id
            },
        };

        let key = self.document_key(&id)?;
        let bytes = encode_document(&document)?;

        let db = self.store.database()?;
        let txn = db.begin_write().map_err(|e| DriverError::Io(e.to_string()))?;
        {
            let mut table = txn.open_table(DOCUMENTS).map_err(|e| DriverError::Io(e.to_string()))?;

            if table.get(key.as_slice()).map_err(|e| DriverError::Io(e.to_string()))?.is_some() {
                return Err(DriverError::AlreadyExists(format!(
                    "{}.{} {ID_FIELD}={id}",
                    self.database, self.name
                )));
            }

            table
                .insert(key.as_slice(), bytes.as_slice())
                .map_err(|e| DriverError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| DriverError::Io(e.to_string()))?;

        self.store.publish(ChangeEvent {
            operation: ChangeOperation::Insert,
            database: self.database.clone(),
            collection: self.name.clone(),
            document,
        });

        Ok(InsertOneResult { inserted_id: id })
    }

    /// Apply `op` with `data` to the first document matching `filter`.
    ///
    /// The filter matches documents whose fields equal every filter entry;
    /// an empty filter matches any document. `_id` cannot be unset or changed.
    pub fn update_one(
        &self,
        filter: &Document,
        op: UpdateOp,
        data: &Document,
    ) -> Result<UpdateResult, DriverError> {
        let (start, end) = self.key_range()?;

        let db = self.store.database()?;
        let txn = db.begin_write().map_err(|e| DriverError::Io(e.to_string()))?;
        let updated = {
            let mut table = txn.open_table(DOCUMENTS).map_err(|e| DriverError::Io(e.to_string()))?;

            let mut found = None;
            for result in table
                .range(start.as_slice()..end.as_slice())
                .map_err(|e| DriverError::Io(e.to_string()))?
            {
                let (key, value) = result.map_err(|e| DriverError::Io(e.to_string()))?;
                let document = decode_document(value.value())?;
                if matches_filter(filter, &document) {
                    found = Some((key.value().to_vec(), document));
                    break;
                }
            }

            let Some((key, mut document)) = found else {
                return Ok(UpdateResult::default());
            };

            if !apply_update(&mut document, op, data) {
                return Ok(UpdateResult { matched: 1, modified: 0 });
            }

            let bytes = encode_document(&document)?;
            table
                .insert(key.as_slice(), bytes.as_slice())
                .map_err(|e| DriverError::Io(e.to_string()))?;
            document
        };
        txn.commit().map_err(|e| DriverError::Io(e.to_string()))?;

        self.store.publish(ChangeEvent {
            operation: ChangeOperation::Update,
            database: self.database.clone(),
            collection: self.name.clone(),
            document: updated,
        });

        Ok(UpdateResult { matched: 1, modified: 1 })
    }

    /// First document matching `filter`, if any.
    pub fn find_one(&self, filter: &Document) -> Result<Option<Document>, DriverError> {
        Ok(self.scan(filter, Some(1))?.into_iter().next())
    }

    /// Every document matching `filter`, ordered by `_id`.
    pub fn find(&self, filter: &Document) -> Result<Vec<Document>, DriverError> {
        self.scan(filter, None)
    }

    /// Subscribe to committed writes on this collection.
    pub fn watch(&self) -> Result<ChangeStream, DriverError> {
        Ok(ChangeStream {
            receiver: self.store.subscribe()?,
            database: self.database.clone(),
            collection: self.name.clone(),
        })
    }

    /// Run `callback` for every committed write on this collection.
    ///
    /// The callback runs on a spawned task until the store is closed or the
    /// returned handle is aborted. Requires a Tokio runtime.
    pub fn watch_with<F>(&self, mut callback: F) -> Result<JoinHandle<()>, DriverError>
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        let mut stream = self.watch()?;
        Ok(tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                callback(event);
            }
        }))
    }

    fn scan(&self, filter: &Document, limit: Option<usize>) -> Result<Vec<Document>, DriverError> {
        let (start, end) = self.key_range()?;

        let db = self.store.database()?;
        let txn = db.begin_read().map_err(|e| DriverError::Io(e.to_string()))?;
        let table = txn.open_table(DOCUMENTS).map_err(|e| DriverError::Io(e.to_string()))?;

        let mut documents = Vec::new();
        for result in table
            .range(start.as_slice()..end.as_slice())
            .map_err(|e| DriverError::Io(e.to_string()))?
        {
            if limit.is_some_and(|limit| documents.len() >= limit) {
                break;
            }

            let (_, value) = result.map_err(|e| DriverError::Io(e.to_string()))?;
            let document = decode_document(value.value())?;
            if matches_filter(filter, &document) {
                documents.push(document);
            }
        }

        Ok(documents)
    }

    /// `[database \0 collection \0, database \0 collection \x01)`
    fn key_range(&self) -> Result<(Vec<u8>, Vec<u8>), DriverError> {
        let start = self.prefix()?;
        let mut end = start.clone();
        end.pop();
        end.push(1);
        Ok((start, end))
    }

    fn prefix(&self) -> Result<Vec<u8>, DriverError> {
        validate_name(&self.database)?;
        validate_name(&self.name)?;

        let mut key = Vec::with_capacity(self.database.len() + self.name.len() + 2);
        key.extend_from_slice(self.database.as_bytes());
        key.push(0);
        key.extend_from_slice(self.name.as_bytes());
        key.push(0);
        Ok(key)
    }

    fn document_key(&self, id: &str) -> Result<Vec<u8>, DriverError> {
        let mut key = self.prefix()?;
        key.extend_from_slice(id.as_bytes());
        Ok(key)
    }
}

/// Committed writes on one collection.
pub struct ChangeStream {
    receiver: broadcast::Receiver<ChangeEvent>,
    database: String,
    collection: String,
}

impl ChangeStream {
    /// Next change on the watched collection. `None` once the store closes.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.database == self.database && event.collection == self.collection => {
                    return Some(event);
                },
                Ok(_) => {},
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        database = %self.database,
                        collection = %self.collection,
                        skipped,
                        "change stream lagged"
                    );
                },
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl std::fmt::Debug for ChangeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStream")
            .field("database", &self.database)
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

fn parse_uri(uri: &str) -> Result<PathBuf, DriverError> {
    let path = uri.strip_prefix(URI_SCHEME).unwrap_or(uri);
    if path.is_empty() {
        return Err(DriverError::Connect(format!("no database path in uri {uri:?}")));
    }
    Ok(PathBuf::from(path))
}

fn validate_name(name: &str) -> Result<(), DriverError> {
    if name.is_empty() || name.contains('\0') {
        return Err(DriverError::Serialization(format!("invalid database or collection name {name:?}")));
    }
    Ok(())
}

fn matches_filter(filter: &Document, document: &Document) -> bool {
    filter.iter().all(|(field, expected)| document.get(field) == Some(expected))
}

/// Returns whether the document changed.
fn apply_update(document: &mut Document, op: UpdateOp, data: &Document) -> bool {
    let mut changed = false;
    for (field, value) in data {
        if field == ID_FIELD {
            continue;
        }
        match op {
            UpdateOp::Set => {
                if document.get(field) != Some(value) {
                    document.insert(field.clone(), value.clone());
                    changed = true;
                }
            },
            UpdateOp::Unset => changed |= document.remove(field).is_some(),
        }
    }
    changed
}

fn encode_document(document: &Document) -> Result<Vec<u8>, DriverError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(document, &mut bytes)
        .map_err(|e| DriverError::Serialization(e.to_string()))?;
    Ok(bytes)
}

fn decode_document(bytes: &[u8]) -> Result<Document, DriverError> {
    ciborium::from_reader(bytes).map_err(|e| DriverError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn parse_uri_accepts_scheme_and_bare_paths() {
        assert_eq!(parse_uri("redb:///tmp/a.redb").unwrap(), PathBuf::from("/tmp/a.redb"));
        assert_eq!(parse_uri("data/a.redb").unwrap(), PathBuf::from("data/a.redb"));
        assert!(parse_uri("redb://").is_err());
    }

    #[test]
    fn filter_matches_all_fields() {
        let document = doc(json!({ "room": 1, "name": "ada" }));
        assert!(matches_filter(&Document::new(), &document));
        assert!(matches_filter(&doc(json!({ "room": 1 })), &document));
        assert!(!matches_filter(&doc(json!({ "room": 1, "name": "bob" })), &document));
        assert!(!matches_filter(&doc(json!({ "missing": null })), &document));
    }

    #[test]
    fn apply_update_reports_changes() {
        let mut document = doc(json!({ "_id": "a", "count": 1 }));

        assert!(!apply_update(&mut document, UpdateOp::Set, &doc(json!({ "count": 1 }))));
        assert!(apply_update(&mut document, UpdateOp::Set, &doc(json!({ "count": 2 }))));
        assert_eq!(document["count"], json!(2));

        assert!(!apply_update(&mut document, UpdateOp::Set, &doc(json!({ "_id": "b" }))));
        assert_eq!(document["_id"], json!("a"));

        assert!(apply_update(&mut document, UpdateOp::Unset, &doc(json!({ "count": null }))));
        assert!(!document.contains_key("count"));
        assert!(!apply_update(&mut document, UpdateOp::Unset, &doc(json!({ "count": null }))));
    }

    #[test]
    fn document_encoding_preserves_values() {
        let document = doc(json!({ "_id": "x", "n": -3, "f": 1.5, "tags": ["a", "b"], "nested": { "ok": true } }));
        let bytes = encode_document(&document).unwrap();
        assert_eq!(decode_document(&bytes).unwrap(), document);
    }
}
