//! Fixtures shared by the workspace's tests.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use db::{Document, DocumentStore, Filter, Patch, StoreError, UniqueIndex, UpdateResult};
use serde_json::Value;
use tempfile::TempDir;

/// Builds a document from a `json!` object literal.
pub fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// A temporary directory and a config path inside it. Keep the `TempDir` alive
/// for as long as the path is used.
pub fn temp_config_path(file_name: &str) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join(file_name);
    (dir, path)
}

/// Wraps a store and starts failing every write once `writes_allowed` writes
/// have gone through, imitating a process that dies mid-run. Reads keep working.
pub struct FlakyStore {
    inner: Arc<dyn DocumentStore>,
    writes_allowed: usize,
    writes: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn DocumentStore>, writes_allowed: usize) -> Self {
        Self {
            inner,
            writes_allowed,
            writes: AtomicUsize::new(0),
        }
    }

    pub fn writes_attempted(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn admit_write(&self) -> Result<(), StoreError> {
        let attempt = self.writes.fetch_add(1, Ordering::SeqCst);
        if attempt >= self.writes_allowed {
            return Err(StoreError::Unavailable(format!(
                "connection lost after {} writes",
                self.writes_allowed
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        self.inner.find(collection, filter).await
    }

    async fn insert_one(&self, collection: &str, document: Document) -> Result<(), StoreError> {
        self.admit_write()?;
        self.inner.insert_one(collection, document).await
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        patch: &Patch,
    ) -> Result<UpdateResult, StoreError> {
        self.admit_write()?;
        self.inner.update_one(collection, filter, patch).await
    }

    async fn find_and_modify(
        &self,
        collection: &str,
        filter: &Filter,
        patch: &Patch,
        return_new: bool,
    ) -> Result<Option<Document>, StoreError> {
        self.admit_write()?;
        self.inner
            .find_and_modify(collection, filter, patch, return_new)
            .await
    }

    async fn ensure_unique_index(
        &self,
        collection: &str,
        index: UniqueIndex,
    ) -> Result<(), StoreError> {
        self.inner.ensure_unique_index(collection, index).await
    }
}
