//! Document-store adapter.
//!
//! Collections hold JSON objects keyed by a string `_id`. Every operation is
//! atomic at single-document granularity only; there are no multi-document
//! transactions at this layer.

use async_trait::async_trait;
use sea_orm::DbErr;
use serde_json::{Map, Value};
use thiserror::Error;

pub mod memory;
pub mod sql;

pub use memory::MemoryDocumentStore;
pub use sql::SqlDocumentStore;

pub type Document = Map<String, Value>;

pub const ID_FIELD: &str = "_id";
/// Name reported when the implicit primary key index rejects a write.
pub const PRIMARY_INDEX: &str = "_id_";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] DbErr),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("duplicate key in '{collection}' for unique index '{index}'")]
    DuplicateKey { collection: String, index: String },
    #[error("document in '{collection}' has no string _id")]
    MissingId { collection: String },
    #[error("the _id of a document in '{collection}' cannot be modified")]
    ImmutableId { collection: String },
    #[error("stored document '{doc_id}' in '{collection}' is not a JSON object")]
    CorruptDocument { collection: String, doc_id: String },
    #[error("document store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, StoreError::DuplicateKey { .. })
    }
}

pub fn document_id(document: &Document) -> Option<&str> {
    document.get(ID_FIELD).and_then(Value::as_str)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Matches when the field equals the value. `Null` also matches a missing field.
    Eq(String, Value),
    /// Matches on presence (`true`) or absence (`false`) of the field.
    Exists(String, bool),
}

impl Condition {
    fn matches(&self, document: &Document) -> bool {
        match self {
            Condition::Eq(field, Value::Null) => {
                document.get(field).is_none_or(Value::is_null)
            }
            Condition::Eq(field, value) => document.get(field) == Some(value),
            Condition::Exists(field, expected) => document.contains_key(field) == *expected,
        }
    }
}

/// Conjunction of conditions. An empty filter matches every document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self::new().eq(ID_FIELD, Value::String(id.into()))
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions
            .push(Condition::Eq(field.into(), value.into()));
        self
    }

    pub fn exists(mut self, field: impl Into<String>, exists: bool) -> Self {
        self.conditions.push(Condition::Exists(field.into(), exists));
        self
    }

    pub fn matches(&self, document: &Document) -> bool {
        self.conditions.iter().all(|condition| condition.matches(document))
    }

    /// The `_id` this filter pins, letting backends skip a collection scan.
    pub fn pinned_id(&self) -> Option<&str> {
        self.conditions.iter().find_map(|condition| match condition {
            Condition::Eq(field, Value::String(id)) if field == ID_FIELD => Some(id.as_str()),
            _ => None,
        })
    }
}

/// `$set` / `$unset` by field path. A dotted path (`a.b`) addresses a field of
/// an embedded object; missing or non-object parents are replaced by objects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    set: Document,
    unset: Vec<String>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.insert(field.into(), value.into());
        self
    }

    pub fn unset(mut self, field: impl Into<String>) -> Self {
        self.unset.push(field.into());
        self
    }

    pub fn touches_id(&self) -> bool {
        let is_id = |path: &String| path.split('.').next() == Some(ID_FIELD);
        self.set.keys().any(is_id) || self.unset.iter().any(is_id)
    }

    /// Applies the patch in place and reports whether the document changed.
    pub fn apply(&self, document: &mut Document) -> bool {
        let mut changed = false;
        for (path, value) in &self.set {
            changed |= set_path(document, path, value);
        }
        for path in &self.unset {
            changed |= unset_path(document, path);
        }
        changed
    }
}

fn set_path(document: &mut Document, path: &str, value: &Value) -> bool {
    match path.split_once('.') {
        None => {
            if document.get(path) == Some(value) {
                return false;
            }
            document.insert(path.to_string(), value.clone());
            true
        }
        Some((head, rest)) => {
            let parent = document
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Document::new()));
            let mut replaced = false;
            if !parent.is_object() {
                *parent = Value::Object(Document::new());
                replaced = true;
            }
            match parent {
                Value::Object(embedded) => set_path(embedded, rest, value) || replaced,
                _ => replaced,
            }
        }
    }
}

fn unset_path(document: &mut Document, path: &str) -> bool {
    match path.split_once('.') {
        None => document.remove(path).is_some(),
        Some((head, rest)) => match document.get_mut(head) {
            Some(Value::Object(embedded)) => unset_path(embedded, rest),
            _ => false,
        },
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub matched: u64,
    pub modified: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueIndex {
    pub name: String,
    pub fields: Vec<String>,
}

impl UniqueIndex {
    pub fn new(name: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            name: name.into(),
            fields: fields.iter().map(|field| field.to_string()).collect(),
        }
    }

    /// Canonical key of a document under this index. Missing fields index as null.
    pub fn key_for(&self, document: &Document) -> String {
        let values: Vec<&Value> = self
            .fields
            .iter()
            .map(|field| document.get(field).unwrap_or(&Value::Null))
            .collect();
        serde_json::to_string(&values).unwrap_or_default()
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Documents matching `filter`, in the collection's stable insertion order.
    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError>;

    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Document>, StoreError> {
        Ok(self.find(collection, filter).await?.into_iter().next())
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        Ok(self.find(collection, filter).await?.len() as u64)
    }

    async fn insert_one(&self, collection: &str, document: Document) -> Result<(), StoreError>;

    /// Patches the first matching document.
    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        patch: &Patch,
    ) -> Result<UpdateResult, StoreError>;

    /// Patches the first matching document and returns it, before or after the
    /// patch depending on `return_new`. `None` when nothing matched.
    async fn find_and_modify(
        &self,
        collection: &str,
        filter: &Filter,
        patch: &Patch,
        return_new: bool,
    ) -> Result<Option<Document>, StoreError>;

    /// Creates the index if no index with that name exists on the collection.
    async fn ensure_unique_index(
        &self,
        collection: &str,
        index: UniqueIndex,
    ) -> Result<(), StoreError>;
}
