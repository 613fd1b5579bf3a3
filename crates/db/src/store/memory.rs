use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;

use super::{
    Document, DocumentStore, Filter, PRIMARY_INDEX, Patch, StoreError, UniqueIndex, UpdateResult,
    document_id,
};

/// In-process document store. Unique indexes are checked under the same lock
/// as the write, so they hold across concurrent callers.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    collections: HashMap<String, Vec<Document>>,
    indexes: HashMap<String, Vec<UniqueIndex>>,
}

impl MemoryState {
    fn ensure_unique(
        &self,
        collection: &str,
        candidate: &Document,
        skip: Option<usize>,
    ) -> Result<(), StoreError> {
        let Some(documents) = self.collections.get(collection) else {
            return Ok(());
        };
        let others = || {
            documents
                .iter()
                .enumerate()
                .filter(move |(position, _)| Some(*position) != skip)
                .map(|(_, document)| document)
        };

        if others().any(|existing| document_id(existing) == document_id(candidate)) {
            return Err(duplicate(collection, PRIMARY_INDEX));
        }

        for index in self.indexes.get(collection).into_iter().flatten() {
            let key = index.key_for(candidate);
            if others().any(|existing| index.key_for(existing) == key) {
                return Err(duplicate(collection, &index.name));
            }
        }
        Ok(())
    }

    fn modify_first(
        &mut self,
        collection: &str,
        filter: &Filter,
        patch: &Patch,
    ) -> Result<Option<(Document, Document, bool)>, StoreError> {
        if patch.touches_id() {
            return Err(StoreError::ImmutableId {
                collection: collection.to_string(),
            });
        }

        let Some(position) = self
            .collections
            .get(collection)
            .and_then(|documents| documents.iter().position(|document| filter.matches(document)))
        else {
            return Ok(None);
        };

        let before = self.collections[collection][position].clone();
        let mut after = before.clone();
        let changed = patch.apply(&mut after);
        if changed {
            self.ensure_unique(collection, &after, Some(position))?;
            if let Some(documents) = self.collections.get_mut(collection) {
                documents[position] = after.clone();
            }
        }
        Ok(Some((before, after, changed)))
    }
}

fn duplicate(collection: &str, index: &str) -> StoreError {
    StoreError::DuplicateKey {
        collection: collection.to_string(),
        index: index.to_string(),
    }
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Snapshot of a collection in insertion order.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.lock()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        Ok(self
            .lock()
            .collections
            .get(collection)
            .map(|documents| {
                documents
                    .iter()
                    .filter(|document| filter.matches(document))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert_one(&self, collection: &str, document: Document) -> Result<(), StoreError> {
        if document_id(&document).is_none() {
            return Err(StoreError::MissingId {
                collection: collection.to_string(),
            });
        }

        let mut state = self.lock();
        state.ensure_unique(collection, &document, None)?;
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(document);
        Ok(())
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        patch: &Patch,
    ) -> Result<UpdateResult, StoreError> {
        let outcome = self.lock().modify_first(collection, filter, patch)?;
        Ok(match outcome {
            Some((_, _, changed)) => UpdateResult {
                matched: 1,
                modified: u64::from(changed),
            },
            None => UpdateResult::default(),
        })
    }

    async fn find_and_modify(
        &self,
        collection: &str,
        filter: &Filter,
        patch: &Patch,
        return_new: bool,
    ) -> Result<Option<Document>, StoreError> {
        let outcome = self.lock().modify_first(collection, filter, patch)?;
        Ok(outcome.map(|(before, after, _)| if return_new { after } else { before }))
    }

    async fn ensure_unique_index(
        &self,
        collection: &str,
        index: UniqueIndex,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let existing = state.indexes.get(collection).into_iter().flatten();
        if let Some(current) = existing.into_iter().find(|current| current.name == index.name) {
            if current.fields != index.fields {
                tracing::warn!(
                    collection,
                    index = %index.name,
                    "Unique index already exists with different fields; keeping existing definition"
                );
            }
            return Ok(());
        }

        let mut keys = std::collections::HashSet::new();
        for document in state.collections.get(collection).into_iter().flatten() {
            if !keys.insert(index.key_for(document)) {
                return Err(duplicate(collection, &index.name));
            }
        }

        state
            .indexes
            .entry(collection.to_string())
            .or_default()
            .push(index);
        Ok(())
    }
}
