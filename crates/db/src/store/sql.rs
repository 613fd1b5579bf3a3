use async_trait::async_trait;
use sea_orm::{ConnectionTrait, DatabaseConnection, DbErr, SqlErr, TransactionTrait};
use serde_json::Value;

use super::{
    Document, DocumentStore, Filter, PRIMARY_INDEX, Patch, StoreError, UniqueIndex, UpdateResult,
    document_id,
};
use crate::{
    entities::document,
    models::{document::StoredDocument, document_index::DocumentIndex, unique_key::UniqueKey},
    retry::retry_on_sqlite_busy,
};

/// Document store persisted through sea-orm. Bodies live in `documents`; each
/// unique index claims a row in `document_unique_keys` inside the same
/// transaction as the document write, so the database constraint is what
/// rejects duplicates.
#[derive(Clone)]
pub struct SqlDocumentStore {
    db: DatabaseConnection,
}

fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

fn on_conflict(err: DbErr, collection: &str, index: &str) -> StoreError {
    if is_unique_violation(&err) {
        StoreError::DuplicateKey {
            collection: collection.to_string(),
            index: index.to_string(),
        }
    } else {
        StoreError::Database(err)
    }
}

fn to_document(collection: &str, model: &document::Model) -> Result<Document, StoreError> {
    match &model.body {
        Value::Object(map) => Ok(map.clone()),
        _ => Err(StoreError::CorruptDocument {
            collection: collection.to_string(),
            doc_id: model.doc_id.clone(),
        }),
    }
}

async fn matching_rows<C: ConnectionTrait>(
    db: &C,
    collection: &str,
    filter: &Filter,
) -> Result<Vec<(document::Model, Document)>, StoreError> {
    let rows = StoredDocument::find_in_collection(db, collection, filter.pinned_id()).await?;
    let mut matches = Vec::new();
    for row in rows {
        let document = to_document(collection, &row)?;
        if filter.matches(&document) {
            matches.push((row, document));
        }
    }
    Ok(matches)
}

async fn claim_keys<C: ConnectionTrait>(
    db: &C,
    collection: &str,
    indexes: &[UniqueIndex],
    doc_id: &str,
    document: &Document,
) -> Result<(), StoreError> {
    for index in indexes {
        UniqueKey::claim(db, collection, &index.name, &index.key_for(document), doc_id)
            .await
            .map_err(|err| on_conflict(err, collection, &index.name))?;
    }
    Ok(())
}

impl SqlDocumentStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn insert_once(&self, collection: &str, document: &Document) -> Result<(), StoreError> {
        let doc_id = document_id(document).ok_or_else(|| StoreError::MissingId {
            collection: collection.to_string(),
        })?;

        let txn = self.db.begin().await?;
        let indexes = DocumentIndex::find_for_collection(&txn, collection).await?;
        StoredDocument::insert(&txn, collection, doc_id, Value::Object(document.clone()))
            .await
            .map_err(|err| on_conflict(err, collection, PRIMARY_INDEX))?;
        claim_keys(&txn, collection, &indexes, doc_id, document).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn modify_once(
        &self,
        collection: &str,
        filter: &Filter,
        patch: &Patch,
    ) -> Result<Option<(Document, Document, bool)>, StoreError> {
        if patch.touches_id() {
            return Err(StoreError::ImmutableId {
                collection: collection.to_string(),
            });
        }

        let txn = self.db.begin().await?;
        let Some((row, before)) = matching_rows(&txn, collection, filter)
            .await?
            .into_iter()
            .next()
        else {
            txn.commit().await?;
            return Ok(None);
        };

        let mut after = before.clone();
        let changed = patch.apply(&mut after);
        if changed {
            let doc_id = row.doc_id.clone();
            let indexes = DocumentIndex::find_for_collection(&txn, collection).await?;
            StoredDocument::replace_body(&txn, row, Value::Object(after.clone())).await?;
            UniqueKey::release_all(&txn, collection, &doc_id).await?;
            claim_keys(&txn, collection, &indexes, &doc_id, &after).await?;
        }
        txn.commit().await?;
        Ok(Some((before, after, changed)))
    }

    async fn ensure_index_once(
        &self,
        collection: &str,
        index: &UniqueIndex,
    ) -> Result<(), StoreError> {
        let txn = self.db.begin().await?;
        let existing = DocumentIndex::find_for_collection(&txn, collection).await?;
        if let Some(current) = existing.iter().find(|current| current.name == index.name) {
            if current.fields != index.fields {
                tracing::warn!(
                    collection,
                    index = %index.name,
                    "Unique index already exists with different fields; keeping existing definition"
                );
            }
            txn.commit().await?;
            return Ok(());
        }

        DocumentIndex::create(&txn, collection, index)
            .await
            .map_err(|err| on_conflict(err, collection, &index.name))?;
        for row in StoredDocument::find_in_collection(&txn, collection, None).await? {
            let document = to_document(collection, &row)?;
            claim_keys(&txn, collection, std::slice::from_ref(index), &row.doc_id, &document)
                .await?;
        }
        txn.commit().await?;
        tracing::debug!(collection, index = %index.name, "Created unique document index");
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SqlDocumentStore {
    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        Ok(matching_rows(&self.db, collection, filter)
            .await?
            .into_iter()
            .map(|(_, document)| document)
            .collect())
    }

    async fn insert_one(&self, collection: &str, document: Document) -> Result<(), StoreError> {
        retry_on_sqlite_busy(|| self.insert_once(collection, &document)).await
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        patch: &Patch,
    ) -> Result<UpdateResult, StoreError> {
        let outcome = retry_on_sqlite_busy(|| self.modify_once(collection, filter, patch)).await?;
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
        let outcome = retry_on_sqlite_busy(|| self.modify_once(collection, filter, patch)).await?;
        Ok(outcome.map(|(before, after, _)| if return_new { after } else { before }))
    }

    async fn ensure_unique_index(
        &self,
        collection: &str,
        index: UniqueIndex,
    ) -> Result<(), StoreError> {
        retry_on_sqlite_busy(|| self.ensure_index_once(collection, &index)).await
    }
}
