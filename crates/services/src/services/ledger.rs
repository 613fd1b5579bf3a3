//! Append-only ledger of entity versions and completed migrations.

use std::{collections::BTreeSet, sync::Arc};

use chrono::Utc;
use db::{Document, DocumentStore, Filter, Patch, StoreError, UniqueIndex, store::document_id};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumString};

use super::{error::MigrationError, identifier::IdGenerator};

pub const ENTITY_VERSIONS: &str = "entityVersions";
pub const APPLIED_MIGRATIONS: &str = "appliedMigrations";
pub const ENTITY_VERSION_INDEX: &str = "entity_version_unique";
pub const APPLIED_MIGRATION_INDEX: &str = "applied_migration_name";
pub const DEFAULT_VERSION_FIELD: &str = "defaultVersion";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Config,
    Workflow,
    Pipeline,
    Service,
    Environment,
    Application,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityVersionRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub entity_type: EntityType,
    pub entity_uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_parent_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_name: Option<String>,
    pub version: i64,
    pub change_type: ChangeType,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub last_updated_at: i64,
}

impl EntityVersionRecord {
    pub fn new(
        id: String,
        entity_type: EntityType,
        entity_uuid: impl Into<String>,
        version: i64,
        change_type: ChangeType,
    ) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id,
            entity_type,
            entity_uuid: entity_uuid.into(),
            entity_parent_uuid: None,
            entity_name: None,
            version,
            change_type,
            created_at: now,
            last_updated_at: now,
        }
    }

    pub fn with_parent(mut self, parent_uuid: Option<String>) -> Self {
        self.entity_parent_uuid = parent_uuid;
        self
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.entity_name = name;
        self
    }
}

/// Result of [`LedgerStore::mark_entity_versioned`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionMark {
    /// This call set the field.
    Assigned(i64),
    /// The field was already set, by an earlier run or a concurrent one.
    Existing(i64),
}

impl VersionMark {
    pub fn version(self) -> i64 {
        match self {
            VersionMark::Assigned(version) | VersionMark::Existing(version) => version,
        }
    }
}

/// Reads `defaultVersion`: `None` when absent or null, an error when it is not a
/// positive integer.
pub fn read_default_version(
    collection: &str,
    document: &Document,
) -> Result<Option<i64>, MigrationError> {
    let entity_id = document_id(document).unwrap_or("<missing _id>");
    match document.get(DEFAULT_VERSION_FIELD) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => match value.as_i64() {
            Some(version) if version >= 1 => Ok(Some(version)),
            _ => Err(MigrationError::malformed(
                collection,
                entity_id,
                format!("{DEFAULT_VERSION_FIELD} must be a positive integer, found {value}"),
            )),
        },
    }
}

pub(crate) fn to_document<T: Serialize>(value: &T) -> Result<Document, StoreError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Serde(serde::ser::Error::custom(format!(
            "expected a JSON object, got {other}"
        )))),
    }
}

#[derive(Clone)]
pub struct LedgerStore {
    store: Arc<dyn DocumentStore>,
    ids: IdGenerator,
}

impl LedgerStore {
    pub fn new(store: Arc<dyn DocumentStore>, ids: IdGenerator) -> Self {
        Self { store, ids }
    }

    /// Storage-level uniqueness for the ledger; safe to call on every run.
    pub async fn ensure_indexes(&self) -> Result<(), MigrationError> {
        self.store
            .ensure_unique_index(
                ENTITY_VERSIONS,
                UniqueIndex::new(ENTITY_VERSION_INDEX, &["entityType", "entityUuid", "version"]),
            )
            .await?;
        self.store
            .ensure_unique_index(
                APPLIED_MIGRATIONS,
                UniqueIndex::new(APPLIED_MIGRATION_INDEX, &["name"]),
            )
            .await?;
        Ok(())
    }

    fn version_filter(entity_type: EntityType, entity_uuid: &str) -> Filter {
        Filter::new()
            .eq("entityType", entity_type.to_string())
            .eq("entityUuid", entity_uuid)
    }

    pub async fn has_version_record(
        &self,
        entity_type: EntityType,
        entity_uuid: &str,
        version: i64,
    ) -> Result<bool, MigrationError> {
        let filter = Self::version_filter(entity_type, entity_uuid).eq("version", version);
        Ok(self.store.count(ENTITY_VERSIONS, &filter).await? > 0)
    }

    pub async fn find_version_records(
        &self,
        entity_type: EntityType,
        entity_uuid: &str,
    ) -> Result<Vec<EntityVersionRecord>, MigrationError> {
        let documents = self
            .store
            .find(ENTITY_VERSIONS, &Self::version_filter(entity_type, entity_uuid))
            .await?;
        documents
            .into_iter()
            .map(|document| {
                serde_json::from_value(Value::Object(document))
                    .map_err(|err| MigrationError::StorageUnavailable(StoreError::Serde(err)))
            })
            .collect()
    }

    /// Insert-only. A second record for the same tuple fails with `DuplicateRecord`.
    pub async fn append_version_record(
        &self,
        record: &EntityVersionRecord,
    ) -> Result<(), MigrationError> {
        let document = to_document(record)?;
        match self.store.insert_one(ENTITY_VERSIONS, document).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_duplicate_key() => Err(MigrationError::DuplicateRecord {
                entity_type: record.entity_type.to_string(),
                entity_uuid: record.entity_uuid.clone(),
                version: record.version,
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Sets `defaultVersion` only where it is still unset; an existing value is
    /// never overwritten and is returned instead.
    pub async fn mark_entity_versioned(
        &self,
        collection: &str,
        entity_id: &str,
        initial_version: i64,
    ) -> Result<VersionMark, MigrationError> {
        if initial_version < 1 {
            return Err(MigrationError::InvalidArgument(format!(
                "initial version must be at least 1, got {initial_version}"
            )));
        }

        let filter = Filter::by_id(entity_id).eq(DEFAULT_VERSION_FIELD, Value::Null);
        let patch = Patch::new().set(DEFAULT_VERSION_FIELD, initial_version);
        let result = self.store.update_one(collection, &filter, &patch).await?;
        if result.modified > 0 {
            return Ok(VersionMark::Assigned(initial_version));
        }

        let current = self
            .store
            .find_one(collection, &Filter::by_id(entity_id))
            .await?
            .ok_or_else(|| {
                MigrationError::malformed(collection, entity_id, "entity disappeared mid-run")
            })?;
        match read_default_version(collection, &current)? {
            Some(version) => Ok(VersionMark::Existing(version)),
            None => Err(MigrationError::malformed(
                collection,
                entity_id,
                "defaultVersion could not be assigned",
            )),
        }
    }

    pub async fn applied_migrations(&self) -> Result<BTreeSet<String>, MigrationError> {
        let documents = self.store.find(APPLIED_MIGRATIONS, &Filter::new()).await?;
        Ok(documents
            .iter()
            .filter_map(|document| document.get("name").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    /// Returns `false` when another run recorded the migration first.
    pub async fn record_migration_applied(&self, name: &str) -> Result<bool, MigrationError> {
        let mut document = Document::new();
        document.insert("_id".to_string(), Value::String(self.ids.new_id()));
        document.insert("name".to_string(), Value::String(name.to_string()));
        document.insert(
            "appliedAt".to_string(),
            Value::from(Utc::now().timestamp_millis()),
        );
        match self.store.insert_one(APPLIED_MIGRATIONS, document).await {
            Ok(()) => Ok(true),
            Err(err) if err.is_duplicate_key() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use db::MemoryDocumentStore;
    use serde_json::json;
    use test_support::doc;

    use super::*;

    fn ledger() -> (Arc<MemoryDocumentStore>, LedgerStore) {
        let store = Arc::new(MemoryDocumentStore::new());
        let ledger = LedgerStore::new(store.clone(), IdGenerator::default());
        (store, ledger)
    }

    #[tokio::test]
    async fn append_rejects_second_record_for_same_tuple() {
        let (_, ledger) = ledger();
        ledger.ensure_indexes().await.unwrap();
        let ids = IdGenerator::default();

        let first =
            EntityVersionRecord::new(ids.new_id(), EntityType::Workflow, "w1", 1, ChangeType::Created);
        ledger.append_version_record(&first).await.unwrap();
        assert!(
            ledger
                .has_version_record(EntityType::Workflow, "w1", 1)
                .await
                .unwrap()
        );

        let second =
            EntityVersionRecord::new(ids.new_id(), EntityType::Workflow, "w1", 1, ChangeType::Created);
        let err = ledger.append_version_record(&second).await.unwrap_err();
        assert!(matches!(err, MigrationError::DuplicateRecord { version: 1, .. }));
        assert!(!err.is_fatal());

        let records = ledger
            .find_version_records(EntityType::Workflow, "w1")
            .await
            .unwrap();
        assert_eq!(records, vec![first]);
    }

    #[tokio::test]
    async fn records_are_scoped_by_entity_type() {
        let (_, ledger) = ledger();
        ledger.ensure_indexes().await.unwrap();
        let record =
            EntityVersionRecord::new("a".into(), EntityType::Config, "shared", 1, ChangeType::Created);
        ledger.append_version_record(&record).await.unwrap();
        assert!(
            !ledger
                .has_version_record(EntityType::Workflow, "shared", 1)
                .await
                .unwrap()
        );
        assert!(
            !ledger
                .has_version_record(EntityType::Config, "shared", 2)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn record_serializes_with_document_field_names() {
        let record = EntityVersionRecord::new(
            "rec".into(),
            EntityType::Config,
            "cfg",
            1,
            ChangeType::Created,
        )
        .with_parent(Some("app".into()));
        let document = to_document(&record).unwrap();
        assert_eq!(document.get("_id"), Some(&json!("rec")));
        assert_eq!(document.get("entityType"), Some(&json!("CONFIG")));
        assert_eq!(document.get("changeType"), Some(&json!("CREATED")));
        assert_eq!(document.get("entityParentUuid"), Some(&json!("app")));
        assert!(!document.contains_key("entityName"));
    }

    #[tokio::test]
    async fn mark_entity_versioned_never_overwrites() {
        let (store, ledger) = ledger();
        store
            .insert_one("workflows", doc(json!({ "_id": "fresh" })))
            .await
            .unwrap();
        store
            .insert_one("workflows", doc(json!({ "_id": "old", "defaultVersion": 4 })))
            .await
            .unwrap();

        assert_eq!(
            ledger.mark_entity_versioned("workflows", "fresh", 1).await.unwrap(),
            VersionMark::Assigned(1)
        );
        assert_eq!(
            ledger.mark_entity_versioned("workflows", "fresh", 1).await.unwrap(),
            VersionMark::Existing(1)
        );
        assert_eq!(
            ledger.mark_entity_versioned("workflows", "old", 1).await.unwrap(),
            VersionMark::Existing(4)
        );

        let old = store.find_one("workflows", &Filter::by_id("old")).await.unwrap().unwrap();
        assert_eq!(old.get(DEFAULT_VERSION_FIELD), Some(&json!(4)));
    }

    #[tokio::test]
    async fn mark_entity_versioned_reports_missing_entities() {
        let (_, ledger) = ledger();
        let err = ledger
            .mark_entity_versioned("workflows", "ghost", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::MalformedEntity { .. }));

        let err = ledger
            .mark_entity_versioned("workflows", "ghost", 0)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::InvalidArgument(_)));
    }

    #[test]
    fn default_version_parsing() {
        assert_eq!(
            read_default_version("c", &doc(json!({ "_id": "a" }))).unwrap(),
            None
        );
        assert_eq!(
            read_default_version("c", &doc(json!({ "_id": "a", "defaultVersion": null }))).unwrap(),
            None
        );
        assert_eq!(
            read_default_version("c", &doc(json!({ "_id": "a", "defaultVersion": 3 }))).unwrap(),
            Some(3)
        );
        for bad in [json!(0), json!(-1), json!("1"), json!(1.5)] {
            let document = doc(json!({ "_id": "a", "defaultVersion": bad }));
            assert!(read_default_version("c", &document).is_err());
        }
    }

    #[tokio::test]
    async fn applied_migrations_are_recorded_once() {
        let (_, ledger) = ledger();
        ledger.ensure_indexes().await.unwrap();
        assert!(ledger.record_migration_applied("backfill").await.unwrap());
        assert!(!ledger.record_migration_applied("backfill").await.unwrap());
        let applied = ledger.applied_migrations().await.unwrap();
        assert_eq!(applied.into_iter().collect::<Vec<_>>(), vec!["backfill"]);
    }
}
