use async_trait::async_trait;
use db::{Document, DocumentStore, Filter, Patch};
use serde_json::Value;

use super::{EntityChange, EntityStatus, MigrationContext, MigrationDefinition, required_id};
use crate::services::{
    error::MigrationError,
    ledger::{ChangeType, EntityType, EntityVersionRecord, VersionMark, read_default_version},
};

pub const INITIAL_VERSION: i64 = 1;

/// A record that must carry the same version as its owning entity, such as a
/// workflow's state machine or a config file's stored content.
#[derive(Debug, Clone)]
pub struct DependentRecord {
    pub collection: String,
    /// Field on the dependent record that points at the entity.
    pub link_field: String,
    /// Field on the entity holding the value `link_field` must equal.
    pub source_field: String,
    pub version_field: String,
}

impl DependentRecord {
    pub fn new(
        collection: impl Into<String>,
        link_field: impl Into<String>,
        source_field: impl Into<String>,
        version_field: impl Into<String>,
    ) -> Self {
        Self {
            collection: collection.into(),
            link_field: link_field.into(),
            source_field: source_field.into(),
            version_field: version_field.into(),
        }
    }

    fn pending_filter(&self, owner: &str, entity: &Document) -> Result<Filter, MigrationError> {
        let link = match entity.get(&self.source_field) {
            Some(Value::String(link)) => link.clone(),
            _ => {
                return Err(MigrationError::malformed(
                    owner,
                    required_id(owner, entity)?,
                    format!("missing string field '{}'", self.source_field),
                ));
            }
        };
        Ok(Filter::new()
            .eq(self.link_field.as_str(), link)
            .exists(self.version_field.as_str(), false))
    }

    async fn has_pending(
        &self,
        store: &dyn DocumentStore,
        owner: &str,
        entity: &Document,
    ) -> Result<bool, MigrationError> {
        let filter = self.pending_filter(owner, entity)?;
        Ok(store.count(&self.collection, &filter).await? > 0)
    }

    /// Stamps the version on every dependent record that has none yet. Each
    /// write leaves the record outside the pending filter, so the loop ends
    /// once no unversioned record is left.
    async fn sync(
        &self,
        store: &dyn DocumentStore,
        owner: &str,
        entity: &Document,
        version: i64,
    ) -> Result<bool, MigrationError> {
        let filter = self.pending_filter(owner, entity)?;
        let patch = Patch::new().set(self.version_field.as_str(), version);
        let mut stamped = 0u64;
        loop {
            let result = store.update_one(&self.collection, &filter, &patch).await?;
            if result.modified == 0 {
                break;
            }
            stamped += result.modified;
        }
        if stamped > 1 {
            tracing::debug!(
                collection = %self.collection,
                owner,
                stamped,
                "Versioned several dependent records"
            );
        }
        Ok(stamped > 0)
    }
}

/// Moves legacy entities from "unversioned" to version 1 and proves it in the
/// ledger. The sequence is entity field, dependent record, ledger entry; each
/// step is conditional, so a run interrupted between any two steps is finished
/// by the next run.
#[derive(Debug, Clone)]
pub struct VersionBackfill {
    name: String,
    entity_type: EntityType,
    collection: String,
    change_type: ChangeType,
    parent_field: Option<String>,
    name_field: Option<String>,
    dependent: Option<DependentRecord>,
}

impl VersionBackfill {
    pub fn new(
        name: impl Into<String>,
        entity_type: EntityType,
        collection: impl Into<String>,
        change_type: ChangeType,
    ) -> Self {
        Self {
            name: name.into(),
            entity_type,
            collection: collection.into(),
            change_type,
            parent_field: None,
            name_field: None,
            dependent: None,
        }
    }

    pub fn with_parent_field(mut self, field: impl Into<String>) -> Self {
        self.parent_field = Some(field.into());
        self
    }

    pub fn with_name_field(mut self, field: impl Into<String>) -> Self {
        self.name_field = Some(field.into());
        self
    }

    pub fn with_dependent(mut self, dependent: DependentRecord) -> Self {
        self.dependent = Some(dependent);
        self
    }

    fn string_field(document: &Document, field: Option<&String>) -> Option<String> {
        field
            .and_then(|field| document.get(field))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[async_trait]
impl MigrationDefinition for VersionBackfill {
    fn name(&self) -> &str {
        &self.name
    }

    fn collection(&self) -> &str {
        &self.collection
    }

    async fn is_already_applied(
        &self,
        ctx: &MigrationContext<'_>,
        document: &Document,
    ) -> Result<bool, MigrationError> {
        let entity_id = required_id(&self.collection, document)?;
        let Some(version) = read_default_version(&self.collection, document)? else {
            return Ok(false);
        };
        if !ctx
            .ledger
            .has_version_record(self.entity_type, entity_id, version)
            .await?
        {
            return Ok(false);
        }
        match &self.dependent {
            Some(dependent) => Ok(!dependent
                .has_pending(ctx.store, &self.collection, document)
                .await?),
            None => Ok(true),
        }
    }

    async fn apply(
        &self,
        ctx: &MigrationContext<'_>,
        document: &Document,
    ) -> Result<EntityChange, MigrationError> {
        let entity_id = required_id(&self.collection, document)?;

        let (version, version_assigned) = match read_default_version(&self.collection, document)? {
            Some(version) => (version, false),
            None => match ctx
                .ledger
                .mark_entity_versioned(&self.collection, entity_id, INITIAL_VERSION)
                .await?
            {
                VersionMark::Assigned(version) => (version, true),
                VersionMark::Existing(version) => (version, false),
            },
        };

        let dependent_updated = match &self.dependent {
            Some(dependent) => {
                dependent
                    .sync(ctx.store, &self.collection, document, version)
                    .await?
            }
            None => false,
        };

        let mut change = EntityChange {
            status: EntityStatus::AlreadyRecorded,
            version,
            version_assigned,
            dependent_updated,
        };

        if ctx
            .ledger
            .has_version_record(self.entity_type, entity_id, version)
            .await?
        {
            return Ok(change);
        }

        let record = EntityVersionRecord::new(
            ctx.ids.new_id(),
            self.entity_type,
            entity_id,
            version,
            self.change_type,
        )
        .with_parent(Self::string_field(document, self.parent_field.as_ref()))
        .with_name(Self::string_field(document, self.name_field.as_ref()));

        match ctx.ledger.append_version_record(&record).await {
            Ok(()) => change.status = EntityStatus::Applied,
            Err(MigrationError::DuplicateRecord { .. }) => {
                tracing::debug!(
                    migration = %self.name,
                    entity_id,
                    version,
                    "Ledger entry written concurrently; treating as already recorded"
                );
            }
            Err(err) => return Err(err),
        }
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use db::MemoryDocumentStore;
    use serde_json::json;
    use test_support::doc;

    use super::*;
    use crate::services::{identifier::IdGenerator, ledger::LedgerStore};

    fn workflow_backfill() -> VersionBackfill {
        VersionBackfill::new("wf", EntityType::Workflow, "workflows", ChangeType::Created)
            .with_parent_field("appId")
            .with_name_field("name")
            .with_dependent(DependentRecord::new(
                "stateMachines",
                "originId",
                "_id",
                "originVersion",
            ))
    }

    async fn seeded() -> (Arc<MemoryDocumentStore>, LedgerStore, IdGenerator) {
        let store = Arc::new(MemoryDocumentStore::new());
        let ids = IdGenerator::default();
        let ledger = LedgerStore::new(store.clone(), ids.clone());
        ledger.ensure_indexes().await.unwrap();
        store
            .insert_one(
                "workflows",
                doc(json!({ "_id": "w1", "appId": "app", "name": "Deploy" })),
            )
            .await
            .unwrap();
        store
            .insert_one("stateMachines", doc(json!({ "_id": "sm1", "originId": "w1" })))
            .await
            .unwrap();
        (store, ledger, ids)
    }

    #[tokio::test]
    async fn apply_versions_entity_dependent_and_ledger() {
        let (store, ledger, ids) = seeded().await;
        let ctx = MigrationContext {
            store: store.as_ref(),
            ledger: &ledger,
            ids: &ids,
        };
        let backfill = workflow_backfill();
        let workflow = store.documents("workflows").remove(0);

        assert!(!backfill.is_already_applied(&ctx, &workflow).await.unwrap());
        let change = backfill.apply(&ctx, &workflow).await.unwrap();
        assert_eq!(
            change,
            EntityChange {
                status: EntityStatus::Applied,
                version: 1,
                version_assigned: true,
                dependent_updated: true,
            }
        );

        let state_machine = store.documents("stateMachines").remove(0);
        assert_eq!(state_machine.get("originVersion"), Some(&json!(1)));

        let records = ledger
            .find_version_records(EntityType::Workflow, "w1")
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entity_parent_uuid.as_deref(), Some("app"));
        assert_eq!(records[0].entity_name.as_deref(), Some("Deploy"));

        let workflow = store.documents("workflows").remove(0);
        assert!(backfill.is_already_applied(&ctx, &workflow).await.unwrap());
    }

    #[tokio::test]
    async fn stale_snapshot_reuses_concurrently_assigned_version() {
        let (store, ledger, ids) = seeded().await;
        let ctx = MigrationContext {
            store: store.as_ref(),
            ledger: &ledger,
            ids: &ids,
        };
        let backfill = workflow_backfill();
        let stale = store.documents("workflows").remove(0);

        backfill.apply(&ctx, &stale).await.unwrap();
        let change = backfill.apply(&ctx, &stale).await.unwrap();
        assert_eq!(change.status, EntityStatus::AlreadyRecorded);
        assert!(!change.version_assigned);
        assert!(!change.dependent_updated);
        assert_eq!(store.documents("entityVersions").len(), 1);
    }

    #[tokio::test]
    async fn missing_link_field_is_malformed() {
        let store = Arc::new(MemoryDocumentStore::new());
        let ids = IdGenerator::default();
        let ledger = LedgerStore::new(store.clone(), ids.clone());
        let ctx = MigrationContext {
            store: store.as_ref(),
            ledger: &ledger,
            ids: &ids,
        };
        let backfill =
            VersionBackfill::new("cfg", EntityType::Config, "configFiles", ChangeType::Created)
                .with_dependent(DependentRecord::new("configs.files", "_id", "fileUuid", "version"));
        store
            .insert_one("configFiles", doc(json!({ "_id": "c1" })))
            .await
            .unwrap();

        let config = store.documents("configFiles").remove(0);
        let err = backfill.apply(&ctx, &config).await.unwrap_err();
        assert!(matches!(err, MigrationError::MalformedEntity { .. }));
        assert!(!err.is_fatal());
    }
}
