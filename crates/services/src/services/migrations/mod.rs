//! Migration definitions: named, ordered units of change with an idempotency check.

use async_trait::async_trait;
use db::{Document, DocumentStore, store::document_id};
use serde::Serialize;

use super::{
    error::MigrationError,
    identifier::IdGenerator,
    ledger::{ChangeType, EntityType, LedgerStore},
};

pub mod version_backfill;

pub use version_backfill::{DependentRecord, VersionBackfill};

pub const WORKFLOW_DEFAULT_VERSION: &str = "backfill_workflow_default_version";
pub const CONFIG_FILE_DEFAULT_VERSION: &str = "backfill_config_file_default_version";

/// Dependencies a definition may touch while applying itself to one entity.
pub struct MigrationContext<'a> {
    pub store: &'a dyn DocumentStore,
    pub ledger: &'a LedgerStore,
    pub ids: &'a IdGenerator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    /// A new ledger entry was written.
    Applied,
    /// The ledger already proved this version; only missing side writes were completed.
    AlreadyRecorded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityChange {
    pub status: EntityStatus,
    pub version: i64,
    pub version_assigned: bool,
    pub dependent_updated: bool,
}

#[async_trait]
pub trait MigrationDefinition: Send + Sync {
    /// Unique key of the definition; also the name recorded once it completes.
    fn name(&self) -> &str;

    fn collection(&self) -> &str;

    fn applies_to(&self, _document: &Document) -> bool {
        true
    }

    async fn is_already_applied(
        &self,
        ctx: &MigrationContext<'_>,
        document: &Document,
    ) -> Result<bool, MigrationError>;

    async fn apply(
        &self,
        ctx: &MigrationContext<'_>,
        document: &Document,
    ) -> Result<EntityChange, MigrationError>;
}

pub(crate) fn required_id<'a>(
    collection: &str,
    document: &'a Document,
) -> Result<&'a str, MigrationError> {
    document_id(document)
        .ok_or_else(|| MigrationError::malformed(collection, "<missing _id>", "no string _id"))
}

/// Definitions shipped with the engine, in the order they run.
pub fn default_migrations() -> Vec<Box<dyn MigrationDefinition>> {
    vec![
        Box::new(
            VersionBackfill::new(
                WORKFLOW_DEFAULT_VERSION,
                EntityType::Workflow,
                "workflows",
                ChangeType::Created,
            )
            .with_parent_field("appId")
            .with_name_field("name")
            .with_dependent(DependentRecord::new(
                "stateMachines",
                "originId",
                "_id",
                "originVersion",
            )),
        ),
        Box::new(
            VersionBackfill::new(
                CONFIG_FILE_DEFAULT_VERSION,
                EntityType::Config,
                "configFiles",
                ChangeType::Created,
            )
            .with_parent_field("entityId")
            .with_name_field("relativeFilePath")
            .with_dependent(DependentRecord::new(
                "configs.files",
                "_id",
                "fileUuid",
                "version",
            )),
        ),
    ]
}
