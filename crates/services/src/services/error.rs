use db::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrationError {
    /// The ledger already holds this tuple. Callers treat it as "already done".
    #[error("version record already exists for {entity_type} {entity_uuid} v{version}")]
    DuplicateRecord {
        entity_type: String,
        entity_uuid: String,
        version: i64,
    },
    #[error("malformed entity {entity_id} in '{collection}': {reason}")]
    MalformedEntity {
        collection: String,
        entity_id: String,
        reason: String,
    },
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] StoreError),
    #[error("seed template is missing required values: {}", missing.join(", "))]
    TemplateIncomplete { missing: Vec<&'static str> },
    #[error("account not found: {0}")]
    AccountNotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("migration '{0}' is registered twice")]
    DuplicateDefinition(String),
}

impl MigrationError {
    /// Fatal errors abort a run; the rest are recorded against a single entity.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            MigrationError::DuplicateRecord { .. } | MigrationError::MalformedEntity { .. }
        )
    }

    pub fn malformed(
        collection: &str,
        entity_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        MigrationError::MalformedEntity {
            collection: collection.to_string(),
            entity_id: entity_id.into(),
            reason: reason.into(),
        }
    }
}
