use db::{DocumentStore, Filter, Patch};
use serde_json::Value;

use super::{error::MigrationError, seed::ACCOUNTS};

pub const MANAGER_CONFIGURATION: &str = "managerConfiguration";
pub const PRIMARY_VERSION_FIELD: &str = "primaryVersion";
pub const DELEGATE_CONFIGURATION_FIELD: &str = "delegateConfiguration";
pub const DELEGATE_VERSIONS_FIELD: &str = "delegateVersions";
/// A primary version of `*` means "no pinned release".
pub const WILDCARD_VERSION: &str = "*";

/// Versions an account should run: just the requested one when nothing is
/// pinned, otherwise the pinned primary alongside it for the rollout window.
pub fn compute_delegate_versions(primary_version: &str, requested: &str) -> Vec<String> {
    if primary_version == WILDCARD_VERSION || primary_version == requested {
        vec![requested.to_string()]
    } else {
        vec![primary_version.to_string(), requested.to_string()]
    }
}

async fn read_primary_version(store: &dyn DocumentStore) -> Result<String, MigrationError> {
    let Some(configuration) = store
        .find_one(MANAGER_CONFIGURATION, &Filter::new())
        .await?
    else {
        tracing::warn!("No manager configuration document; assuming wildcard primary version");
        return Ok(WILDCARD_VERSION.to_string());
    };
    match configuration.get(PRIMARY_VERSION_FIELD).and_then(Value::as_str) {
        Some(version) => Ok(version.to_string()),
        None => {
            tracing::warn!("Manager configuration has no primaryVersion; assuming wildcard");
            Ok(WILDCARD_VERSION.to_string())
        }
    }
}

/// Pins delegate versions on one account and returns what was stored.
///
/// Read-modify-write across two documents without a transaction; a concurrent
/// change to `primaryVersion` between the read and the write is not detected.
pub async fn publish_delegate_version(
    store: &dyn DocumentStore,
    account_id: &str,
    version: &str,
) -> Result<Vec<String>, MigrationError> {
    let version = version.trim();
    if version.is_empty() {
        return Err(MigrationError::InvalidArgument(
            "delegate version must not be empty".to_string(),
        ));
    }

    let primary = read_primary_version(store).await?;
    let versions = compute_delegate_versions(&primary, version);

    // Only the version list is replaced; the rest of the configuration stays.
    let patch = Patch::new().set(
        format!("{DELEGATE_CONFIGURATION_FIELD}.{DELEGATE_VERSIONS_FIELD}"),
        versions,
    );
    let updated = store
        .find_and_modify(ACCOUNTS, &Filter::by_id(account_id), &patch, true)
        .await?
        .ok_or_else(|| MigrationError::AccountNotFound(account_id.to_string()))?;

    let stored = updated
        .get(DELEGATE_CONFIGURATION_FIELD)
        .and_then(|configuration| configuration.get(DELEGATE_VERSIONS_FIELD))
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    tracing::info!(
        account_id,
        primary_version = %primary,
        delegate_versions = ?stored,
        "Published delegate versions"
    );
    Ok(stored)
}
