use serde::{Deserialize, Serialize};

use crate::services::{
    identifier::ByteOrder,
    runner::RunnerOptions,
    seed::{SeedIds, SeedTemplate},
};

pub const CURRENT_CONFIG_VERSION: &str = "v1";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://migrator.db?mode=rwc";

fn default_database_url() -> String {
    DEFAULT_DATABASE_URL.to_string()
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifierConfig {
    #[serde(alias = "byteOrder")]
    pub byte_order: ByteOrder,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedConfig {
    pub template: SeedTemplate,
    /// Written back on first use so every later start reuses the same keys.
    pub ids: Option<SeedIds>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegateRequest {
    #[serde(alias = "accountId")]
    pub account_id: String,
    pub version: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(alias = "configVersion")]
    pub config_version: String,
    #[serde(alias = "databaseUrl")]
    pub database_url: String,
    pub identifiers: IdentifierConfig,
    pub runner: RunnerOptions,
    pub seed: SeedConfig,
    pub delegate: Option<DelegateRequest>,
}

impl Config {
    pub fn from_raw(raw_config: &str) -> Self {
        match serde_json::from_str::<Config>(raw_config) {
            Ok(config) => config.normalized(),
            Err(e) => {
                tracing::warn!(
                    "Failed to parse config (line {}, column {}): {}, using default",
                    e.line(),
                    e.column(),
                    e
                );
                Self::default()
            }
        }
    }

    pub fn normalized(mut self) -> Self {
        self.config_version = CURRENT_CONFIG_VERSION.to_string();

        if self.database_url.trim().is_empty() {
            tracing::warn!("Empty database URL, resetting to default");
            self.database_url = default_database_url();
        }

        if matches!(
            &self.delegate,
            Some(request) if request.account_id.trim().is_empty() || request.version.trim().is_empty()
        ) {
            tracing::warn!("Incomplete delegate request in config, ignoring it");
            self.delegate = None;
        }

        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: CURRENT_CONFIG_VERSION.to_string(),
            database_url: default_database_url(),
            identifiers: IdentifierConfig::default(),
            runner: RunnerOptions::default(),
            seed: SeedConfig::default(),
            delegate: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_for_empty_config() {
        let config = Config::from_raw("{}");

        assert_eq!(config.config_version, CURRENT_CONFIG_VERSION);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.identifiers.byte_order, ByteOrder::Standard);
        assert!(!config.runner.recheck_completed);
        assert!(config.seed.ids.is_none());
        assert!(config.delegate.is_none());
    }

    #[test]
    fn invalid_json_falls_back_to_default() {
        let config = Config::from_raw("{invalid json");

        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
    }

    #[test]
    fn aliases_and_normalization_are_applied() {
        let raw = r#"{
            "configVersion": "v0",
            "databaseUrl": "postgres://localhost/harness",
            "identifiers": { "byteOrder": "LEGACY_SWAPPED" },
            "runner": { "recheckCompleted": true },
            "seed": { "template": { "accountId": "acct", "companyName": "Acme" } },
            "delegate": { "accountId": "acct", "version": "1.0.2" }
        }"#;

        let config = Config::from_raw(raw);

        assert_eq!(config.config_version, CURRENT_CONFIG_VERSION);
        assert_eq!(config.database_url, "postgres://localhost/harness");
        assert_eq!(config.identifiers.byte_order, ByteOrder::LegacySwapped);
        assert!(config.runner.recheck_completed);
        assert_eq!(config.seed.template.account_id.as_deref(), Some("acct"));
        assert_eq!(
            config.delegate,
            Some(DelegateRequest {
                account_id: "acct".into(),
                version: "1.0.2".into(),
            })
        );
    }

    #[test]
    fn blank_values_are_reset() {
        let raw = r#"{ "database_url": " ", "delegate": { "account_id": "acct", "version": "" } }"#;
        let config = Config::from_raw(raw);

        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert!(config.delegate.is_none());
    }
}
