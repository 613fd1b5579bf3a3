use std::{
    env,
    path::{Path, PathBuf},
};

use thiserror::Error;

mod schema;

pub use schema::{
    Config, DelegateRequest, IdentifierConfig, SeedConfig, CURRENT_CONFIG_VERSION,
    DEFAULT_DATABASE_URL,
};

pub const CONFIG_PATH_ENV: &str = "MIGRATOR_CONFIG";
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";
pub const DEFAULT_CONFIG_FILE: &str = "migrator.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// `MIGRATOR_CONFIG` if set, otherwise `migrator.json` in the working directory.
pub fn config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Will always return config, falling back to defaults on missing/invalid files.
pub async fn load_config_from_file(config_path: &Path) -> Config {
    match std::fs::read_to_string(config_path) {
        Ok(raw_config) => Config::from_raw(&raw_config),
        Err(err) => {
            if err.kind() == std::io::ErrorKind::NotFound {
                tracing::info!(path = %config_path.display(), "No config file found, using defaults");
            } else {
                tracing::warn!("Failed to read config file: {}", err);
            }
            Config::default()
        }
    }
}

/// Saves the config to the given path
pub async fn save_config_to_file(config: &Config, config_path: &Path) -> Result<(), ConfigError> {
    let normalized = config.clone().normalized();
    let raw_config = serde_json::to_string_pretty(&normalized)?;
    std::fs::write(config_path, raw_config)?;
    Ok(())
}

impl Config {
    /// Applies `DATABASE_URL` on top of the file contents.
    pub fn with_env_overrides(self) -> Self {
        self.with_database_url(env::var(DATABASE_URL_ENV).ok())
    }

    pub fn with_database_url(mut self, database_url: Option<String>) -> Self {
        if let Some(url) = database_url.filter(|url| !url.trim().is_empty()) {
            tracing::debug!("Database URL overridden from environment");
            self.database_url = url;
        }
        self
    }

    pub fn delegate_request(&self) -> Result<&DelegateRequest, ConfigError> {
        self.delegate.as_ref().ok_or_else(|| {
            ConfigError::ValidationError(
                "publishing delegate versions needs delegate.account_id and delegate.version"
                    .to_string(),
            )
        })
    }
}
