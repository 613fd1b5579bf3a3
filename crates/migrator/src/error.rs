use anyhow::Error as AnyhowError;
use db::DbErr;
use services::services::{config::ConfigError, error::MigrationError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigratorError {
    #[error(transparent)]
    Database(#[from] DbErr),
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Other(#[from] AnyhowError),
}
