use std::{path::PathBuf, sync::Arc};

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use db::DocumentStore;
use serde::Serialize;
use services::services::{
    config::Config,
    delegate::publish_delegate_version,
    identifier::IdGenerator,
    migrations::default_migrations,
    runner::{MigrationReport, MigrationRunner},
    seed::{SeedIds, SeedOutcome, seed_if_empty},
};

pub mod error;

pub use error::MigratorError;

#[derive(Parser, Debug)]
#[command(name = "migrator", about = "Versioned, idempotent migrations for the document store")]
pub struct Cli {
    /// Config file; defaults to $MIGRATOR_CONFIG, then ./migrator.json.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run every pending migration (the default).
    Migrate,
    /// Create the initial account bundle if no account exists.
    Seed,
    /// Seed, then migrate.
    Bootstrap,
    /// Pin delegate versions on an account.
    PublishDelegate {
        #[arg(long)]
        account_id: Option<String>,
        #[arg(long)]
        version: Option<String>,
    },
}

impl Command {
    pub fn needs_seed_ids(&self) -> bool {
        matches!(self, Command::Seed | Command::Bootstrap)
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CommandReport {
    Migrate {
        report: MigrationReport,
    },
    Seed {
        seed: SeedOutcome,
    },
    Bootstrap {
        seed: SeedOutcome,
        report: MigrationReport,
    },
    PublishDelegate {
        account_id: String,
        delegate_versions: Vec<String>,
    },
}

impl CommandReport {
    pub fn has_failures(&self) -> bool {
        match self {
            CommandReport::Migrate { report } | CommandReport::Bootstrap { report, .. } => {
                report.has_failures()
            }
            CommandReport::Seed { .. } | CommandReport::PublishDelegate { .. } => false,
        }
    }
}

/// Generates seed ids the first time they are needed. Returns `true` when the
/// config changed and has to be saved before seeding.
pub fn ensure_seed_ids(config: &mut Config, ids: &IdGenerator) -> bool {
    if config.seed.ids.is_some() {
        return false;
    }
    config.seed.ids = Some(SeedIds::generate(ids));
    tracing::info!("Generated seed ids for this environment");
    true
}

async fn run_migrations(
    store: Arc<dyn DocumentStore>,
    config: &Config,
    ids: IdGenerator,
) -> Result<MigrationReport, MigratorError> {
    let mut runner = MigrationRunner::new(store, ids, config.runner.clone());
    runner.register_all(default_migrations())?;
    Ok(runner.run_pending_migrations().await?)
}

async fn run_seed(store: &dyn DocumentStore, config: &Config) -> Result<SeedOutcome, MigratorError> {
    let seed_ids = config
        .seed
        .ids
        .as_ref()
        .ok_or_else(|| anyhow!("seed ids are not configured"))?;
    Ok(seed_if_empty(store, &config.seed.template, seed_ids).await?)
}

pub async fn execute(
    command: &Command,
    config: &Config,
    store: Arc<dyn DocumentStore>,
) -> Result<CommandReport, MigratorError> {
    let ids = IdGenerator::new(config.identifiers.byte_order);
    match command {
        Command::Migrate => Ok(CommandReport::Migrate {
            report: run_migrations(store, config, ids).await?,
        }),
        Command::Seed => Ok(CommandReport::Seed {
            seed: run_seed(store.as_ref(), config).await?,
        }),
        Command::Bootstrap => {
            let seed = run_seed(store.as_ref(), config).await?;
            let report = run_migrations(store, config, ids).await?;
            Ok(CommandReport::Bootstrap { seed, report })
        }
        Command::PublishDelegate {
            account_id,
            version,
        } => {
            let (account_id, version) = match (account_id, version) {
                (Some(account_id), Some(version)) => (account_id.clone(), version.clone()),
                (account_id, version) => {
                    let request = config.delegate_request()?;
                    (
                        account_id.clone().unwrap_or_else(|| request.account_id.clone()),
                        version.clone().unwrap_or_else(|| request.version.clone()),
                    )
                }
            };
            let delegate_versions =
                publish_delegate_version(store.as_ref(), &account_id, &version).await?;
            Ok(CommandReport::PublishDelegate {
                account_id,
                delegate_versions,
            })
        }
    }
}
