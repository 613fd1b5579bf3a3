use std::{process::ExitCode, sync::Arc};

use clap::Parser;
use db::{DBService, DocumentStore};
use migrator::{Cli, Command, CommandReport, MigratorError, ensure_seed_ids, execute};
use services::services::{
    config::{config_path, load_config_from_file, save_config_to_file},
    identifier::IdGenerator,
};
use tracing_subscriber::{EnvFilter, prelude::*};

fn init_tracing() -> Result<(), MigratorError> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter_string = format!(
        "warn,migrator={level},services={level},db={level}",
        level = log_level
    );
    let env_filter = EnvFilter::try_new(filter_string)
        .map_err(|err| anyhow::anyhow!("Failed to create tracing filter: {err}"))?;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(env_filter),
        )
        .init();
    Ok(())
}

async fn run(cli: Cli) -> Result<CommandReport, MigratorError> {
    let path = cli.config.unwrap_or_else(config_path);
    let command = cli.command.unwrap_or(Command::Migrate);

    // Seed ids go back into the file before anything is written with them;
    // env overrides are applied afterwards so they are never persisted.
    let mut config = load_config_from_file(&path).await;
    let ids = IdGenerator::new(config.identifiers.byte_order);
    if command.needs_seed_ids() && ensure_seed_ids(&mut config, &ids) {
        save_config_to_file(&config, &path).await?;
        tracing::info!(path = %path.display(), "Saved seed ids");
    }
    let config = config.with_env_overrides();

    let db = DBService::new(&config.database_url).await?;
    let store: Arc<dyn DocumentStore> = Arc::new(db.document_store());
    execute(&command, &config, store).await
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = init_tracing() {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    let report = match run(Cli::parse()).await {
        Ok(report) => report,
        Err(err) => {
            tracing::error!(error = %err, "Migrator failed");
            return ExitCode::FAILURE;
        }
    };

    match serde_json::to_string_pretty(&report) {
        Ok(rendered) => println!("{rendered}"),
        Err(err) => {
            tracing::error!(error = %err, "Failed to render report");
            return ExitCode::FAILURE;
        }
    }

    if report.has_failures() {
        tracing::warn!("Some entities could not be migrated");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
