//! asset-relay command-line entry point.
//!
//! Loads `.env`, builds a `RunConfig` from flags and environment, and runs
//! one pipeline pass. Per-asset failures are recorded in the ledgers; the
//! process exits non-zero only on a fatal error.

mod args;

use anyhow::{Context, Result};
use args::{Cli, Command};
use asset_relay::{MigrationPipeline, PassSummary};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let env_file = check_dotenv(dotenvy::dotenv())?;

    let cli = Cli::parse();

    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    if let Some(path) = env_file {
        info!("Loaded environment from {}", path.display());
    }

    let config = cli.run_config().context("invalid record store settings")?;
    info!("asset-relay starting in {} mode", config.mode);

    match &cli.command {
        Command::Migrate(_) => {
            config.validate_for_migration()?;
            let pipeline = MigrationPipeline::builder(config).build().await?;
            let summary = pipeline.migrate().await?;
            info!(
                "Run {} finished: {} attempted, {} transferred, {} failed",
                summary.run_id,
                summary.transfer.attempted,
                summary.transfer.succeeded,
                summary.transfer.failed
            );
            info!(
                "Documents: {} found, {} updated",
                summary.docs_found, summary.docs_updated
            );
            if summary.reconcile_errors > 0 {
                warn!(
                    "{} assets could not be reconciled; run `repair` against the ledger",
                    summary.reconcile_errors
                );
            }
        }
        Command::Reconcile(_) => {
            config.validate_for_records()?;
            let ledger = config.migration_ledger.clone();
            let pipeline = MigrationPipeline::builder(config).build().await?;
            report("reconcile", pipeline.reconcile_ledger(&ledger).await?);
        }
        Command::Repair(_) => {
            config.validate_for_records()?;
            let ledger = config.migration_ledger.clone();
            let pipeline = MigrationPipeline::builder(config).build().await?;
            report("repair", pipeline.repair(&ledger).await?);
        }
        Command::Restore(_) => {
            config.validate_for_records()?;
            let ledger = config.migration_ledger.clone();
            let pipeline = MigrationPipeline::builder(config).build().await?;
            report("restore", pipeline.restore(&ledger).await?);
        }
        Command::RewriteHosts(args) => {
            config.validate_for_rewrite()?;
            let pipeline = MigrationPipeline::builder(config).build().await?;
            report(
                "rewrite-hosts",
                pipeline.rewrite_hosts(args.all_collections).await?,
            );
        }
    }

    Ok(())
}

/// A missing `.env` is fine; an unreadable or malformed one stops the run
/// before any half-applied settings are used.
fn check_dotenv(loaded: dotenvy::Result<PathBuf>) -> Result<Option<PathBuf>> {
    match loaded {
        Ok(path) => Ok(Some(path)),
        Err(e) if e.not_found() => Ok(None),
        Err(e) => Err(anyhow::Error::new(e).context("failed to load .env")),
    }
}

fn report(pass: &str, summary: PassSummary) {
    info!(
        "{} finished: {} rows considered, {} documents found, {} updated",
        pass, summary.rows_considered, summary.docs_found, summary.docs_updated
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_missing_env_file_is_ignored() {
        let missing = dotenvy::Error::Io(io::Error::new(io::ErrorKind::NotFound, "no .env"));
        assert_eq!(check_dotenv(Err(missing)).unwrap(), None);
        assert_eq!(
            check_dotenv(Ok(PathBuf::from(".env"))).unwrap(),
            Some(PathBuf::from(".env"))
        );
    }

    #[test]
    fn test_malformed_env_file_is_fatal() {
        let malformed = dotenvy::Error::LineParse("OLD_API_KEY abc".to_string(), 12);
        let err = check_dotenv(Err(malformed)).unwrap_err();
        assert!(err.to_string().contains(".env"));

        let denied = dotenvy::Error::Io(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        assert!(check_dotenv(Err(denied)).is_err());
    }
}
