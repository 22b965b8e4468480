//! reflector-gc
//!
//! Finds reflector streams whose claim is gone, expired or spent and purges
//! their blobs from the object store.

use anyhow::{Context, Result};
use clap::Parser;
use common::cli::{CommonArgs, PhaseArgs, utils};
use common::snapshot;
use common::storage::create_blob_store;
use std::sync::Arc;
use sweeper::{
    ChainqueryDb, ClaimChecks, HubClient, LocalStateStore, ObjectStoreDeleter, ReflectorDb,
    SweepClients, SweepPlan, Sweeper,
};
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    phases: PhaseArgs,
}

/// Waits for a shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => log::info!("Received SIGINT"),
            _ = sigterm.recv() => log::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        log::info!("Received Ctrl+C");
    }

    Ok(())
}

fn plan_from(phases: &PhaseArgs) -> SweepPlan {
    SweepPlan {
        load_cache: phases.load_cache,
        double_check: phases.double_check,
        save: phases.save,
        resolve_blobs: phases.resolve_blobs,
        wipe: phases.wipe,
        checks: ClaimChecks {
            expired: phases.check_expired,
            spent: phases.check_spent,
        },
        limit: phases.limit,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    utils::init_logging(&cli.common);
    utils::validate_phases(&cli.phases)?;

    let config = utils::load_config(cli.common.config.as_ref())?;

    if cli.phases.wipe && config.purge.dry_run {
        tracing::warn!("purge.dry_run is enabled, no blob will be deleted");
    }

    let reflector = ReflectorDb::connect_lazy(&config.reflector.dsn)
        .context("Invalid reflector database DSN")?;
    let chainquery = ChainqueryDb::connect_lazy(&config.chainquery.dsn)
        .context("Invalid claim index database DSN")?;
    let store = LocalStateStore::open(&config.cache.dsn)
        .await
        .context("Failed to open local state store")?;
    let blob_store = create_blob_store(&config.storage).context("Failed to open blob store")?;

    let clients = SweepClients {
        source: Arc::new(reflector.clone()),
        claims: Arc::new(chainquery),
        lookup: Arc::new(HubClient::new(&config.chain)),
        deleter: Arc::new(ObjectStoreDeleter::new(blob_store)),
        store,
    };
    let sweeper = Sweeper::new(clients, &config);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let shutdown = tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => {
                log::info!("Stopping purge enqueueing, in-flight batches will complete");
                let _ = cancel_tx.send(true);
            }
            Err(e) => log::error!("Shutdown listener failed: {e}"),
        }
    });

    let imported = match &cli.phases.import_streams {
        Some(path) => Some(snapshot::load_streams(path)?),
        None => None,
    };

    let result = sweeper
        .run(&plan_from(&cli.phases), imported, cancel_rx)
        .await;
    shutdown.abort();

    let summary = sweeper.metrics().summary();
    summary.log();
    println!(
        "{} valid, {} not on chain, {} expired, {} spent, {} false negatives corrected, \
         {} blobs found, {} blobs deleted, {} purge failures",
        summary.valid,
        summary.not_on_chain,
        summary.expired,
        summary.spent,
        summary.false_negatives,
        summary.blobs_found,
        summary.blobs_deleted,
        summary.purge_failures
    );

    let report = result.context("Sweep failed")?;

    if let Some(path) = &cli.phases.export_streams {
        snapshot::save_streams(&report.records, path)?;
    }

    if cli.phases.prune_metadata {
        let removed = sweeper
            .prune_metadata(&reflector)
            .await
            .context("Failed to prune stream metadata")?;
        log::info!("Removed metadata of {removed} purged streams");
    }

    Ok(())
}
