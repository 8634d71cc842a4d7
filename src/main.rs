//! LMSR Exchange - Entry Point
//!
//! Initializes configuration, logging, the market store and the change
//! propagator. Runs until SIGINT.
//!
//! Wiring sequence:
//! 1. Load config.toml + validate
//! 2. Init tracing (JSON structured logging)
//! 3. Restore the store from the last snapshot (or start empty)
//! 4. Create seeded markets that do not exist yet
//! 5. Spawn metrics server (/metrics) and health server (/live + /ready)
//! 6. Wire the exchange (executor, settlement, reads, subscriber hub)
//! 7. Spawn ChangePropagator (change feed -> subscriber hub) and an update log
//! 8. Spawn snapshot task (periodic atomic store.json)
//! 9. Wait for SIGINT -> graceful shutdown (stop accepting -> drain -> save -> exit)
//!
//! No client transport is served here. A transport embeds the library
//! and calls the same `Exchange` this binary wires.

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use lmsr_exchange::adapters::metrics::{ExchangeMetrics, HealthServer, HealthState};
use lmsr_exchange::adapters::persistence::{MemoryStore, SnapshotStore};
use lmsr_exchange::config::{self, AppConfig};
use lmsr_exchange::domain::{Market, MarketStatus};
use lmsr_exchange::ports::store::MarketStore;
use lmsr_exchange::usecases::change_propagator::PropagatorSettings;
use lmsr_exchange::usecases::{ChangePropagator, Exchange};

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Load configuration from config.toml ──────────────
    let config = config::loader::load_config("config.toml")
        .context("Failed to load configuration")?;

    // ── 2. Initialize structured JSON logging ───────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    tracing_subscriber::EnvFilter::new(&config.service.log_level)
                }),
        )
        .json()
        .init();

    info!(
        name = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        markets = config.markets.len(),
        "Starting LMSR exchange"
    );

    // ── 3. Restore store from snapshot ──────────────────────
    let snapshots = Arc::new(
        SnapshotStore::new(&config.persistence.data_dir)
            .await
            .context("Failed to open snapshot directory")?,
    );
    let retention = config.persistence.change_retention;
    let store = Arc::new(match snapshots.load().await? {
        Some(snapshot) => MemoryStore::restore(snapshot, retention),
        None => {
            info!("No snapshot found, starting with an empty store");
            MemoryStore::with_retention(retention)
        }
    });

    // ── 4. Seed configured markets ──────────────────────────
    seed_markets(store.as_ref(), &config).await?;

    // ── 5. Shutdown channel, metrics and health ─────────────
    let (shutdown_tx, _shutdown_rx) = broadcast::channel::<()>(1);
    let metrics = Arc::new(ExchangeMetrics::new().context("Failed to register metrics")?);
    let health = Arc::new(HealthState::new());

    let metrics_handle = if config.metrics.enabled {
        let server = Arc::clone(&metrics);
        let bind_address = config.metrics.bind_address.clone();
        let shutdown = shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = server.serve(bind_address, shutdown).await {
                error!(error = %e, "Metrics server failed");
            }
        }))
    } else {
        None
    };

    let health_server = HealthServer::new(Arc::clone(&health), config.metrics.health_port);
    let health_shutdown = shutdown_tx.subscribe();
    let health_handle = tokio::spawn(async move {
        if let Err(e) = health_server.run(health_shutdown).await {
            error!(error = %e, "Health server failed");
        }
    });

    // ── 6. Wire the exchange ────────────────────────────────
    let exchange = Exchange::new(Arc::clone(&store), &config, Some(Arc::clone(&metrics)));
    let open = exchange.service.list_markets(Some(MarketStatus::Open)).await?;
    info!(open_markets = open.len(), "Markets loaded");

    // ── 7. Spawn change propagator and update log ───────────
    let propagator = ChangePropagator::new(
        Arc::clone(&store),
        Arc::clone(&exchange.hub),
        PropagatorSettings::from(&config),
    )
    .with_health_flag(Arc::clone(&health.propagator_healthy))
    .with_metrics(Arc::clone(&metrics));
    let propagator_shutdown = shutdown_tx.subscribe();
    let propagator_handle = tokio::spawn(async move {
        if let Err(e) = propagator.run(propagator_shutdown).await {
            error!(error = %e, "Change propagator stopped");
        }
    });

    let mut updates = exchange.hub.subscribe_all();
    let mut update_log_shutdown = shutdown_tx.subscribe();
    let update_log_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = update_log_shutdown.recv() => break,
                update = updates.recv() => match update {
                    Some(update) => debug!(
                        market_id = %update.market_id,
                        sequence = update.sequence,
                        status = %update.status,
                        probabilities = ?update.probabilities,
                        "Market update"
                    ),
                    None => break,
                },
            }
        }
    });

    // ── 8. Periodic snapshots ───────────────────────────────
    let snapshot_handle = {
        let store = Arc::clone(&store);
        let snapshots = Arc::clone(&snapshots);
        let period = Duration::from_secs(config.persistence.snapshot_interval_seconds);
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = snapshots.save(&store.snapshot()).await {
                            warn!(error = %e, "Periodic snapshot failed");
                        }
                    }
                }
            }
        })
    };

    info!("All tasks spawned - exchange is running");

    // ── 9. Wait for SIGINT ──────────────────────────────────
    signal::ctrl_c().await.context("Failed to listen for SIGINT")?;
    info!("SIGINT received, initiating graceful shutdown");

    // 1. Readiness probe -> 503
    health.accepting.store(false, Ordering::Relaxed);

    // 2. Signal all tasks to stop
    let _ = shutdown_tx.send(());

    // 3. Wait for background tasks (up to 5s each)
    let _ = tokio::time::timeout(Duration::from_secs(5), propagator_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), snapshot_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), update_log_handle).await;

    // 4. Final snapshot
    match snapshots.save(&store.snapshot()).await {
        Ok(()) => info!("Final snapshot saved"),
        Err(e) => error!(error = %e, "Failed to save final snapshot"),
    }

    // 5. Stop servers
    let _ = tokio::time::timeout(Duration::from_secs(5), health_handle).await;
    if let Some(handle) = metrics_handle {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }

    info!(subscribers = exchange.hub.subscriber_count(), "Shutdown complete");
    Ok(())
}

/// Create every configured market that is not already in the store.
async fn seed_markets(store: &MemoryStore, config: &AppConfig) -> Result<()> {
    for seed in &config.markets {
        if store.market(&seed.id).await?.is_some() {
            continue;
        }
        let market = Market::new(
            seed.id.clone(),
            seed.question.clone(),
            seed.outcomes.clone(),
            seed.liquidity,
        )
        .with_context(|| format!("Invalid market seed {}", seed.id))?;
        store.create_market(market).await?;
        info!(market_id = %seed.id, outcomes = seed.outcomes.len(), "Market seeded");
    }
    Ok(())
}
