// =============================================================================
// Meridian — Main Entry Point
// =============================================================================
//
// Boots the store, exchange adapter, and market-data caches, then spawns the
// long-lived loops: transport supervision, the change-gated snapshot
// pipeline, order and position reconciliation, precompute, health probing,
// retention, and the scheduler RPC surface.  Ctrl+C fans a shutdown signal
// through every loop and drains the warmup pool within a bounded deadline.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod backtest;
mod cache;
mod exchange;
mod health;
mod indicators;
mod market_data;
mod notify;
mod orders;
mod positions;
mod precompute;
mod runtime_config;
mod snapshot;
mod store;
mod strategy;
mod sync;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::notify::{Category, Notification, Priority};
use crate::runtime_config::RuntimeConfig;
use crate::types::{MarketKind, OrderStatus};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Meridian analytics backend starting up");

    let config_path =
        std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "meridian_config.json".to_string());
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config — using defaults");
        RuntimeConfig::default()
    });

    // Override the watchlist from the environment if provided.
    if let Ok(symbols) = std::env::var("MERIDIAN_SYMBOLS") {
        config.watchlist = symbols
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    info!(watchlist = ?config.watchlist, "configured symbols");

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = AppState::new(config.clone())?;
    let shutdown = state.shutdown_tx.subscribe();

    // Warm starts: detectors from the last snapshots, prices from the
    // persisted cache, models into L1.
    if let Err(e) = state.warm_start_detectors() {
        warn!(error = %e, "detector warm start failed");
    }
    match state.store.load_price_cache() {
        Ok(rows) => {
            let count = rows.len();
            for row in rows {
                state
                    .prices
                    .update(&row.symbol, row.kind, row.price, row.price_change_24h);
            }
            info!(count, "price cache warm-started from store");
        }
        Err(e) => warn!(error = %e, "price cache warm start failed"),
    }
    match state.precompute.preload() {
        Ok(count) => info!(count, "model preload complete"),
        Err(e) => warn!(error = %e, "model preload failed"),
    }

    // ── 3. Transports & precompute ───────────────────────────────────────
    state.supervisor.start();
    state.precompute.spawn_loops(shutdown.clone());
    state.health.clone().spawn_loop(shutdown.clone());

    // ── 4. Change-gated snapshot pipeline ────────────────────────────────
    for kind in [MarketKind::Spot, MarketKind::Futures] {
        let pipeline_state = state.clone();
        let mut pipeline_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let min_interval = tokio::time::Duration::from_secs(
                pipeline_state
                    .config
                    .change_detection(kind)
                    .min_save_interval_secs
                    .max(1),
            );
            loop {
                // Wake on fresh gainers data, or poll at the minimum save
                // interval so forced saves still happen on a quiet feed.
                tokio::select! {
                    _ = pipeline_state.gainers_wake.notified() => {}
                    _ = tokio::time::sleep(min_interval) => {}
                    _ = pipeline_shutdown.changed() => break,
                }
                if !pipeline_state.is_running() {
                    continue;
                }
                match pipeline_state.evaluate_gainers(kind).await {
                    Ok(Some(id)) => info!(kind = %kind, snapshot_id = id, "gainers snapshot saved"),
                    Ok(None) => {}
                    Err(e) => warn!(kind = %kind, error = %e, "gainers evaluation failed"),
                }
            }
            info!(kind = %kind, "snapshot pipeline stopped");
        });
    }

    // ── 5. Order reconciliation loop ─────────────────────────────────────
    let recon_state = state.clone();
    let mut recon_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let period = tokio::time::Duration::from_secs(
            recon_state.config.reconciler.order_sync_interval_secs,
        );
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = recon_shutdown.changed() => break,
            }
            if !recon_state.is_running() {
                continue;
            }

            let now = crate::orders::reconciler::OrderReconciler::now_ms();
            if let Err(e) = recon_state.reconciler.submit_due_orders(now).await {
                warn!(error = %e, "due-order submission failed");
            }

            match recon_state.reconciler.reconcile_local_orders().await {
                Ok(summary) => {
                    for change in &summary.changes {
                        // Importance filter: only terminal transitions reach
                        // the channels.
                        let priority = match change.new_status {
                            OrderStatus::Failed => Priority::High,
                            OrderStatus::Filled | OrderStatus::Cancelled => Priority::Normal,
                            _ => continue,
                        };
                        let notification = Notification::new(
                            format!("order {}: {}", change.symbol, change.new_status),
                            format!(
                                "order {} moved {} -> {} (qty {:.8} @ {:.2})",
                                change.order_id,
                                change.old_status,
                                change.new_status,
                                change.executed_qty,
                                change.avg_price
                            ),
                            priority,
                            Category::OrderUpdate,
                        )
                        .with_dedupe_key(format!("order:{}:{}", change.order_id, change.new_status));
                        recon_state.dispatcher.dispatch(&notification).await;
                    }
                }
                Err(e) => warn!(error = %e, "order reconciliation cycle failed"),
            }

            if let Err(e) = recon_state.reconciler.reconcile_brackets().await {
                warn!(error = %e, "bracket reconciliation failed");
            }
            if let Err(e) = recon_state.reconciler.run_maintenance() {
                warn!(error = %e, "relationship maintenance failed");
            }
        }
        info!("order reconciliation loop stopped");
    });

    // ── 6. Position diff loop ────────────────────────────────────────────
    let diff_state = state.clone();
    let mut diff_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let period = tokio::time::Duration::from_secs(
            diff_state.config.reconciler.position_detect_interval_secs,
        );
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = diff_shutdown.changed() => break,
            }
            if !diff_state.is_running() {
                continue;
            }

            let now = chrono::Utc::now().timestamp_millis();
            for op in diff_state.diff_engine.detect_cycle(now).await {
                let notification = Notification::new(
                    format!("external operation on {}", op.symbol),
                    format!(
                        "{}: {:.8} -> {:.8} (confidence {:.2})",
                        op.operation_type, op.old_amount, op.new_amount, op.confidence
                    ),
                    Priority::High,
                    Category::ExternalOperation,
                )
                .with_dedupe_key(format!("extop:{}", op.id));
                diff_state.dispatcher.dispatch(&notification).await;
            }
        }
        info!("position diff loop stopped");
    });

    // ── 7. Retention + advisory warmup loop ──────────────────────────────
    let retention_state = state.clone();
    let mut retention_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let period = tokio::time::Duration::from_secs(
            retention_state.config.cache.warmup_interval_secs.max(60),
        );
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = retention_shutdown.changed() => break,
            }

            for kind in [MarketKind::Spot, MarketKind::Futures] {
                if let Err(e) = retention_state.save_controller.run_retention(kind).await {
                    warn!(kind = %kind, error = %e, "retention pass failed");
                }
            }
            if let Err(e) = retention_state.model_cache.purge_expired(
                chrono::Utc::now().timestamp_millis(),
            ) {
                warn!(error = %e, "expired-model purge failed");
            }

            // Advisory: persist the live price cache off the foreground path.
            let store = retention_state.store.clone();
            let entries: Vec<_> = [MarketKind::Spot, MarketKind::Futures]
                .into_iter()
                .flat_map(|kind| retention_state.prices.all_for_kind(kind))
                .collect();
            retention_state.warmup_pool.submit(move || {
                if let Err(e) = store.save_price_cache(&entries) {
                    warn!(error = %e, "price cache persistence failed");
                }
            });
        }
        info!("retention loop stopped");
    });

    // ── 8. Scheduler RPC surface ─────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr = state.config.bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                info!(addr = %bind_addr, "scheduler RPC listening");
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "RPC server failed");
                }
            }
            Err(e) => error!(addr = %bind_addr, error = %e, "failed to bind RPC server"),
        }
    });

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    state.shutdown();
    state
        .warmup_pool
        .shutdown(std::time::Duration::from_secs(10))
        .await;

    if let Err(e) = config.save(&config_path) {
        warn!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("Meridian shut down complete");
    Ok(())
}
