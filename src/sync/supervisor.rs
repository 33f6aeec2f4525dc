// =============================================================================
// Data Sync Supervisor — transport promotion/demotion with a grace period
// =============================================================================
//
// Health loop (10s): each WebSocket worker reports isRunning && isHealthy.
// A healthy -> unhealthy transition enters REST mode immediately; the way
// back requires the grace period to have elapsed AND thirty seconds of
// stable health.  The scheduling loop (check interval) pushes REST cadence
// multipliers to the workers: 1.0 in REST mode, the backoff factor while
// WebSockets carry the load.
//
// Transport errors adjust health state, never kill the supervisor.  When
// both transports fail at once a critical alert fires and reconnection
// keeps being attempted.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::notify::{Category, Notification, NotificationDispatcher, Priority};
use crate::runtime_config::SupervisorConfig;

use super::workers::{SyncWorker, WorkerContext};
use super::SyncKind;

/// Health-loop cadence.
const HEALTH_TICK_SECS: u64 = 10;
/// Stable-health window required before returning to WebSocket mode.
const STABILISATION_MS: i64 = 30_000;
/// Consecutive REST failures that, with WebSockets down, mean both
/// transports are failing.
const REST_FAILURE_ALARM: u64 = 3;

/// A transport mode change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSwitch {
    ToRest,
    ToWebSocket,
}

/// Pure mode-transition state machine; the supervisor feeds it health
/// observations with explicit timestamps.
#[derive(Debug, Clone)]
pub struct TransportPolicy {
    rest_mode: bool,
    entered_rest_at_ms: Option<i64>,
    healthy_since_ms: Option<i64>,
    grace_period_ms: i64,
    pub fallback_count: u64,
    pub last_mode_switch_ms: Option<i64>,
}

impl TransportPolicy {
    pub fn new(grace_period_ms: i64) -> Self {
        Self {
            rest_mode: false,
            entered_rest_at_ms: None,
            healthy_since_ms: None,
            grace_period_ms,
            fallback_count: 0,
            last_mode_switch_ms: None,
        }
    }

    pub fn rest_mode(&self) -> bool {
        self.rest_mode
    }

    /// Feed one aggregated health observation; returns a switch if the mode
    /// changed.
    pub fn observe(&mut self, websocket_healthy: bool, now_ms: i64) -> Option<ModeSwitch> {
        if websocket_healthy {
            if self.healthy_since_ms.is_none() {
                self.healthy_since_ms = Some(now_ms);
            }
        } else {
            self.healthy_since_ms = None;
        }

        if !self.rest_mode {
            if !websocket_healthy {
                // Demote immediately.
                self.rest_mode = true;
                self.entered_rest_at_ms = Some(now_ms);
                self.fallback_count += 1;
                self.last_mode_switch_ms = Some(now_ms);
                return Some(ModeSwitch::ToRest);
            }
            return None;
        }

        // In REST mode: promotion needs the grace period served AND the
        // stabilisation window of continuous health.
        if !websocket_healthy {
            return None;
        }
        let grace_served = self
            .entered_rest_at_ms
            .is_some_and(|t| now_ms - t >= self.grace_period_ms);
        let stable = self
            .healthy_since_ms
            .is_some_and(|t| now_ms - t >= STABILISATION_MS);

        if grace_served && stable {
            self.rest_mode = false;
            self.entered_rest_at_ms = None;
            self.last_mode_switch_ms = Some(now_ms);
            return Some(ModeSwitch::ToWebSocket);
        }
        None
    }
}

/// Per-worker snapshot inside [`SyncStats`].
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub running: bool,
    pub healthy: bool,
    pub last_message_ms: i64,
    pub consecutive_failures: u32,
    pub rest_multiplier: f64,
}

/// Read-only snapshot of supervisor state. Mutation stays inside the owner.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStats {
    pub websocket_healthy: bool,
    pub rest_api_mode: bool,
    pub rest_api_fallback_count: u64,
    pub last_mode_switch_ms: Option<i64>,
    pub workers: HashMap<SyncKind, WorkerStats>,
}

/// Owns the four sync workers and the two supervisor loops.
pub struct SyncSupervisor {
    config: SupervisorConfig,
    context: Arc<WorkerContext>,
    workers: HashMap<SyncKind, Arc<SyncWorker>>,
    policy: Mutex<TransportPolicy>,
    dispatcher: Arc<NotificationDispatcher>,
    shutdown_tx: watch::Sender<bool>,
}

impl SyncSupervisor {
    pub fn new(
        config: SupervisorConfig,
        context: Arc<WorkerContext>,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Self {
        let workers = SyncKind::ALL
            .into_iter()
            .map(|kind| (kind, Arc::new(SyncWorker::new(kind))))
            .collect();
        let grace_ms = (config.websocket_grace_period_secs as i64) * 1000;
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            context,
            workers,
            policy: Mutex::new(TransportPolicy::new(grace_ms)),
            dispatcher,
            shutdown_tx,
        }
    }

    /// Launch every worker transport plus the health and scheduling loops.
    pub fn start(self: &Arc<Self>) {
        let shutdown = self.shutdown_tx.subscribe();

        for worker in self.workers.values() {
            worker.spawn_ws(self.context.clone(), shutdown.clone());
            worker.spawn_rest(self.context.clone(), shutdown.clone());
        }

        // Health loop.
        let supervisor = self.clone();
        let mut health_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(tokio::time::Duration::from_secs(HEALTH_TICK_SECS));
            loop {
                tokio::select! {
                    _ = ticker.tick() => supervisor.health_tick().await,
                    _ = health_shutdown.changed() => break,
                }
            }
            info!("supervisor health loop stopped");
        });

        // Scheduling loop.
        let supervisor = self.clone();
        let mut sched_shutdown = shutdown;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tokio::time::Duration::from_secs(
                supervisor.config.check_interval_secs,
            ));
            loop {
                tokio::select! {
                    _ = ticker.tick() => supervisor.scheduling_tick(),
                    _ = sched_shutdown.changed() => break,
                }
            }
            info!("supervisor scheduling loop stopped");
        });

        info!("data sync supervisor started");
    }

    /// Signal every loop and worker to stop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        info!("data sync supervisor stopping");
    }

    /// One health evaluation: aggregate worker health, drive the policy,
    /// and alert when both transports are failing.
    pub async fn health_tick(&self) {
        let now = Utc::now().timestamp_millis();
        let ws_healthy = self
            .workers
            .values()
            .all(|w| w.health.is_running() && w.health.is_healthy());

        let switch = self.policy.lock().observe(ws_healthy, now);
        match switch {
            Some(ModeSwitch::ToRest) => {
                warn!("WebSocket transports unhealthy — switching to REST mode");
                self.apply_multipliers(1.0);
            }
            Some(ModeSwitch::ToWebSocket) => {
                info!("WebSocket transports stable again — REST demoted to safety net");
                self.apply_multipliers(self.config.rest_api_backoff_factor);
            }
            None => {}
        }

        // Both transports failing: never drop data silently.
        let rest_failing = self
            .workers
            .values()
            .any(|w| w.rest_failures.load(std::sync::atomic::Ordering::Relaxed) >= REST_FAILURE_ALARM);
        if !ws_healthy && rest_failing {
            error!("both WebSocket and REST transports are failing — continuing reconnect attempts");
            let alert = Notification::new(
                "market data transports down",
                "WebSocket and REST paths are both failing; reconnection continues",
                Priority::Urgent,
                Category::HealthAlert,
            )
            .with_dedupe_key("sync:both-transports-down");
            self.dispatcher.dispatch(&alert).await;
        }
    }

    /// One scheduling evaluation: push the policy's cadence to the workers.
    pub fn scheduling_tick(&self) {
        let multiplier = if self.policy.lock().rest_mode() {
            1.0
        } else {
            self.config.rest_api_backoff_factor
        };
        self.apply_multipliers(multiplier);
    }

    fn apply_multipliers(&self, multiplier: f64) {
        for worker in self.workers.values() {
            worker.set_rest_multiplier(multiplier);
        }
    }

    /// Read-only stats snapshot.
    pub fn stats(&self) -> SyncStats {
        let policy = self.policy.lock();
        let workers = self
            .workers
            .iter()
            .map(|(kind, w)| {
                (
                    *kind,
                    WorkerStats {
                        running: w.health.is_running(),
                        healthy: w.health.is_healthy(),
                        last_message_ms: w.health.last_message_ms(),
                        consecutive_failures: w.health.consecutive_failures(),
                        rest_multiplier: w.rest_multiplier(),
                    },
                )
            })
            .collect();

        SyncStats {
            websocket_healthy: !policy.rest_mode(),
            rest_api_mode: policy.rest_mode(),
            rest_api_fallback_count: policy.fallback_count,
            last_mode_switch_ms: policy.last_mode_switch_ms,
            workers,
        }
    }

    pub fn worker(&self, kind: SyncKind) -> Option<&Arc<SyncWorker>> {
        self.workers.get(&kind)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const GRACE_MS: i64 = 120_000;

    #[test]
    fn healthy_start_stays_in_websocket_mode() {
        let mut policy = TransportPolicy::new(GRACE_MS);
        assert_eq!(policy.observe(true, 0), None);
        assert_eq!(policy.observe(true, 10_000), None);
        assert!(!policy.rest_mode());
        assert_eq!(policy.fallback_count, 0);
    }

    #[test]
    fn unhealthy_demotes_within_one_observation() {
        let mut policy = TransportPolicy::new(GRACE_MS);
        policy.observe(true, 0);

        assert_eq!(policy.observe(false, 10_000), Some(ModeSwitch::ToRest));
        assert!(policy.rest_mode());
        assert_eq!(policy.fallback_count, 1);
        assert_eq!(policy.last_mode_switch_ms, Some(10_000));
    }

    #[test]
    fn promotion_waits_for_grace_and_stabilisation() {
        let mut policy = TransportPolicy::new(GRACE_MS);
        policy.observe(false, 0);
        assert!(policy.rest_mode());

        // Healthy again right away, but the grace period has not been served.
        assert_eq!(policy.observe(true, 10_000), None);
        assert_eq!(policy.observe(true, 60_000), None);

        // Grace served at 120s, health stable since 10s: promoted.
        assert_eq!(policy.observe(true, 121_000), Some(ModeSwitch::ToWebSocket));
        assert!(!policy.rest_mode());
    }

    #[test]
    fn stabilisation_window_restarts_on_flap() {
        let mut policy = TransportPolicy::new(GRACE_MS);
        policy.observe(false, 0);

        policy.observe(true, 100_000);
        // A flap resets the stable-health clock.
        policy.observe(false, 110_000);
        policy.observe(true, 125_000);

        // Grace served long ago, but health has only been stable 10s.
        assert_eq!(policy.observe(true, 135_000), None);
        // 30s of stability reached.
        assert_eq!(policy.observe(true, 155_000), Some(ModeSwitch::ToWebSocket));
    }

    #[test]
    fn repeated_failures_count_fallbacks() {
        let mut policy = TransportPolicy::new(1000);
        policy.observe(false, 0);
        policy.observe(true, 1_000);
        assert_eq!(policy.observe(true, 31_000), Some(ModeSwitch::ToWebSocket));
        assert_eq!(policy.observe(false, 40_000), Some(ModeSwitch::ToRest));
        assert_eq!(policy.fallback_count, 2);
    }

    #[tokio::test]
    async fn mode_switches_flip_worker_multipliers() {
        use crate::exchange::testing::MockExchange;
        use crate::market_data::{CandleBuffer, DepthBook, PriceCache, TickerBoard};
        use crate::notify::NotificationDispatcher;
        use crate::store::Store;
        use crate::sync::workers::WorkerContext;
        use crate::types::MarketKind;
        use tokio::sync::Notify;

        let context = Arc::new(WorkerContext {
            exchange: Arc::new(MockExchange::new()),
            store: Arc::new(Store::open_in_memory().unwrap()),
            prices: Arc::new(PriceCache::new()),
            candles: Arc::new(CandleBuffer::new(10)),
            depth: Arc::new(DepthBook::new()),
            board: Arc::new(TickerBoard::new(MarketKind::Futures)),
            spot_board: Arc::new(TickerBoard::new(MarketKind::Spot)),
            gainers_wake: Arc::new(Notify::new()),
            kind: MarketKind::Futures,
            watchlist: vec![],
        });
        let dispatcher = Arc::new(NotificationDispatcher::new(true, 0, vec![]));
        let supervisor = SyncSupervisor::new(SupervisorConfig::default(), context, dispatcher);

        // Simulate the healthy steady state: REST as a slow safety net.
        for kind in SyncKind::ALL {
            supervisor.worker(kind).unwrap().set_rest_multiplier(2.0);
        }

        // Workers are never fed here, so the first tick demotes to REST and
        // the cadence multiplier drops to 1.0.
        supervisor.health_tick().await;
        let stats = supervisor.stats();
        assert!(stats.rest_api_mode);
        assert_eq!(stats.rest_api_fallback_count, 1);
        for worker in stats.workers.values() {
            assert!((worker.rest_multiplier - 1.0).abs() < 1e-12);
        }

        // The scheduling loop keeps pushing the REST-mode cadence.
        supervisor.scheduling_tick();
        for worker in supervisor.stats().workers.values() {
            assert!((worker.rest_multiplier - 1.0).abs() < 1e-12);
        }
    }
}
