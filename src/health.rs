// =============================================================================
// Health Checker — periodic self-probe with cooldown-gated alerts
// =============================================================================
//
// Components register named probes; the checker runs them on a fixed cadence,
// appends audit entries for failures, and raises a critical notification per
// failing probe.  The dispatcher's per-alert cooldown (30 minutes for health
// alerts) keeps a flapping dependency from spamming the channels.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::notify::{Category, Notification, NotificationDispatcher, Priority};
use crate::store::audit::LogLevel;
use crate::store::Store;

/// Health-probe cadence, seconds.
const PROBE_INTERVAL_SECS: u64 = 60;

/// One registered probe.
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self) -> Result<()>;
}

/// Adapter: any closure is a probe.
pub struct FnProbe<F> {
    name: &'static str,
    check: F,
}

impl<F> FnProbe<F>
where
    F: Fn() -> Result<()> + Send + Sync,
{
    pub fn new(name: &'static str, check: F) -> Self {
        Self { name, check }
    }
}

impl<F> HealthProbe for FnProbe<F>
where
    F: Fn() -> Result<()> + Send + Sync,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn check(&self) -> Result<()> {
        (self.check)()
    }
}

/// Result of the latest run of one probe.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeStatus {
    pub healthy: bool,
    pub error: Option<String>,
    pub checked_at_ms: i64,
}

/// Aggregated health report for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub probes: HashMap<String, ProbeStatus>,
}

/// Periodic self-probe runner.
pub struct HealthChecker {
    store: Arc<Store>,
    dispatcher: Arc<NotificationDispatcher>,
    probes: Vec<Arc<dyn HealthProbe>>,
    statuses: Mutex<HashMap<String, ProbeStatus>>,
}

impl HealthChecker {
    pub fn new(store: Arc<Store>, dispatcher: Arc<NotificationDispatcher>) -> Self {
        Self {
            store,
            dispatcher,
            probes: Vec::new(),
            statuses: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&mut self, probe: Arc<dyn HealthProbe>) {
        self.probes.push(probe);
    }

    /// Spawn the probe loop until `shutdown` flips.
    pub fn spawn_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(tokio::time::Duration::from_secs(PROBE_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = ticker.tick() => { self.run_cycle().await; }
                    _ = shutdown.changed() => break,
                }
            }
            info!("health checker stopped");
        });
    }

    /// Run every probe once.
    pub async fn run_cycle(&self) {
        let now = Utc::now().timestamp_millis();

        for probe in &self.probes {
            let name = probe.name();
            let result = probe.check();

            let status = match &result {
                Ok(()) => ProbeStatus {
                    healthy: true,
                    error: None,
                    checked_at_ms: now,
                },
                Err(e) => ProbeStatus {
                    healthy: false,
                    error: Some(e.to_string()),
                    checked_at_ms: now,
                },
            };

            let was_healthy = self
                .statuses
                .lock()
                .get(name)
                .map(|s| s.healthy)
                .unwrap_or(true);

            if let Err(e) = &result {
                warn!(probe = name, error = %e, "health probe failed");
                let _ = self.store.append_audit(
                    "health",
                    name,
                    "probe_failed",
                    Some(&json!({ "healthy": was_healthy })),
                    Some(&json!({ "error": e.to_string() })),
                    LogLevel::Critical,
                );

                let alert = Notification::new(
                    format!("dependency unhealthy: {name}"),
                    e.to_string(),
                    Priority::High,
                    Category::HealthAlert,
                )
                .with_dedupe_key(format!("health:{name}"));
                self.dispatcher.dispatch(&alert).await;
            } else if !was_healthy {
                info!(probe = name, "health probe recovered");
                let _ = self.store.append_audit(
                    "health",
                    name,
                    "probe_recovered",
                    None,
                    None,
                    LogLevel::Info,
                );
            }

            self.statuses.lock().insert(name.to_string(), status);
        }
    }

    pub fn report(&self) -> HealthReport {
        let probes = self.statuses.lock().clone();
        HealthReport {
            healthy: probes.values().all(|s| s.healthy),
            probes,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn checker() -> HealthChecker {
        let store = Arc::new(Store::open_in_memory().unwrap());
        // 30-minute cooldown, no sinks needed for these tests.
        let dispatcher = Arc::new(NotificationDispatcher::new(true, 1_800_000, vec![]));
        HealthChecker::new(store, dispatcher)
    }

    #[tokio::test]
    async fn passing_probes_report_healthy() {
        let mut checker = checker();
        checker.register(Arc::new(FnProbe::new("store", || Ok(()))));
        checker.run_cycle().await;

        let report = checker.report();
        assert!(report.healthy);
        assert!(report.probes.get("store").unwrap().healthy);
    }

    #[tokio::test]
    async fn failing_probe_marks_unhealthy_and_audits() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let dispatcher = Arc::new(NotificationDispatcher::new(true, 1_800_000, vec![]));
        let mut checker = HealthChecker::new(store.clone(), dispatcher);
        checker.register(Arc::new(FnProbe::new("cache", || {
            anyhow::bail!("connection refused")
        })));

        checker.run_cycle().await;
        let report = checker.report();
        assert!(!report.healthy);
        assert_eq!(
            report.probes.get("cache").unwrap().error.as_deref(),
            Some("connection refused")
        );

        // The failure landed in the audit trail at critical level.
        let audit = store.recent_audit_entries(10).unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].entity_type, "health");
        assert_eq!(audit[0].entity_id, "cache");
        assert_eq!(audit[0].action, "probe_failed");
        assert_eq!(audit[0].level, "critical");
        // Probe failures are audit entries, not operation-log rows.
        assert!(store.recent_operation_logs(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn recovery_flips_back_to_healthy() {
        let healthy = Arc::new(AtomicBool::new(false));
        let flag = healthy.clone();

        let mut checker = checker();
        checker.register(Arc::new(FnProbe::new("flaky", move || {
            if flag.load(Ordering::Relaxed) {
                Ok(())
            } else {
                anyhow::bail!("down")
            }
        })));

        checker.run_cycle().await;
        assert!(!checker.report().healthy);

        healthy.store(true, Ordering::Relaxed);
        checker.run_cycle().await;
        assert!(checker.report().healthy);
    }
}
