// =============================================================================
// Runtime Configuration — Hot-reloadable settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian backend.  Every tunable lives
// here so the process can be reconfigured without a restart.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_watchlist() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "BNBUSDT".to_string(),
        "XRPUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_rank_threshold() -> u32 {
    3
}

fn default_price_threshold_pct() -> f64 {
    0.5
}

fn default_price_change_pct_threshold() -> f64 {
    0.3
}

fn default_volume_threshold_pct() -> f64 {
    10.0
}

fn default_min_save_interval_secs() -> u64 {
    30
}

fn default_max_save_interval_secs() -> u64 {
    300
}

fn default_batch_size() -> usize {
    50
}

fn default_save_timeout_secs() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_check_interval_secs() -> u64 {
    30
}

fn default_ws_grace_period_secs() -> u64 {
    120
}

fn default_rest_backoff_factor() -> f64 {
    2.0
}

fn default_l1_max_size() -> usize {
    256
}

fn default_l1_ttl_secs() -> u64 {
    600
}

fn default_l2_ttl_secs() -> u64 {
    3600
}

fn default_l3_ttl_secs() -> u64 {
    86_400
}

fn default_warmup_interval_secs() -> u64 {
    1800
}

fn default_warmup_concurrency() -> usize {
    4
}

fn default_order_sync_interval_secs() -> u64 {
    30
}

fn default_position_detect_interval_secs() -> u64 {
    15
}

fn default_max_cancel_retries() -> u32 {
    3
}

fn default_model_pretrain_interval_secs() -> u64 {
    7200
}

fn default_feature_compute_interval_secs() -> u64 {
    900
}

fn default_max_training_concurrency() -> usize {
    3
}

fn default_max_extractor_concurrency() -> usize {
    8
}

fn default_snapshot_retention_hours() -> u64 {
    72
}

fn default_max_snapshots() -> u32 {
    500
}

fn default_top_n_gainers() -> usize {
    20
}

fn default_position_ceiling() -> f64 {
    3.0
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_db_path() -> String {
    "meridian.db".to_string()
}

// =============================================================================
// Per-subsystem sections
// =============================================================================

/// Change-detection tuning for one market kind. Any subset of the four
/// comparison dimensions may be enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeDetectionConfig {
    #[serde(default = "default_true")]
    pub enable_rank: bool,

    #[serde(default = "default_true")]
    pub enable_price: bool,

    #[serde(default = "default_true")]
    pub enable_price_change_percent: bool,

    #[serde(default)]
    pub enable_volume: bool,

    /// Minimum count of rank moves that counts as significant.
    #[serde(default = "default_rank_threshold")]
    pub rank_threshold: u32,

    /// Mean absolute price move (percent) that counts as significant. This is
    /// the base value the adaptive volatility scaler operates on.
    #[serde(default = "default_price_threshold_pct")]
    pub price_threshold_pct: f64,

    /// Mean absolute 24h-change-percent delta that counts as significant.
    #[serde(default = "default_price_change_pct_threshold")]
    pub price_change_pct_threshold: f64,

    /// Mean absolute volume move (percent) that counts as significant.
    #[serde(default = "default_volume_threshold_pct")]
    pub volume_threshold_pct: f64,

    /// Floor between two persisted snapshots.
    #[serde(default = "default_min_save_interval_secs")]
    pub min_save_interval_secs: u64,

    /// Ceiling after which a save is forced regardless of deltas.
    #[serde(default = "default_max_save_interval_secs")]
    pub max_save_interval_secs: u64,
}

impl Default for ChangeDetectionConfig {
    fn default() -> Self {
        Self {
            enable_rank: true,
            enable_price: true,
            enable_price_change_percent: true,
            enable_volume: false,
            rank_threshold: default_rank_threshold(),
            price_threshold_pct: default_price_threshold_pct(),
            price_change_pct_threshold: default_price_change_pct_threshold(),
            volume_threshold_pct: default_volume_threshold_pct(),
            min_save_interval_secs: default_min_save_interval_secs(),
            max_save_interval_secs: default_max_save_interval_secs(),
        }
    }
}

/// Snapshot persistence tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveControllerConfig {
    /// Items per batch-insert chunk inside the snapshot transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_save_timeout_secs")]
    pub save_timeout_secs: u64,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Snapshots older than this are removed by the retention pass.
    #[serde(default = "default_snapshot_retention_hours")]
    pub retention_hours: u64,

    /// At most this many snapshots are kept per market kind.
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: u32,
}

impl Default for SaveControllerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            save_timeout_secs: default_save_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            retention_hours: default_snapshot_retention_hours(),
            max_snapshots: default_max_snapshots(),
        }
    }
}

/// Data-sync supervisor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Cadence of the scheduling loop that re-evaluates REST multipliers.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Minimum time REST mode persists after an unhealthy detection.
    #[serde(default = "default_ws_grace_period_secs")]
    pub websocket_grace_period_secs: u64,

    /// REST cadence multiplier while WebSocket transports are healthy.
    #[serde(default = "default_rest_backoff_factor")]
    pub rest_api_backoff_factor: f64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            websocket_grace_period_secs: default_ws_grace_period_secs(),
            rest_api_backoff_factor: default_rest_backoff_factor(),
        }
    }
}

/// Layered cache tuning (L1 in-process, L2 shared key-value, L3 durable).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub l1_enabled: bool,

    #[serde(default = "default_l1_max_size")]
    pub l1_max_size: usize,

    #[serde(default = "default_l1_ttl_secs")]
    pub l1_ttl_secs: u64,

    #[serde(default = "default_true")]
    pub l2_enabled: bool,

    #[serde(default = "default_l2_ttl_secs")]
    pub l2_ttl_secs: u64,

    #[serde(default = "default_true")]
    pub l3_enabled: bool,

    #[serde(default = "default_l3_ttl_secs")]
    pub l3_ttl_secs: u64,

    #[serde(default = "default_warmup_interval_secs")]
    pub warmup_interval_secs: u64,

    #[serde(default = "default_warmup_concurrency")]
    pub warmup_concurrency: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_enabled: true,
            l1_max_size: default_l1_max_size(),
            l1_ttl_secs: default_l1_ttl_secs(),
            l2_enabled: true,
            l2_ttl_secs: default_l2_ttl_secs(),
            l3_enabled: true,
            l3_ttl_secs: default_l3_ttl_secs(),
            warmup_interval_secs: default_warmup_interval_secs(),
            warmup_concurrency: default_warmup_concurrency(),
        }
    }
}

/// Order/position reconciliation cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    #[serde(default = "default_order_sync_interval_secs")]
    pub order_sync_interval_secs: u64,

    #[serde(default = "default_position_detect_interval_secs")]
    pub position_detect_interval_secs: u64,

    /// Attempts to cancel the surviving protective leg of a bracket.
    #[serde(default = "default_max_cancel_retries")]
    pub max_cancel_retries: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            order_sync_interval_secs: default_order_sync_interval_secs(),
            position_detect_interval_secs: default_position_detect_interval_secs(),
            max_cancel_retries: default_max_cancel_retries(),
        }
    }
}

/// Precompute scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecomputeConfig {
    #[serde(default = "default_model_pretrain_interval_secs")]
    pub model_pretrain_interval_secs: u64,

    #[serde(default = "default_feature_compute_interval_secs")]
    pub feature_compute_interval_secs: u64,

    /// Concurrent model trainings (semaphore permits).
    #[serde(default = "default_max_training_concurrency")]
    pub max_training_concurrency: usize,

    /// Concurrent feature extractors per symbol.
    #[serde(default = "default_max_extractor_concurrency")]
    pub max_extractor_concurrency: usize,
}

impl Default for PrecomputeConfig {
    fn default() -> Self {
        Self {
            model_pretrain_interval_secs: default_model_pretrain_interval_secs(),
            feature_compute_interval_secs: default_feature_compute_interval_secs(),
            max_training_concurrency: default_max_training_concurrency(),
            max_extractor_concurrency: default_max_extractor_concurrency(),
        }
    }
}

/// SMTP relay settings for the email channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub from_address: String,
}

/// SMS gateway settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmsConfig {
    #[serde(default)]
    pub gateway_url: String,
    #[serde(default)]
    pub sender_id: String,
}

/// Notification fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub smtp: SmtpConfig,

    #[serde(default)]
    pub sms: SmsConfig,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            smtp: SmtpConfig::default(),
            sms: SmsConfig::default(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Meridian backend.
///
/// Every field has a serde default so that older JSON files missing new fields
/// still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Symbols the backend watches, ranks, and precomputes artefacts for.
    #[serde(default = "default_watchlist")]
    pub watchlist: Vec<String>,

    /// Number of rows in a realtime-gainers ranking.
    #[serde(default = "default_top_n_gainers")]
    pub top_n_gainers: usize,

    /// Upper bound applied to strategy multipliers before sizing.
    #[serde(default = "default_position_ceiling")]
    pub position_ceiling: f64,

    /// Bind address for the scheduler RPC surface.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Path of the durable SQLite store.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default)]
    pub change_detection_spot: ChangeDetectionConfig,

    #[serde(default)]
    pub change_detection_futures: ChangeDetectionConfig,

    #[serde(default)]
    pub save_controller: SaveControllerConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    #[serde(default)]
    pub precompute: PrecomputeConfig,

    #[serde(default)]
    pub notification: NotificationConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            watchlist: default_watchlist(),
            top_n_gainers: default_top_n_gainers(),
            position_ceiling: default_position_ceiling(),
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            change_detection_spot: ChangeDetectionConfig::default(),
            change_detection_futures: ChangeDetectionConfig::default(),
            save_controller: SaveControllerConfig::default(),
            supervisor: SupervisorConfig::default(),
            cache: CacheConfig::default(),
            reconciler: ReconcilerConfig::default(),
            precompute: PrecomputeConfig::default(),
            notification: NotificationConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            watchlist = ?config.watchlist,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// The change-detection section for a market kind.
    pub fn change_detection(&self, kind: crate::types::MarketKind) -> &ChangeDetectionConfig {
        match kind {
            crate::types::MarketKind::Spot => &self.change_detection_spot,
            crate::types::MarketKind::Futures => &self.change_detection_futures,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketKind;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.watchlist.len(), 5);
        assert_eq!(cfg.watchlist[0], "BTCUSDT");
        assert_eq!(cfg.top_n_gainers, 20);
        assert_eq!(cfg.save_controller.batch_size, 50);
        assert_eq!(cfg.save_controller.retry_attempts, 3);
        assert_eq!(cfg.save_controller.retry_delay_ms, 1000);
        assert_eq!(cfg.supervisor.check_interval_secs, 30);
        assert_eq!(cfg.supervisor.websocket_grace_period_secs, 120);
        assert!((cfg.supervisor.rest_api_backoff_factor - 2.0).abs() < f64::EPSILON);
        assert_eq!(cfg.reconciler.order_sync_interval_secs, 30);
        assert_eq!(cfg.reconciler.position_detect_interval_secs, 15);
        assert_eq!(cfg.reconciler.max_cancel_retries, 3);
        assert_eq!(cfg.precompute.model_pretrain_interval_secs, 7200);
        assert_eq!(cfg.precompute.max_training_concurrency, 3);
        assert_eq!(cfg.cache.l3_ttl_secs, 86_400);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.watchlist.len(), 5);
        assert!(cfg.change_detection_spot.enable_rank);
        assert!(cfg.change_detection_spot.enable_price);
        assert!(!cfg.change_detection_spot.enable_volume);
        assert!(cfg.notification.enabled);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "watchlist": ["ETHUSDT"], "save_controller": { "batch_size": 10 } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.watchlist, vec!["ETHUSDT"]);
        assert_eq!(cfg.save_controller.batch_size, 10);
        assert_eq!(cfg.save_controller.retry_attempts, 3);
        assert_eq!(cfg.supervisor.check_interval_secs, 30);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.watchlist, cfg2.watchlist);
        assert_eq!(cfg.save_controller.batch_size, cfg2.save_controller.batch_size);
        assert_eq!(
            cfg.reconciler.position_detect_interval_secs,
            cfg2.reconciler.position_detect_interval_secs
        );
    }

    #[test]
    fn per_kind_change_detection_sections() {
        let json = r#"{
            "change_detection_spot": { "price_threshold_pct": 0.1 },
            "change_detection_futures": { "price_threshold_pct": 0.9 }
        }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert!((cfg.change_detection(MarketKind::Spot).price_threshold_pct - 0.1).abs() < 1e-12);
        assert!(
            (cfg.change_detection(MarketKind::Futures).price_threshold_pct - 0.9).abs() < 1e-12
        );
    }
}
