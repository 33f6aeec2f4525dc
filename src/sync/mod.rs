// =============================================================================
// Data sync — transport health, per-kind workers, and the supervisor
// =============================================================================

pub mod supervisor;
pub mod workers;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

use chrono::Utc;
use serde::Serialize;

/// What a sync worker keeps data flowing for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
    Price,
    Kline,
    Depth,
    Gainers,
}

impl SyncKind {
    pub const ALL: [SyncKind; 4] = [
        SyncKind::Price,
        SyncKind::Kline,
        SyncKind::Depth,
        SyncKind::Gainers,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::Kline => "kline",
            Self::Depth => "depth",
            Self::Gainers => "gainers",
        }
    }

    /// Base REST polling cadence for this kind, seconds.
    pub fn base_rest_interval_secs(&self) -> u64 {
        match self {
            Self::Price => 5,
            Self::Kline => 30,
            Self::Depth => 10,
            Self::Gainers => 15,
        }
    }
}

impl std::fmt::Display for SyncKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free health record shared between a WebSocket consumer task and the
/// supervisor's health loop.
pub struct TransportHealth {
    is_running: AtomicBool,
    /// Milliseconds since epoch of the last successfully handled frame.
    last_message_ms: AtomicI64,
    consecutive_failures: AtomicU32,
}

/// A WebSocket is considered stale after this long without a frame.
const STALE_AFTER_MS: i64 = 60_000;

impl TransportHealth {
    pub fn new() -> Self {
        Self {
            is_running: AtomicBool::new(false),
            last_message_ms: AtomicI64::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn mark_running(&self, running: bool) {
        self.is_running.store(running, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    /// Stamp a successfully handled frame and clear the failure streak.
    pub fn note_message(&self) {
        self.last_message_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn note_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn last_message_ms(&self) -> i64 {
        self.last_message_ms.load(Ordering::Relaxed)
    }

    /// Running, recently fed, and not failing repeatedly.
    pub fn is_healthy(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        if self.consecutive_failures() >= 3 {
            return false;
        }
        let last = self.last_message_ms();
        last > 0 && Utc::now().timestamp_millis() - last < STALE_AFTER_MS
    }
}

impl Default for TransportHealth {
    fn default() -> Self {
        Self::new()
    }
}
