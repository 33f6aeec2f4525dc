// =============================================================================
// Change Detector — is this gainers list materially different from the last
// persisted one?
// =============================================================================
//
// Four comparison dimensions (rank, price, 24h-change-percent, volume) can be
// enabled independently.  The price threshold adapts to an exponentially
// smoothed market-volatility estimate, and decays multiplicatively when the
// market goes quiet so a long run of near-identical lists still eventually
// persists a fresh observation.
//
// The caller owns the clock: every entry point takes `now_ms` so decisions
// are reproducible under test.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use tracing::debug;

use crate::runtime_config::ChangeDetectionConfig;
use crate::types::{GainerItem, MarketKind};

/// Evaluations remembered for the accumulated-change band.
const RECORD_RING_LEN: usize = 10;
/// Records considered by the accumulated-change band.
const ACCUMULATION_WINDOW: usize = 3;
/// Accumulated mean-price-move that forces a save, percent.
const ACCUMULATED_PRICE_BAND_PCT: f64 = 1.0;
/// Accumulated rank moves that force a save.
const ACCUMULATED_RANK_BAND: u32 = 5;
/// Consecutive negative decisions before the threshold starts decaying.
const DECAY_AFTER_SKIPS: u32 = 5;
/// Multiplicative decay applied per additional skip.
const DECAY_FACTOR: f64 = 0.9;
/// Bounds of the adaptive price threshold, percent.
const THRESHOLD_FLOOR_PCT: f64 = 0.1;
const THRESHOLD_CEIL_PCT: f64 = 2.0;

/// One evaluation, remembered in a bounded ring.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeRecord {
    pub timestamp: i64,
    /// Mean absolute price move vs the previous list, percent.
    pub price_change: f64,
    /// Mean absolute delta of the 24h change-percent column.
    pub price_change_pct: f64,
    pub rank_changes: u32,
    /// Mean absolute volume move, percent.
    pub volume_change: f64,
    pub should_save: bool,
}

/// Deltas between two gainers lists.
#[derive(Debug, Clone, Copy, Default)]
struct ChangeMetrics {
    rank_changes: u32,
    price_move_pct: f64,
    change_pct_delta: f64,
    volume_move_pct: f64,
}

/// Decision state for one market kind.
pub struct ChangeDetector {
    kind: MarketKind,
    config: ChangeDetectionConfig,
    previous: Option<Vec<GainerItem>>,
    last_save_ms: Option<i64>,
    records: VecDeque<ChangeRecord>,
    /// EWMA of observed mean price moves.
    market_volatility: f64,
    /// Multiplicative decay applied while the market is static.
    threshold_decay: f64,
    consecutive_skips: u32,
}

impl ChangeDetector {
    pub fn new(kind: MarketKind, config: ChangeDetectionConfig) -> Self {
        Self {
            kind,
            config,
            previous: None,
            last_save_ms: None,
            records: VecDeque::with_capacity(RECORD_RING_LEN),
            market_volatility: 0.0,
            threshold_decay: 1.0,
            consecutive_skips: 0,
        }
    }

    pub fn kind(&self) -> MarketKind {
        self.kind
    }

    /// Price threshold after volatility scaling, decay, and clamping.
    pub fn adaptive_price_threshold(&self) -> f64 {
        let scale = if self.market_volatility > 2.0 {
            0.5
        } else if self.market_volatility > 1.0 {
            0.7
        } else if self.market_volatility < 0.2 {
            1.5
        } else {
            1.0
        };
        (self.config.price_threshold_pct * scale * self.threshold_decay)
            .clamp(THRESHOLD_FLOOR_PCT, THRESHOLD_CEIL_PCT)
    }

    /// Decide whether `current` is materially different from the last
    /// persisted list.  Mutates internal estimators and the record ring but
    /// NOT the previous list; call [`Self::note_saved`] after a successful
    /// persist.
    pub fn has_significant_change(&mut self, current: &[GainerItem], now_ms: i64) -> bool {
        if current.is_empty() {
            return false;
        }

        // First observation always saves.
        let Some(previous) = self.previous.clone() else {
            debug!(kind = %self.kind, "first observation — saving unconditionally");
            self.push_record(now_ms, ChangeMetrics::default(), true);
            return true;
        };

        let metrics = Self::measure(&previous, current);

        // Feed the volatility estimator before thresholding.
        self.market_volatility = 0.8 * self.market_volatility + 0.2 * metrics.price_move_pct;

        let threshold = self.adaptive_price_threshold();

        let dimension_hit = (self.config.enable_rank
            && metrics.rank_changes >= self.config.rank_threshold)
            || (self.config.enable_price && metrics.price_move_pct >= threshold)
            || (self.config.enable_price_change_percent
                && metrics.change_pct_delta >= self.config.price_change_pct_threshold)
            || (self.config.enable_volume
                && metrics.volume_move_pct >= self.config.volume_threshold_pct);

        let accumulated_hit = self.accumulated_band_exceeded(metrics);

        let since_save = self
            .last_save_ms
            .map(|t| now_ms.saturating_sub(t))
            .unwrap_or(i64::MAX);
        let forced = since_save >= (self.config.max_save_interval_secs as i64) * 1000;
        let min_gate_open = since_save >= (self.config.min_save_interval_secs as i64) * 1000;

        let should_save = (dimension_hit || accumulated_hit || forced) && min_gate_open;

        if should_save {
            self.consecutive_skips = 0;
            self.threshold_decay = 1.0;
        } else {
            self.consecutive_skips += 1;
            if self.consecutive_skips > DECAY_AFTER_SKIPS {
                self.threshold_decay *= DECAY_FACTOR;
            }
        }

        debug!(
            kind = %self.kind,
            rank_changes = metrics.rank_changes,
            price_move_pct = metrics.price_move_pct,
            change_pct_delta = metrics.change_pct_delta,
            threshold,
            dimension_hit,
            accumulated_hit,
            forced,
            min_gate_open,
            should_save,
            "change evaluation"
        );

        self.push_record(now_ms, metrics, should_save);
        should_save
    }

    /// Record a successful persist: the saved list becomes the comparison
    /// baseline and the save clock resets.
    pub fn note_saved(&mut self, saved: Vec<GainerItem>, now_ms: i64) {
        self.previous = Some(saved);
        self.last_save_ms = Some(now_ms);
    }

    /// Seed the baseline from an existing snapshot (warm start).
    pub fn seed_previous(&mut self, items: Vec<GainerItem>, saved_at_ms: i64) {
        self.previous = Some(items);
        self.last_save_ms = Some(saved_at_ms);
    }

    /// Recent evaluations, oldest first.
    pub fn records(&self) -> Vec<ChangeRecord> {
        self.records.iter().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn measure(previous: &[GainerItem], current: &[GainerItem]) -> ChangeMetrics {
        let prev_by_symbol: HashMap<&str, &GainerItem> = previous
            .iter()
            .map(|item| (item.symbol.as_str(), item))
            .collect();

        let mut rank_changes = 0u32;
        let mut price_moves = Vec::new();
        let mut change_deltas = Vec::new();
        let mut volume_moves = Vec::new();

        for item in current {
            match prev_by_symbol.get(item.symbol.as_str()) {
                Some(prev) => {
                    if prev.rank != item.rank {
                        rank_changes += 1;
                    }
                    if prev.current_price > 0.0 {
                        price_moves.push(
                            (item.current_price - prev.current_price).abs()
                                / prev.current_price
                                * 100.0,
                        );
                    }
                    change_deltas.push((item.change_percent - prev.change_percent).abs());
                    if prev.volume_24h > 0.0 {
                        volume_moves.push(
                            (item.volume_24h - prev.volume_24h).abs() / prev.volume_24h * 100.0,
                        );
                    }
                }
                // New entrants count as rank changes.
                None => rank_changes += 1,
            }
        }

        let mean = |values: &[f64]| {
            if values.is_empty() {
                0.0
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            }
        };

        ChangeMetrics {
            rank_changes,
            price_move_pct: mean(&price_moves),
            change_pct_delta: mean(&change_deltas),
            volume_move_pct: mean(&volume_moves),
        }
    }

    /// Whether the last few evaluations, taken together with the current one,
    /// add up to a move worth persisting.
    fn accumulated_band_exceeded(&self, current: ChangeMetrics) -> bool {
        let tail: Vec<&ChangeRecord> = self
            .records
            .iter()
            .rev()
            .take(ACCUMULATION_WINDOW - 1)
            .collect();

        let price_sum: f64 =
            current.price_move_pct + tail.iter().map(|r| r.price_change).sum::<f64>();
        let rank_sum: u32 = current.rank_changes + tail.iter().map(|r| r.rank_changes).sum::<u32>();

        price_sum >= ACCUMULATED_PRICE_BAND_PCT || rank_sum >= ACCUMULATED_RANK_BAND
    }

    fn push_record(&mut self, now_ms: i64, metrics: ChangeMetrics, should_save: bool) {
        self.records.push_back(ChangeRecord {
            timestamp: now_ms,
            price_change: metrics.price_move_pct,
            price_change_pct: metrics.change_pct_delta,
            rank_changes: metrics.rank_changes,
            volume_change: metrics.volume_move_pct,
            should_save,
        });
        while self.records.len() > RECORD_RING_LEN {
            self.records.pop_front();
        }
    }
}
