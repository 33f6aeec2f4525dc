// =============================================================================
// Model training — design matrix, trinary direction label, k-fold evaluation
// =============================================================================
//
// The design matrix holds 21 scale-free base indicators per sample; the label
// is the price direction at a fixed horizon (+0.5% / -0.5% trinary).  The
// classifier is a nearest-centroid model over standardised features: small,
// deterministic, and serialisable as plain JSON.
// =============================================================================

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::indicators::{oscillators, trend, volatility, volume};
use crate::store::models::StoredModel;
use crate::types::Kline;

/// Columns of the design matrix.
pub const BASE_FEATURE_COUNT: usize = 21;
/// Bars consumed before the first sample row.
pub const WARMUP_BARS: usize = 60;
/// Minimum samples required to train.
pub const MIN_TRAINING_SAMPLES: usize = 1000;
/// Direction thresholds for the trinary label.
const LABEL_THRESHOLD: f64 = 0.005;
/// Cross-validation folds.
const CV_FOLDS: usize = 5;

/// The model families the scheduler pretrains, crossed with the watchlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelType {
    /// Direction one bar ahead.
    DirectionShort,
    /// Direction four bars ahead.
    DirectionMedium,
}

impl ModelType {
    pub const ALL: [ModelType; 2] = [ModelType::DirectionShort, ModelType::DirectionMedium];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectionShort => "direction_1",
            Self::DirectionMedium => "direction_4",
        }
    }

    pub fn horizon_bars(&self) -> usize {
        match self {
            Self::DirectionShort => 1,
            Self::DirectionMedium => 4,
        }
    }
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Design matrix
// ---------------------------------------------------------------------------

/// The 21 base indicators at the last bar of `bars`, scale-free where the
/// underlying indicator is price-denominated. `None` when any column cannot
/// be computed.
pub fn base_indicator_row(bars: &[Kline]) -> Option<[f64; BASE_FEATURE_COUNT]> {
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let close = *closes.last()?;
    if close <= 0.0 {
        return None;
    }

    let ema9 = trend::ema(&closes, 9)?;
    let ema21 = trend::ema(&closes, 21)?;
    let ema55 = trend::ema(&closes, 55)?;
    let (macd_line, macd_signal, macd_hist) = trend::macd(&closes, 12, 26, 9)?;
    let roc5 = trend::roc(&closes, 5)?;
    let roc14 = trend::roc(&closes, 14)?;
    let mom = trend::momentum(&closes, 10)?;
    let rsi = oscillators::rsi(&closes, 14)?;
    let (stoch_k, stoch_d) = oscillators::stochastic(bars, 14, 3)?;
    let williams = oscillators::williams_r(bars, 14)?;
    let cci = oscillators::cci(bars, 20)?;
    let atr_pct = volatility::atr_pct(bars, 14)?;
    let bands = volatility::bollinger(&closes, 20, 2.0)?;
    let adx = volatility::adx(bars, 14)?;
    let obv = volume::obv_slope(bars, 20)?;
    let mfi = volume::mfi(bars, 14)?;
    let vol_z = volume::volume_zscore(bars, 20)?;

    let row = [
        close / ema9 - 1.0,
        close / ema21 - 1.0,
        close / ema55 - 1.0,
        macd_line / close,
        macd_signal / close,
        macd_hist / close,
        roc5,
        roc14,
        mom / close,
        rsi,
        stoch_k,
        stoch_d,
        williams,
        cci / 100.0,
        atr_pct,
        bands.width,
        bands.percent_b,
        adx,
        obv,
        mfi,
        vol_z,
    ];

    row.iter().all(|v| v.is_finite()).then_some(row)
}

/// Trinary direction label for the move from `entry` to `exit`.
pub fn direction_label(entry: f64, exit: f64) -> i8 {
    if entry <= 0.0 {
        return 0;
    }
    let ret = exit / entry - 1.0;
    if ret > LABEL_THRESHOLD {
        1
    } else if ret < -LABEL_THRESHOLD {
        -1
    } else {
        0
    }
}

/// Build the design matrix and label vector for `horizon` bars ahead.
/// Rows whose indicator window is incomplete are skipped.
pub fn build_design_matrix(
    bars: &[Kline],
    horizon: usize,
) -> (Vec<[f64; BASE_FEATURE_COUNT]>, Vec<i8>) {
    let mut rows = Vec::new();
    let mut labels = Vec::new();

    if bars.len() <= WARMUP_BARS + horizon {
        return (rows, labels);
    }

    for t in WARMUP_BARS..bars.len() - horizon {
        if let Some(row) = base_indicator_row(&bars[..=t]) {
            rows.push(row);
            labels.push(direction_label(bars[t].close, bars[t + horizon].close));
        }
    }
    (rows, labels)
}

// ---------------------------------------------------------------------------
// Nearest-centroid classifier
// ---------------------------------------------------------------------------

/// Serialisable model parameters: per-column scaler plus one centroid per
/// observed class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentroidModel {
    pub feature_means: Vec<f64>,
    pub feature_stds: Vec<f64>,
    /// Class label (as string for JSON map keys) -> centroid.
    pub centroids: BTreeMap<String, Vec<f64>>,
}

impl CentroidModel {
    /// Fit scaler and class centroids.
    pub fn train(rows: &[[f64; BASE_FEATURE_COUNT]], labels: &[i8]) -> Result<Self> {
        if rows.is_empty() || rows.len() != labels.len() {
            anyhow::bail!(
                "degenerate training set: {} rows, {} labels",
                rows.len(),
                labels.len()
            );
        }

        let n = rows.len() as f64;
        let mut means = vec![0.0; BASE_FEATURE_COUNT];
        for row in rows {
            for (m, v) in means.iter_mut().zip(row.iter()) {
                *m += v / n;
            }
        }
        let mut stds = vec![0.0; BASE_FEATURE_COUNT];
        for row in rows {
            for ((s, v), m) in stds.iter_mut().zip(row.iter()).zip(means.iter()) {
                *s += (v - m).powi(2) / n;
            }
        }
        for s in &mut stds {
            *s = s.sqrt().max(1e-9);
        }

        let scale = |row: &[f64; BASE_FEATURE_COUNT]| -> Vec<f64> {
            row.iter()
                .zip(means.iter().zip(stds.iter()))
                .map(|(v, (m, s))| (v - m) / s)
                .collect()
        };

        let mut sums: BTreeMap<i8, (Vec<f64>, usize)> = BTreeMap::new();
        for (row, &label) in rows.iter().zip(labels) {
            let scaled = scale(row);
            let entry = sums
                .entry(label)
                .or_insert_with(|| (vec![0.0; BASE_FEATURE_COUNT], 0));
            for (acc, v) in entry.0.iter_mut().zip(scaled.iter()) {
                *acc += v;
            }
            entry.1 += 1;
        }

        let centroids = sums
            .into_iter()
            .map(|(label, (sum, count))| {
                let centroid: Vec<f64> = sum.into_iter().map(|v| v / count as f64).collect();
                (label.to_string(), centroid)
            })
            .collect();

        Ok(Self {
            feature_means: means,
            feature_stds: stds,
            centroids,
        })
    }

    /// Predict the class of one row by nearest centroid.
    pub fn predict(&self, row: &[f64; BASE_FEATURE_COUNT]) -> i8 {
        let scaled: Vec<f64> = row
            .iter()
            .zip(self.feature_means.iter().zip(self.feature_stds.iter()))
            .map(|(v, (m, s))| (v - m) / s)
            .collect();

        let mut best_label = 0i8;
        let mut best_dist = f64::INFINITY;
        for (label, centroid) in &self.centroids {
            let dist: f64 = scaled
                .iter()
                .zip(centroid.iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum();
            if dist < best_dist {
                best_dist = dist;
                best_label = label.parse().unwrap_or(0);
            }
        }
        best_label
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("failed to serialise model")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("failed to deserialise model")
    }
}

/// Deterministic k-fold cross-validation accuracy (fold = index mod k).
pub fn k_fold_accuracy(rows: &[[f64; BASE_FEATURE_COUNT]], labels: &[i8], k: usize) -> f64 {
    if rows.len() < k || k < 2 {
        return 0.0;
    }

    let mut correct = 0usize;
    let mut total = 0usize;

    for fold in 0..k {
        let mut train_rows = Vec::new();
        let mut train_labels = Vec::new();
        let mut test_rows = Vec::new();
        let mut test_labels = Vec::new();

        for (i, (row, &label)) in rows.iter().zip(labels).enumerate() {
            if i % k == fold {
                test_rows.push(*row);
                test_labels.push(label);
            } else {
                train_rows.push(*row);
                train_labels.push(label);
            }
        }

        let Ok(model) = CentroidModel::train(&train_rows, &train_labels) else {
            continue;
        };
        for (row, &label) in test_rows.iter().zip(&test_labels) {
            if model.predict(row) == label {
                correct += 1;
            }
            total += 1;
        }
    }

    if total == 0 {
        0.0
    } else {
        correct as f64 / total as f64
    }
}

// ---------------------------------------------------------------------------
// End-to-end training
// ---------------------------------------------------------------------------

/// A freshly trained model plus its evaluation metrics.
#[derive(Debug, Clone)]
pub struct TrainedModel {
    pub stored: StoredModel,
    pub accuracy: f64,
    pub samples: usize,
}

/// Train a model of `model_type` for `symbol` over `bars`.
///
/// Fails when the design matrix cannot reach [`MIN_TRAINING_SAMPLES`]; the
/// scheduler backfills extended history and retries.
pub fn train_model(
    symbol: &str,
    model_type: ModelType,
    bars: &[Kline],
    trained_at_ms: i64,
    max_age_ms: i64,
) -> Result<TrainedModel> {
    let (rows, labels) = build_design_matrix(bars, model_type.horizon_bars());
    if rows.len() < MIN_TRAINING_SAMPLES {
        anyhow::bail!(
            "insufficient training samples for {symbol}/{model_type}: {} < {MIN_TRAINING_SAMPLES}",
            rows.len()
        );
    }

    let accuracy = k_fold_accuracy(&rows, &labels, CV_FOLDS);
    let model = CentroidModel::train(&rows, &labels)?;

    let stored = StoredModel::new(
        symbol,
        model_type.as_str(),
        model.to_bytes()?,
        accuracy,
        rows.len() as u64,
        trained_at_ms,
        trained_at_ms + max_age_ms,
    );

    Ok(TrainedModel {
        stored,
        accuracy,
        samples: rows.len(),
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketKind;

    fn bar(i: usize, close: f64, volume: f64) -> Kline {
        Kline {
            symbol: "T".to_string(),
            kind: MarketKind::Futures,
            interval: "1h".to_string(),
            open_time: i as i64 * 3_600_000,
            open: close * 0.999,
            high: close * 1.004,
            low: close * 0.996,
            close,
            volume,
            quote_volume: None,
            trade_count: None,
        }
    }

    fn wavy_bars(n: usize) -> Vec<Kline> {
        (0..n)
            .map(|i| {
                let close = 100.0 + (i as f64 * 0.21).sin() * 8.0 + (i as f64 * 0.05).cos() * 3.0;
                bar(i, close, 100.0 + (i % 11) as f64 * 10.0)
            })
            .collect()
    }

    #[test]
    fn direction_label_thresholds() {
        assert_eq!(direction_label(100.0, 100.6), 1);
        assert_eq!(direction_label(100.0, 99.4), -1);
        assert_eq!(direction_label(100.0, 100.3), 0);
        assert_eq!(direction_label(100.0, 99.7), 0);
        assert_eq!(direction_label(0.0, 50.0), 0);
    }

    #[test]
    fn design_matrix_shape_and_warmup() {
        let bars = wavy_bars(200);
        let (rows, labels) = build_design_matrix(&bars, 1);
        assert_eq!(rows.len(), labels.len());
        assert!(!rows.is_empty());
        // No sample can precede the warmup window or overrun the horizon.
        assert!(rows.len() <= 200 - WARMUP_BARS - 1);
        for row in &rows {
            assert!(row.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn design_matrix_empty_on_short_history() {
        let bars = wavy_bars(30);
        let (rows, labels) = build_design_matrix(&bars, 4);
        assert!(rows.is_empty());
        assert!(labels.is_empty());
    }

    #[test]
    fn centroid_model_separates_trivial_classes() {
        // Class 1 clusters at +1 in column 0, class -1 at -1.
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for i in 0..200 {
            let mut row = [0.0; BASE_FEATURE_COUNT];
            let (value, label) = if i % 2 == 0 { (1.0, 1) } else { (-1.0, -1) };
            row[0] = value + (i as f64 * 0.001);
            rows.push(row);
            labels.push(label);
        }

        let model = CentroidModel::train(&rows, &labels).unwrap();
        let mut probe = [0.0; BASE_FEATURE_COUNT];
        probe[0] = 0.9;
        assert_eq!(model.predict(&probe), 1);
        probe[0] = -0.9;
        assert_eq!(model.predict(&probe), -1);

        let accuracy = k_fold_accuracy(&rows, &labels, 5);
        assert!(accuracy > 0.95, "separable classes should score high, got {accuracy}");
    }

    #[test]
    fn model_serde_round_trip() {
        let rows = vec![[0.5; BASE_FEATURE_COUNT], [1.5; BASE_FEATURE_COUNT]];
        let labels = vec![0, 1];
        let model = CentroidModel::train(&rows, &labels).unwrap();

        let bytes = model.to_bytes().unwrap();
        let back = CentroidModel::from_bytes(&bytes).unwrap();
        assert_eq!(model.feature_means, back.feature_means);
        assert_eq!(model.centroids, back.centroids);
    }

    #[test]
    fn train_model_enforces_minimum_samples() {
        let bars = wavy_bars(300);
        let err = train_model("BTCUSDT", ModelType::DirectionShort, &bars, 0, 1000);
        assert!(err.is_err());
    }

    #[test]
    fn train_model_end_to_end_on_long_history() {
        let bars = wavy_bars(1100);
        let trained = train_model("BTCUSDT", ModelType::DirectionShort, &bars, 100, 86_400_000)
            .unwrap();
        assert!(trained.samples >= MIN_TRAINING_SAMPLES);
        assert!((0.0..=1.0).contains(&trained.accuracy));
        assert_eq!(trained.stored.expires_at, 100 + 86_400_000);
        // Payload round-trips into a usable model.
        let model = CentroidModel::from_bytes(&trained.stored.payload).unwrap();
        assert_eq!(model.feature_means.len(), BASE_FEATURE_COUNT);
    }
}
