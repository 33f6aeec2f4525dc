// =============================================================================
// Feature extraction — bounded fan-out over a closed set of extractors
// =============================================================================
//
// Each extractor turns a kline history into a `{name -> f64}` map.  The
// supervisor runs them concurrently under a semaphore, validates every value
// (finite, then range-checked by the type inferred from its name), discards
// offenders, and materialises a feature set from the survivors.  A failed
// extractor is logged and skipped; it never sinks the whole set.
//
// Extraction is a pure function of the input history: identical bars produce
// identical feature sets after the same validation filter.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::indicators::{oscillators, trend, volatility, volume};
use crate::types::Kline;

/// Quality-model weights. Each sub-metric lies in [0, 1]; the blend does too.
const W_COMPLETENESS: f64 = 0.25;
const W_CONSISTENCY: f64 = 0.15;
const W_RELIABILITY: f64 = 0.20;
const W_PREDICTIVE: f64 = 0.15;
const W_STABILITY: f64 = 0.10;
const W_DIVERSITY: f64 = 0.10;
const W_ROBUSTNESS: f64 = 0.05;

/// The value domain a feature is validated against, inferred from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureType {
    Price,
    Volume,
    Ratio,
    Oscillator,
    NegativeOscillator,
    ZScore,
    Unbounded,
}

impl FeatureType {
    /// Infer the type from a feature name.
    pub fn infer(name: &str) -> Self {
        if name.contains("zscore") {
            Self::ZScore
        } else if name.contains("williams") {
            Self::NegativeOscillator
        } else if name.contains("rsi") || name.contains("stoch") || name.contains("mfi") {
            Self::Oscillator
        } else if name.contains("price") || name.starts_with("ema") {
            Self::Price
        } else if name.contains("volume") || name.contains("obv") {
            Self::Volume
        } else if name.contains("ratio")
            || name.contains("pct")
            || name.contains("width")
            || name.contains("slope")
            || name.contains("percent")
        {
            Self::Ratio
        } else {
            Self::Unbounded
        }
    }

    /// Whether `value` lies in this type's plausible domain.
    pub fn accepts(&self, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        match self {
            Self::Price => value > 0.0,
            Self::Volume => value >= -1.0, // obv slope is volume-typed but signed
            Self::Ratio => value.abs() <= 1000.0,
            Self::Oscillator => (0.0..=100.0).contains(&value),
            Self::NegativeOscillator => (-100.0..=0.0).contains(&value),
            Self::ZScore => value.abs() <= 10.0,
            Self::Unbounded => true,
        }
    }
}

/// One extractor of the closed set.
pub trait FeatureExtractor: Send + Sync {
    fn name(&self) -> &'static str;
    /// Features this extractor is expected to emit when data suffices.
    fn expected(&self) -> usize;
    fn extract(&self, bars: &[Kline]) -> Result<BTreeMap<String, f64>>;
}

// ---------------------------------------------------------------------------
// Concrete extractors
// ---------------------------------------------------------------------------

struct TrendExtractor;

impl FeatureExtractor for TrendExtractor {
    fn name(&self) -> &'static str {
        "trend"
    }

    fn expected(&self) -> usize {
        7
    }

    fn extract(&self, bars: &[Kline]) -> Result<BTreeMap<String, f64>> {
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let mut out = BTreeMap::new();

        if let Some(v) = trend::ema(&closes, 9) {
            out.insert("ema_9".to_string(), v);
        }
        if let Some(v) = trend::ema(&closes, 21) {
            out.insert("ema_21".to_string(), v);
        }
        if let Some(v) = trend::ema(&closes, 55) {
            out.insert("ema_55".to_string(), v);
        }
        if let Some((line, signal, histogram)) = trend::macd(&closes, 12, 26, 9) {
            out.insert("macd_line".to_string(), line);
            out.insert("macd_signal".to_string(), signal);
            out.insert("macd_histogram".to_string(), histogram);
        }
        if let Some(v) = trend::roc(&closes, 14) {
            out.insert("roc_14_pct".to_string(), v);
        }
        Ok(out)
    }
}

struct OscillatorExtractor;

impl FeatureExtractor for OscillatorExtractor {
    fn name(&self) -> &'static str {
        "oscillators"
    }

    fn expected(&self) -> usize {
        5
    }

    fn extract(&self, bars: &[Kline]) -> Result<BTreeMap<String, f64>> {
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let mut out = BTreeMap::new();

        if let Some(v) = oscillators::rsi(&closes, 14) {
            out.insert("rsi_14".to_string(), v);
        }
        if let Some((k, d)) = oscillators::stochastic(bars, 14, 3) {
            out.insert("stoch_k".to_string(), k);
            out.insert("stoch_d".to_string(), d);
        }
        if let Some(v) = oscillators::williams_r(bars, 14) {
            out.insert("williams_r".to_string(), v);
        }
        if let Some(v) = oscillators::cci(bars, 20) {
            out.insert("cci_20".to_string(), v);
        }
        Ok(out)
    }
}

struct VolatilityExtractor;

impl FeatureExtractor for VolatilityExtractor {
    fn name(&self) -> &'static str {
        "volatility"
    }

    fn expected(&self) -> usize {
        4
    }

    fn extract(&self, bars: &[Kline]) -> Result<BTreeMap<String, f64>> {
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let mut out = BTreeMap::new();

        if let Some(v) = volatility::atr_pct(bars, 14) {
            out.insert("atr_14_pct".to_string(), v);
        }
        if let Some(bands) = volatility::bollinger(&closes, 20, 2.0) {
            out.insert("bb_width".to_string(), bands.width);
            out.insert("bb_percent_b".to_string(), bands.percent_b);
        }
        if let Some(v) = volatility::adx(bars, 14) {
            out.insert("adx_14".to_string(), v);
        }
        Ok(out)
    }
}

struct VolumeExtractor;

impl FeatureExtractor for VolumeExtractor {
    fn name(&self) -> &'static str {
        "volume"
    }

    fn expected(&self) -> usize {
        3
    }

    fn extract(&self, bars: &[Kline]) -> Result<BTreeMap<String, f64>> {
        let mut out = BTreeMap::new();
        if let Some(v) = volume::obv_slope(bars, 20) {
            out.insert("obv_slope".to_string(), v);
        }
        if let Some(v) = volume::mfi(bars, 14) {
            out.insert("mfi_14".to_string(), v);
        }
        if let Some(v) = volume::volume_zscore(bars, 20) {
            out.insert("volume_zscore".to_string(), v);
        }
        Ok(out)
    }
}

/// The closed extractor set.
pub fn default_extractors() -> Vec<Arc<dyn FeatureExtractor>> {
    vec![
        Arc::new(TrendExtractor),
        Arc::new(OscillatorExtractor),
        Arc::new(VolatilityExtractor),
        Arc::new(VolumeExtractor),
    ]
}

// ---------------------------------------------------------------------------
// Quality model
// ---------------------------------------------------------------------------

/// Sub-metrics of the aggregate quality score, each in [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityScore {
    pub completeness: f64,
    pub consistency: f64,
    pub reliability: f64,
    pub predictive_power: f64,
    pub stability: f64,
    pub diversity: f64,
    pub robustness: f64,
    pub overall: f64,
}

/// A materialised feature set for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSet {
    pub symbol: String,
    pub features: BTreeMap<String, f64>,
    pub quality: QualityScore,
    pub computed_at_ms: i64,
}

/// Runs the extractor fan-out and owns validation + quality scoring.
pub struct FeatureSupervisor {
    extractors: Vec<Arc<dyn FeatureExtractor>>,
    semaphore: Arc<Semaphore>,
}

impl FeatureSupervisor {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            extractors: default_extractors(),
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    /// Extract, validate, and score a feature set for `symbol`.
    pub async fn extract(
        &self,
        symbol: &str,
        bars: Arc<Vec<Kline>>,
        now_ms: i64,
    ) -> FeatureSet {
        let mut handles = Vec::with_capacity(self.extractors.len());

        for extractor in &self.extractors {
            let extractor = extractor.clone();
            let semaphore = self.semaphore.clone();
            let bars = bars.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("feature semaphore closed");
                let name = extractor.name();
                let expected = extractor.expected();
                (name, expected, extractor.extract(&bars))
            }));
        }

        let mut features = BTreeMap::new();
        let mut expected_total = 0usize;
        let mut produced_total = 0usize;
        let mut extractor_count = 0usize;
        let mut extractor_failures = 0usize;
        let mut contributing_families = 0usize;

        for handle in handles {
            let Ok((name, expected, result)) = handle.await else {
                extractor_failures += 1;
                extractor_count += 1;
                continue;
            };
            extractor_count += 1;
            expected_total += expected;

            match result {
                Ok(map) => {
                    produced_total += map.len();
                    let mut contributed = false;
                    for (feature, value) in map {
                        let ftype = FeatureType::infer(&feature);
                        if ftype.accepts(value) {
                            features.insert(feature, value);
                            contributed = true;
                        } else {
                            debug!(
                                extractor = name,
                                feature = %feature,
                                value,
                                "feature rejected by range validation"
                            );
                        }
                    }
                    if contributed {
                        contributing_families += 1;
                    }
                }
                Err(e) => {
                    extractor_failures += 1;
                    warn!(extractor = name, error = %e, "feature extractor failed — skipped");
                }
            }
        }

        let quality = Self::score(
            features.len(),
            expected_total,
            produced_total,
            extractor_count,
            extractor_failures,
            contributing_families,
            &features,
        );

        FeatureSet {
            symbol: symbol.to_string(),
            features,
            quality,
            computed_at_ms: now_ms,
        }
    }

    /// Blend the seven sub-metrics into the aggregate quality score.
    fn score(
        valid: usize,
        expected: usize,
        produced: usize,
        extractors: usize,
        failures: usize,
        contributing_families: usize,
        features: &BTreeMap<String, f64>,
    ) -> QualityScore {
        let ratio = |num: usize, den: usize| {
            if den == 0 {
                0.0
            } else {
                (num as f64 / den as f64).clamp(0.0, 1.0)
            }
        };

        let completeness = ratio(valid, expected);
        let consistency = ratio(valid, produced.max(1));
        let reliability = ratio(extractors.saturating_sub(failures), extractors);
        let diversity = ratio(contributing_families, extractors);

        // Predictive power: share of bounded features that carry signal,
        // i.e. sit away from their neutral resting value.
        let informative = features
            .iter()
            .filter(|(name, value)| match FeatureType::infer(name) {
                FeatureType::Oscillator => (*value - 50.0).abs() > 5.0,
                FeatureType::NegativeOscillator => (*value + 50.0).abs() > 5.0,
                FeatureType::ZScore => value.abs() > 0.25,
                FeatureType::Ratio => value.abs() > 1e-6,
                _ => true,
            })
            .count();
        let predictive_power = ratio(informative, valid.max(1));

        // Stability: oscillator-typed features pinned at a hard bound read as
        // saturated, which degrades stability.
        let saturated = features
            .iter()
            .filter(|(name, value)| match FeatureType::infer(name) {
                FeatureType::Oscillator => **value <= 0.5 || **value >= 99.5,
                FeatureType::NegativeOscillator => **value >= -0.5 || **value <= -99.5,
                _ => false,
            })
            .count();
        let stability = (1.0 - ratio(saturated, valid.max(1))).clamp(0.0, 1.0);

        // Robustness: survived validation without any rejections.
        let robustness = ratio(valid, produced.max(valid).max(1));

        let overall = (W_COMPLETENESS * completeness
            + W_CONSISTENCY * consistency
            + W_RELIABILITY * reliability
            + W_PREDICTIVE * predictive_power
            + W_STABILITY * stability
            + W_DIVERSITY * diversity
            + W_ROBUSTNESS * robustness)
            .clamp(0.0, 1.0);

        QualityScore {
            completeness,
            consistency,
            reliability,
            predictive_power,
            stability,
            diversity,
            robustness,
            overall,
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

    fn bars(n: usize) -> Vec<Kline> {
        (0..n)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.3).sin() * 5.0 + i as f64 * 0.05;
                Kline {
                    symbol: "BTCUSDT".to_string(),
                    kind: MarketKind::Futures,
                    interval: "1h".to_string(),
                    open_time: i as i64 * 3_600_000,
                    open: base - 0.2,
                    high: base + 1.5,
                    low: base - 1.5,
                    close: base,
                    volume: 100.0 + (i % 7) as f64 * 10.0,
                    quote_volume: None,
                    trade_count: None,
                }
            })
            .collect()
    }

    #[test]
    fn feature_type_inference() {
        assert_eq!(FeatureType::infer("rsi_14"), FeatureType::Oscillator);
        assert_eq!(FeatureType::infer("williams_r"), FeatureType::NegativeOscillator);
        assert_eq!(FeatureType::infer("volume_zscore"), FeatureType::ZScore);
        assert_eq!(FeatureType::infer("ema_21"), FeatureType::Price);
        assert_eq!(FeatureType::infer("atr_14_pct"), FeatureType::Ratio);
        assert_eq!(FeatureType::infer("obv_slope"), FeatureType::Volume);
        assert_eq!(FeatureType::infer("macd_line"), FeatureType::Unbounded);
    }

    #[test]
    fn range_validation_rejects_offenders() {
        assert!(!FeatureType::Oscillator.accepts(150.0));
        assert!(!FeatureType::Oscillator.accepts(f64::NAN));
        assert!(FeatureType::Oscillator.accepts(50.0));
        assert!(!FeatureType::Price.accepts(-1.0));
        assert!(!FeatureType::ZScore.accepts(50.0));
        assert!(FeatureType::NegativeOscillator.accepts(-50.0));
        assert!(!FeatureType::NegativeOscillator.accepts(10.0));
    }

    #[tokio::test]
    async fn extraction_materialises_all_families_on_good_data() {
        let supervisor = FeatureSupervisor::new(4);
        let set = supervisor
            .extract("BTCUSDT", Arc::new(bars(120)), 1000)
            .await;

        // All four families contribute on a healthy window.
        assert!(set.features.contains_key("ema_9"));
        assert!(set.features.contains_key("rsi_14"));
        assert!(set.features.contains_key("atr_14_pct"));
        assert!(set.features.contains_key("mfi_14"));
        assert!(set.features.len() >= 15, "got {}", set.features.len());

        assert!(set.quality.overall > 0.5);
        assert!((0.0..=1.0).contains(&set.quality.overall));
        assert!((set.quality.completeness - 1.0).abs() < 1e-9);
        assert!((set.quality.reliability - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn extraction_is_pure() {
        let supervisor = FeatureSupervisor::new(2);
        let history = Arc::new(bars(120));
        let a = supervisor.extract("BTCUSDT", history.clone(), 1000).await;
        let b = supervisor.extract("BTCUSDT", history, 2000).await;
        assert_eq!(a.features, b.features);
    }

    #[tokio::test]
    async fn short_history_degrades_gracefully() {
        let supervisor = FeatureSupervisor::new(4);
        let set = supervisor.extract("BTCUSDT", Arc::new(bars(10)), 1000).await;
        // Too little data for most indicators, but nothing crashes and the
        // quality score reflects the gaps.
        assert!(set.quality.completeness < 0.5);
        assert!(set.quality.overall < 0.8);
    }
}
