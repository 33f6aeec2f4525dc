// =============================================================================
// Volume indicators — OBV slope, MFI, volume z-score
// =============================================================================

use crate::types::Kline;

use super::{mean, stddev};

/// On-balance volume series: volume added on up-closes, subtracted on
/// down-closes.
pub fn obv_series(bars: &[Kline]) -> Vec<f64> {
    if bars.is_empty() {
        return Vec::new();
    }
    let mut series = Vec::with_capacity(bars.len());
    let mut obv = 0.0;
    series.push(obv);
    for i in 1..bars.len() {
        if bars[i].close > bars[i - 1].close {
            obv += bars[i].volume;
        } else if bars[i].close < bars[i - 1].close {
            obv -= bars[i].volume;
        }
        series.push(obv);
    }
    series
}

/// Normalised OBV slope over the last `lookback` bars: the OBV delta divided
/// by total traded volume in the window, in [-1, 1].
pub fn obv_slope(bars: &[Kline], lookback: usize) -> Option<f64> {
    if lookback == 0 || bars.len() < lookback + 1 {
        return None;
    }
    let series = obv_series(bars);
    let delta = series.last()? - series[series.len() - 1 - lookback];
    let total: f64 = bars[bars.len() - lookback..].iter().map(|b| b.volume).sum();
    if total == 0.0 {
        return Some(0.0);
    }
    let value = delta / total;
    value.is_finite().then_some(value)
}

/// Money Flow Index in [0, 100] over typical prices.
pub fn mfi(bars: &[Kline], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let typical = |b: &Kline| (b.high + b.low + b.close) / 3.0;

    let mut positive = 0.0;
    let mut negative = 0.0;
    let start = bars.len() - period;
    for i in start..bars.len() {
        let tp = typical(&bars[i]);
        let prev_tp = typical(&bars[i - 1]);
        let flow = tp * bars[i].volume;
        if tp > prev_tp {
            positive += flow;
        } else if tp < prev_tp {
            negative += flow;
        }
    }

    let value = if positive == 0.0 && negative == 0.0 {
        50.0
    } else if negative == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + positive / negative)
    };
    value.is_finite().then_some(value)
}

/// Z-score of the latest bar's volume against the previous `lookback` bars.
pub fn volume_zscore(bars: &[Kline], lookback: usize) -> Option<f64> {
    if lookback < 2 || bars.len() < lookback + 1 {
        return None;
    }
    let history: Vec<f64> = bars[bars.len() - 1 - lookback..bars.len() - 1]
        .iter()
        .map(|b| b.volume)
        .collect();
    let m = mean(&history)?;
    let sd = stddev(&history)?;
    if sd == 0.0 {
        return Some(0.0);
    }
    let value = (bars.last()?.volume - m) / sd;
    value.is_finite().then_some(value)
}
