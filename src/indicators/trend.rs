// =============================================================================
// Trend indicators — EMA, MACD, ROC, momentum
// =============================================================================
//
// EMA formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
// The first value is seeded with the SMA of the first `period` closes.
//
// MACD = EMA_fast - EMA_slow; the signal line is an EMA of the MACD series;
// the histogram is their difference.
// =============================================================================

/// Full EMA series for `closes` and look-back `period`.
///
/// Returns an empty vec when `period` is zero or the input is too short.
/// Production of values stops at the first non-finite result.
pub fn ema_series(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period + 1) as f64;

    let seed: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    result.push(seed);

    let mut prev = seed;
    for &close in &closes[period..] {
        let ema = close * multiplier + prev * (1.0 - multiplier);
        if !ema.is_finite() {
            break;
        }
        result.push(ema);
        prev = ema;
    }

    result
}

/// Most recent EMA value.
pub fn ema(closes: &[f64], period: usize) -> Option<f64> {
    ema_series(closes, period).last().copied()
}

/// MACD line, signal line, and histogram at the most recent close.
///
/// `None` when the input cannot cover `slow + signal` bars.
pub fn macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> Option<(f64, f64, f64)> {
    if fast == 0 || slow <= fast || signal == 0 || closes.len() < slow + signal {
        return None;
    }

    let fast_series = ema_series(closes, fast);
    let slow_series = ema_series(closes, slow);
    if slow_series.is_empty() {
        return None;
    }

    // Align the two series at their ends: the slow series is shorter.
    let offset = fast_series.len().checked_sub(slow_series.len())?;
    let macd_series: Vec<f64> = slow_series
        .iter()
        .enumerate()
        .map(|(i, slow_v)| fast_series[offset + i] - slow_v)
        .collect();

    let signal_series = ema_series(&macd_series, signal);
    let line = *macd_series.last()?;
    let signal_value = *signal_series.last()?;

    let histogram = line - signal_value;
    if !histogram.is_finite() {
        return None;
    }
    Some((line, signal_value, histogram))
}

/// Rate of change over `period` bars, percent.
pub fn roc(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }
    let current = *closes.last()?;
    let past = closes[closes.len() - 1 - period];
    if past == 0.0 {
        return None;
    }
    let value = (current - past) / past * 100.0;
    value.is_finite().then_some(value)
}

/// Absolute price momentum over `period` bars.
pub fn momentum(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }
    let value = *closes.last()? - closes[closes.len() - 1 - period];
    value.is_finite().then_some(value)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_rejects_degenerate_input() {
        assert!(ema_series(&[], 5).is_empty());
        assert!(ema_series(&[1.0, 2.0, 3.0], 0).is_empty());
        assert!(ema_series(&[1.0, 2.0], 5).is_empty());
    }

    #[test]
    fn ema_seed_is_sma() {
        let e = ema_series(&[2.0, 4.0, 6.0], 3);
        assert_eq!(e.len(), 1);
        assert!((e[0] - 4.0).abs() < 1e-10);
    }

    #[test]
    fn ema_known_values() {
        // 5-period EMA of 1..10: seed SMA 3.0, multiplier 1/3.
        let closes: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        let series = ema_series(&closes, 5);
        assert_eq!(series.len(), 6);

        let mult = 2.0 / 6.0;
        let mut expected = 3.0;
        for (i, &c) in closes[5..].iter().enumerate() {
            expected = c * mult + expected * (1.0 - mult);
            assert!((series[i + 1] - expected).abs() < 1e-10);
        }
    }

    #[test]
    fn ema_stops_at_nan() {
        let closes = vec![1.0, 2.0, 3.0, f64::NAN, 5.0];
        assert_eq!(ema_series(&closes, 3).len(), 1);
    }

    #[test]
    fn macd_positive_in_uptrend_negative_in_downtrend() {
        let up: Vec<f64> = (1..=120).map(|x| x as f64).collect();
        let (line, signal, _) = macd(&up, 12, 26, 9).unwrap();
        assert!(line > 0.0);
        assert!(signal > 0.0);

        let down: Vec<f64> = (1..=120).rev().map(|x| x as f64).collect();
        let (line, _, _) = macd(&down, 12, 26, 9).unwrap();
        assert!(line < 0.0);
    }

    #[test]
    fn macd_flat_is_zero() {
        let flat = vec![50.0; 120];
        let (line, signal, histogram) = macd(&flat, 12, 26, 9).unwrap();
        assert!(line.abs() < 1e-9);
        assert!(signal.abs() < 1e-9);
        assert!(histogram.abs() < 1e-9);
    }

    #[test]
    fn macd_insufficient_data() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        assert!(macd(&closes, 12, 26, 9).is_none());
        assert!(macd(&closes, 26, 12, 9).is_none()); // slow must exceed fast
    }

    #[test]
    fn roc_and_momentum() {
        let closes = vec![100.0, 102.0, 104.0, 110.0];
        // ROC over 3 bars: (110-100)/100*100 = 10%.
        assert!((roc(&closes, 3).unwrap() - 10.0).abs() < 1e-10);
        assert!((momentum(&closes, 3).unwrap() - 10.0).abs() < 1e-10);
        assert!(roc(&closes, 10).is_none());
        assert!(roc(&[0.0, 5.0], 1).is_none()); // division guard
    }
}
