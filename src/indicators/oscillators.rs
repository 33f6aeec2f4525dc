// =============================================================================
// Oscillators — RSI, Stochastic, Williams %R, CCI
// =============================================================================
//
// RSI uses Wilder's smoothing:
//   avg_gain_t = (avg_gain_{t-1} * (period - 1) + gain_t) / period
//   RSI        = 100 - 100 / (1 + avg_gain / avg_loss)
// RSI > 70 reads overbought, RSI < 30 oversold.
// =============================================================================

use crate::types::Kline;

use super::mean;

/// Most recent RSI value in [0, 100].
///
/// # Edge cases
/// - Needs at least `period + 1` closes.
/// - No movement at all => 50. Only gains => 100. Only losses => 0.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let (mut avg_gain, mut avg_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l + d.abs())
            }
        });
    let period_f = period as f64;
    avg_gain /= period_f;
    avg_loss /= period_f;

    for &delta in &deltas[period..] {
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
    }

    let value = if avg_gain == 0.0 && avg_loss == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    };
    value.is_finite().then_some(value)
}

/// Stochastic oscillator: (%K smoothed over `smooth` bars, %D as a 3-bar
/// mean of %K).
pub fn stochastic(bars: &[Kline], period: usize, smooth: usize) -> Option<(f64, f64)> {
    if period == 0 || smooth == 0 || bars.len() < period + smooth + 2 {
        return None;
    }

    // Raw %K for each bar that has a full look-back window.
    let raw_k: Vec<f64> = (period - 1..bars.len())
        .map(|i| {
            let window = &bars[i + 1 - period..=i];
            let high = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
            let low = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
            if high - low == 0.0 {
                50.0
            } else {
                (bars[i].close - low) / (high - low) * 100.0
            }
        })
        .collect();

    let smoothed: Vec<f64> = raw_k
        .windows(smooth)
        .map(|w| w.iter().sum::<f64>() / smooth as f64)
        .collect();

    let k = *smoothed.last()?;
    let d_window = &smoothed[smoothed.len().saturating_sub(3)..];
    let d = mean(d_window)?;

    (k.is_finite() && d.is_finite()).then_some((k, d))
}

/// Williams %R in [-100, 0].
pub fn williams_r(bars: &[Kline], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period {
        return None;
    }
    let window = &bars[bars.len() - period..];
    let high = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let low = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
    if high - low == 0.0 {
        return Some(-50.0);
    }
    let close = bars.last()?.close;
    let value = (high - close) / (high - low) * -100.0;
    value.is_finite().then_some(value)
}

/// Commodity Channel Index over typical prices (H+L+C)/3.
pub fn cci(bars: &[Kline], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period {
        return None;
    }
    let typical: Vec<f64> = bars[bars.len() - period..]
        .iter()
        .map(|b| (b.high + b.low + b.close) / 3.0)
        .collect();

    let m = mean(&typical)?;
    let mean_dev = typical.iter().map(|t| (t - m).abs()).sum::<f64>() / period as f64;
    if mean_dev == 0.0 {
        return Some(0.0);
    }
    let value = (typical.last()? - m) / (0.015 * mean_dev);
    value.is_finite().then_some(value)
}
