// =============================================================================
// Volatility indicators — ATR, Bollinger bands, ADX
// =============================================================================
//
// True Range for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
// ATR is Wilder-smoothed TR:
//   ATR_0 = SMA of first `period` TRs
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
// =============================================================================

use crate::types::Kline;

use super::{mean, stddev};

/// Most recent ATR value.
///
/// Needs `period + 1` bars (each TR uses the previous close). `None` on
/// degenerate input or non-finite intermediates.
pub fn atr(bars: &[Kline], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let tr: Vec<f64> = (1..bars.len())
        .map(|i| {
            let high = bars[i].high;
            let low = bars[i].low;
            let prev_close = bars[i - 1].close;
            (high - low)
                .max((high - prev_close).abs())
                .max((low - prev_close).abs())
        })
        .collect();

    let seed = mean(&tr[..period])?;
    if !seed.is_finite() {
        return None;
    }

    let period_f = period as f64;
    let mut value = seed;
    for &t in &tr[period..] {
        value = (value * (period_f - 1.0) + t) / period_f;
        if !value.is_finite() {
            return None;
        }
    }
    Some(value)
}

/// ATR as a percentage of the latest close.
pub fn atr_pct(bars: &[Kline], period: usize) -> Option<f64> {
    let value = atr(bars, period)?;
    let close = bars.last()?.close;
    if close == 0.0 {
        return None;
    }
    Some(value / close * 100.0)
}

/// Bollinger band summary at the latest close.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bollinger {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// (upper - lower) / middle — a normalised width.
    pub width: f64,
    /// Position of the close inside the band, 0 at lower, 1 at upper.
    pub percent_b: f64,
}

/// Bollinger bands over the last `period` closes with `k` standard
/// deviations.
pub fn bollinger(closes: &[f64], period: usize, k: f64) -> Option<Bollinger> {
    if period == 0 || closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    let middle = mean(window)?;
    let sd = stddev(window)?;

    let upper = middle + k * sd;
    let lower = middle - k * sd;
    if middle == 0.0 {
        return None;
    }
    let width = (upper - lower) / middle;

    let close = *closes.last()?;
    let percent_b = if upper - lower == 0.0 {
        0.5
    } else {
        (close - lower) / (upper - lower)
    };

    (width.is_finite() && percent_b.is_finite()).then_some(Bollinger {
        upper,
        middle,
        lower,
        width,
        percent_b,
    })
}

/// Most recent ADX value in [0, 100] (Wilder's directional movement).
pub fn adx(bars: &[Kline], period: usize) -> Option<f64> {
    // Need period TRs to seed, another period of DX values for the ADX seed.
    if period == 0 || bars.len() < 2 * period + 1 {
        return None;
    }

    let mut tr = Vec::with_capacity(bars.len() - 1);
    let mut plus_dm = Vec::with_capacity(bars.len() - 1);
    let mut minus_dm = Vec::with_capacity(bars.len() - 1);

    for i in 1..bars.len() {
        let high = bars[i].high;
        let low = bars[i].low;
        let prev_high = bars[i - 1].high;
        let prev_low = bars[i - 1].low;
        let prev_close = bars[i - 1].close;

        tr.push(
            (high - low)
                .max((high - prev_close).abs())
                .max((low - prev_close).abs()),
        );

        let up_move = high - prev_high;
        let down_move = prev_low - low;
        plus_dm.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dm.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
    }

    let period_f = period as f64;
    let mut tr_sum: f64 = tr[..period].iter().sum();
    let mut plus_sum: f64 = plus_dm[..period].iter().sum();
    let mut minus_sum: f64 = minus_dm[..period].iter().sum();

    let dx_at = |tr_sum: f64, plus_sum: f64, minus_sum: f64| -> Option<f64> {
        if tr_sum == 0.0 {
            return Some(0.0);
        }
        let plus_di = plus_sum / tr_sum * 100.0;
        let minus_di = minus_sum / tr_sum * 100.0;
        let di_sum = plus_di + minus_di;
        if di_sum == 0.0 {
            return Some(0.0);
        }
        let dx = (plus_di - minus_di).abs() / di_sum * 100.0;
        dx.is_finite().then_some(dx)
    };

    let mut dx_values = vec![dx_at(tr_sum, plus_sum, minus_sum)?];
    for i in period..tr.len() {
        tr_sum = tr_sum - tr_sum / period_f + tr[i];
        plus_sum = plus_sum - plus_sum / period_f + plus_dm[i];
        minus_sum = minus_sum - minus_sum / period_f + minus_dm[i];
        dx_values.push(dx_at(tr_sum, plus_sum, minus_sum)?);
    }

    if dx_values.len() < period {
        return None;
    }

    let mut adx_value = mean(&dx_values[..period])?;
    for &dx in &dx_values[period..] {
        adx_value = (adx_value * (period_f - 1.0) + dx) / period_f;
        if !adx_value.is_finite() {
            return None;
        }
    }
    Some(adx_value)
}
