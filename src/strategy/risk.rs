// =============================================================================
// Risk validation — the precondition for every order submission
// =============================================================================
//
// positionSize must be positive and within the ceiling; stop/target prices
// derive from the configured risk percent, or from leverage and notional for
// the margin-based variants.
// =============================================================================

use anyhow::Result;
use serde::Serialize;

/// Stop-loss and take-profit pair for a validated entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProtectivePrices {
    pub stop_loss: f64,
    pub take_profit: f64,
}

/// Stateless risk arithmetic shared by the router and executors.
#[derive(Debug, Clone)]
pub struct RiskManager {
    /// Upper bound on the strategy multiplier.
    pub position_ceiling: f64,
}

impl RiskManager {
    pub fn new(position_ceiling: f64) -> Self {
        Self { position_ceiling }
    }

    /// Bound a raw multiplier to [0, position_ceiling].
    pub fn clamp_multiplier(&self, multiplier: f64) -> f64 {
        if !multiplier.is_finite() {
            return 0.0;
        }
        multiplier.clamp(0.0, self.position_ceiling)
    }

    /// Validate the final position size before submission.
    pub fn validate_position_size(&self, size: f64, base_quantity: f64) -> Result<()> {
        if !size.is_finite() || size <= 0.0 {
            anyhow::bail!("position size must be positive, got {size}");
        }
        let ceiling = base_quantity * self.position_ceiling;
        if size > ceiling {
            anyhow::bail!("position size {size} exceeds ceiling {ceiling}");
        }
        Ok(())
    }

    /// Percent-distance stop and target around a long entry:
    /// stop = entry * (1 - r/100), target = entry * (1 + r/100).
    /// Short entries mirror.
    pub fn protective_prices(&self, entry: f64, risk_percent: f64, is_long: bool) -> ProtectivePrices {
        let r = risk_percent / 100.0;
        if is_long {
            ProtectivePrices {
                stop_loss: entry * (1.0 - r),
                take_profit: entry * (1.0 + r),
            }
        } else {
            ProtectivePrices {
                stop_loss: entry * (1.0 + r),
                take_profit: entry * (1.0 - r),
            }
        }
    }

    /// Margin-based variant: the stop distance is the risk percent of the
    /// margin, i.e. risk/leverage of the notional.
    pub fn margin_protective_prices(
        &self,
        entry: f64,
        risk_percent: f64,
        leverage: f64,
        is_long: bool,
    ) -> ProtectivePrices {
        if leverage <= 1.0 {
            return self.protective_prices(entry, risk_percent, is_long);
        }
        self.protective_prices(entry, risk_percent / leverage, is_long)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplier_is_clamped_to_ceiling() {
        let risk = RiskManager::new(3.0);
        assert_eq!(risk.clamp_multiplier(1.5), 1.5);
        assert_eq!(risk.clamp_multiplier(5.0), 3.0);
        assert_eq!(risk.clamp_multiplier(-1.0), 0.0);
        assert_eq!(risk.clamp_multiplier(f64::NAN), 0.0);
    }

    #[test]
    fn position_size_validation() {
        let risk = RiskManager::new(2.0);
        risk.validate_position_size(1.0, 1.0).unwrap();
        risk.validate_position_size(2.0, 1.0).unwrap();
        assert!(risk.validate_position_size(0.0, 1.0).is_err());
        assert!(risk.validate_position_size(-1.0, 1.0).is_err());
        assert!(risk.validate_position_size(2.1, 1.0).is_err());
        assert!(risk.validate_position_size(f64::NAN, 1.0).is_err());
    }

    #[test]
    fn long_protective_prices() {
        let risk = RiskManager::new(3.0);
        let p = risk.protective_prices(100.0, 2.0, true);
        assert!((p.stop_loss - 98.0).abs() < 1e-9);
        assert!((p.take_profit - 102.0).abs() < 1e-9);
    }

    #[test]
    fn short_protective_prices_mirror() {
        let risk = RiskManager::new(3.0);
        let p = risk.protective_prices(100.0, 2.0, false);
        assert!((p.stop_loss - 102.0).abs() < 1e-9);
        assert!((p.take_profit - 98.0).abs() < 1e-9);
    }

    #[test]
    fn margin_variant_scales_distance_by_leverage() {
        let risk = RiskManager::new(3.0);
        // 10x leverage: a 2% margin risk is 0.2% of price.
        let p = risk.margin_protective_prices(100.0, 2.0, 10.0, true);
        assert!((p.stop_loss - 99.8).abs() < 1e-9);
        assert!((p.take_profit - 100.2).abs() < 1e-9);

        // Leverage <= 1 falls back to the plain variant.
        let p = risk.margin_protective_prices(100.0, 2.0, 1.0, true);
        assert!((p.stop_loss - 98.0).abs() < 1e-9);
    }
}
