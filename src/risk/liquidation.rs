use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Direction;

/// Exit when price is within 5% of the liquidation price
pub const DEFAULT_SAFETY_MARGIN: f64 = 0.05;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskError {
    #[error("leverage must be >= 1, got {0}")]
    InvalidLeverage(f64),

    #[error("safety margin must be in [0, 1), got {0}")]
    InvalidSafetyMargin(f64),
}

/// Liquidation distance check for leveraged positions
///
/// Always fed the live price; a cached indicator value is never a substitute.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LiquidationRiskModel {
    safety_margin_percent: f64,
}

impl LiquidationRiskModel {
    pub fn new(safety_margin_percent: f64) -> Result<Self, RiskError> {
        if !(0.0..1.0).contains(&safety_margin_percent) {
            return Err(RiskError::InvalidSafetyMargin(safety_margin_percent));
        }
        Ok(Self {
            safety_margin_percent,
        })
    }

    pub fn safety_margin_percent(&self) -> f64 {
        self.safety_margin_percent
    }

    /// Price at which the position's margin is fully consumed
    ///
    /// LONG: `entry * (1 - 1/leverage)`, SHORT: `entry * (1 + 1/leverage)`.
    /// At 1x a LONG liquidates at 0, i.e. never.
    pub fn liquidation_price(
        entry_price: f64,
        leverage: f64,
        direction: Direction,
    ) -> Result<f64, RiskError> {
        if !leverage.is_finite() || leverage < 1.0 {
            return Err(RiskError::InvalidLeverage(leverage));
        }

        let price = match direction {
            Direction::Long => entry_price * (1.0 - 1.0 / leverage),
            Direction::Short => entry_price * (1.0 + 1.0 / leverage),
        };
        Ok(price)
    }

    /// Price at which the safety exit fires
    pub fn exit_threshold(&self, liquidation_price: f64, direction: Direction) -> f64 {
        match direction {
            Direction::Long => liquidation_price * (1.0 + self.safety_margin_percent),
            Direction::Short => liquidation_price * (1.0 - self.safety_margin_percent),
        }
    }

    /// True once the current price is inside the safety margin
    pub fn should_exit(
        &self,
        current_price: f64,
        liquidation_price: f64,
        direction: Direction,
    ) -> bool {
        if !current_price.is_finite() || !liquidation_price.is_finite() {
            return false;
        }

        let threshold = self.exit_threshold(liquidation_price, direction);
        match direction {
            Direction::Long => current_price <= threshold,
            Direction::Short => current_price >= threshold,
        }
    }
}

impl Default for LiquidationRiskModel {
    fn default() -> Self {
        Self {
            safety_margin_percent: DEFAULT_SAFETY_MARGIN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_liquidation_price() {
        let price =
            LiquidationRiskModel::liquidation_price(50_000.0, 10.0, Direction::Long).unwrap();
        assert_eq!(price, 45_000.0);
    }

    #[test]
    fn test_short_liquidation_price() {
        let price =
            LiquidationRiskModel::liquidation_price(50_000.0, 10.0, Direction::Short).unwrap();
        assert_eq!(price, 55_000.0);
    }

    #[test]
    fn test_long_safety_margin_boundary() {
        let model = LiquidationRiskModel::default();
        let liq = LiquidationRiskModel::liquidation_price(50_000.0, 10.0, Direction::Long).unwrap();

        // 45000 * 1.05 = 47250
        assert!(model.should_exit(47_250.0, liq, Direction::Long));
        assert!(!model.should_exit(47_251.0, liq, Direction::Long));
        assert!(model.should_exit(46_000.0, liq, Direction::Long));
    }

    #[test]
    fn test_short_safety_margin() {
        let model = LiquidationRiskModel::default();
        let liq =
            LiquidationRiskModel::liquidation_price(50_000.0, 10.0, Direction::Short).unwrap();

        // 55000 * 0.95 = 52250
        assert!(model.should_exit(52_300.0, liq, Direction::Short));
        assert!(!model.should_exit(52_200.0, liq, Direction::Short));
    }

    #[test]
    fn test_unlevered_long_never_triggers() {
        let model = LiquidationRiskModel::default();
        let liq = LiquidationRiskModel::liquidation_price(50_000.0, 1.0, Direction::Long).unwrap();

        assert_eq!(liq, 0.0);
        assert!(!model.should_exit(1.0, liq, Direction::Long));
    }

    #[test]
    fn test_rejects_leverage_below_one() {
        for leverage in [0.0, 0.5, -2.0, f64::NAN, f64::INFINITY] {
            let result =
                LiquidationRiskModel::liquidation_price(50_000.0, leverage, Direction::Long);
            assert!(matches!(result, Err(RiskError::InvalidLeverage(_))), "{}", leverage);
        }
    }

    #[test]
    fn test_nan_price_never_exits() {
        let model = LiquidationRiskModel::default();
        assert!(!model.should_exit(f64::NAN, 45_000.0, Direction::Long));
        assert!(!model.should_exit(f64::NAN, 55_000.0, Direction::Short));
    }

    #[test]
    fn test_invalid_safety_margin() {
        assert!(LiquidationRiskModel::new(0.1).is_ok());
        assert!(LiquidationRiskModel::new(-0.1).is_err());
        assert!(LiquidationRiskModel::new(1.0).is_err());
    }
}
