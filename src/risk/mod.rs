// Risk management module
pub mod liquidation;

pub use liquidation::{LiquidationRiskModel, RiskError, DEFAULT_SAFETY_MARGIN};
