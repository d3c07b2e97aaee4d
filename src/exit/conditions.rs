use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::execution::TrailingStopTracker;
use crate::models::{Direction, IndicatorSnapshot, Position};
use crate::risk::LiquidationRiskModel;

/// Why a position was closed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExitReason {
    TrailingStop,
    RsiThreshold,
    MacdCross,
    BollingerBand,
    LiquidationRisk,
    Custom(String),
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::TrailingStop => write!(f, "trailing_stop"),
            ExitReason::RsiThreshold => write!(f, "rsi_threshold"),
            ExitReason::MacdCross => write!(f, "macd_cross"),
            ExitReason::BollingerBand => write!(f, "bollinger_band"),
            ExitReason::LiquidationRisk => write!(f, "liquidation_risk"),
            ExitReason::Custom(name) => write!(f, "custom:{}", name),
        }
    }
}

/// Everything a predicate may look at during one evaluation
///
/// `current_price` is the live price fetched this cycle. `snapshot` is
/// `None` when indicators are indeterminate; indicator rules then abstain.
#[derive(Debug, Clone, Copy)]
pub struct ExitContext<'a> {
    pub position: &'a Position,
    pub tracker: &'a TrailingStopTracker,
    pub current_price: f64,
    pub snapshot: Option<&'a IndicatorSnapshot>,
}

/// A single pure exit predicate
pub trait ExitPredicate: Send + Sync {
    fn should_exit(&self, ctx: &ExitContext<'_>) -> bool;

    fn reason(&self) -> ExitReason;
}

/// Threshold rules over a cached indicator snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum IndicatorRule {
    /// LONG exits when RSI >= overbought, SHORT when RSI <= oversold
    Rsi { overbought: f64, oversold: f64 },
    /// LONG exits when MACD falls below its signal line, SHORT when above
    MacdCross,
    /// LONG exits at or above the upper band, SHORT at or below the lower band
    BollingerBand,
}

impl IndicatorRule {
    fn should_exit(&self, ctx: &ExitContext<'_>) -> bool {
        let Some(snapshot) = ctx.snapshot else {
            return false;
        };
        let direction = ctx.position.direction;

        // Missing values compare as "no exit"
        match *self {
            IndicatorRule::Rsi { overbought, oversold } => match (snapshot.rsi(), direction) {
                (Some(rsi), Direction::Long) => rsi >= overbought,
                (Some(rsi), Direction::Short) => rsi <= oversold,
                (None, _) => false,
            },
            IndicatorRule::MacdCross => match (snapshot.macd(), snapshot.macd_signal()) {
                (Some(macd), Some(signal)) => match direction {
                    Direction::Long => macd < signal,
                    Direction::Short => macd > signal,
                },
                _ => false,
            },
            IndicatorRule::BollingerBand => {
                if !ctx.current_price.is_finite() {
                    return false;
                }
                match direction {
                    Direction::Long => snapshot
                        .bollinger_upper()
                        .is_some_and(|upper| ctx.current_price >= upper),
                    Direction::Short => snapshot
                        .bollinger_lower()
                        .is_some_and(|lower| ctx.current_price <= lower),
                }
            }
        }
    }

    fn reason(&self) -> ExitReason {
        match self {
            IndicatorRule::Rsi { .. } => ExitReason::RsiThreshold,
            IndicatorRule::MacdCross => ExitReason::MacdCross,
            IndicatorRule::BollingerBand => ExitReason::BollingerBand,
        }
    }
}

/// Built-in exit conditions plus an open extension point
#[derive(Clone)]
pub enum ExitCondition {
    TrailingStop,
    IndicatorThreshold(IndicatorRule),
    LiquidationRisk(LiquidationRiskModel),
    Custom(Arc<dyn ExitPredicate>),
}

impl ExitPredicate for ExitCondition {
    fn should_exit(&self, ctx: &ExitContext<'_>) -> bool {
        match self {
            ExitCondition::TrailingStop => ctx.tracker.should_trigger_stop(ctx.current_price),
            ExitCondition::IndicatorThreshold(rule) => rule.should_exit(ctx),
            ExitCondition::LiquidationRisk(model) => {
                let position = ctx.position;
                match LiquidationRiskModel::liquidation_price(
                    position.entry_price,
                    position.leverage,
                    position.direction,
                ) {
                    Ok(liquidation_price) => {
                        model.should_exit(ctx.current_price, liquidation_price, position.direction)
                    }
                    Err(e) => {
                        tracing::warn!(
                            symbol = %position.symbol,
                            error = %e,
                            "Skipping liquidation check"
                        );
                        false
                    }
                }
            }
            ExitCondition::Custom(predicate) => predicate.should_exit(ctx),
        }
    }

    fn reason(&self) -> ExitReason {
        match self {
            ExitCondition::TrailingStop => ExitReason::TrailingStop,
            ExitCondition::IndicatorThreshold(rule) => rule.reason(),
            ExitCondition::LiquidationRisk(_) => ExitReason::LiquidationRisk,
            ExitCondition::Custom(predicate) => predicate.reason(),
        }
    }
}

impl fmt::Debug for ExitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitCondition::TrailingStop => write!(f, "TrailingStop"),
            ExitCondition::IndicatorThreshold(rule) => {
                f.debug_tuple("IndicatorThreshold").field(rule).finish()
            }
            ExitCondition::LiquidationRisk(model) => {
                f.debug_tuple("LiquidationRisk").field(model).finish()
            }
            ExitCondition::Custom(predicate) => write!(f, "Custom({})", predicate.reason()),
        }
    }
}
