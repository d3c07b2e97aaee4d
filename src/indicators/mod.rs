// Technical indicators module
// Implements RSI, EMA/SMA, MACD and Bollinger Bands plus the named registry
// that turns a candle window into an IndicatorSnapshot

pub mod bollinger;
pub mod macd;
pub mod moving_average;
pub mod rsi;

pub use bollinger::{calculate_bollinger, BandSide, BollingerBands};
pub use macd::{calculate_macd, macd_series, MacdValue};
pub use moving_average::{calculate_ema, calculate_sma, ema_series};
pub use rsi::calculate_rsi;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::{
    Candle, IndicatorSnapshot, BOLLINGER_LOWER, BOLLINGER_UPPER, MACD, MACD_SIGNAL, RSI,
};

/// Parameterised indicator definition
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndicatorSpec {
    Rsi { period: usize },
    Macd { fast: usize, slow: usize, signal: usize },
    MacdSignal { fast: usize, slow: usize, signal: usize },
    Bollinger { period: usize, k: f64, side: BandSide },
    Sma { period: usize },
    Ema { period: usize },
}

impl IndicatorSpec {
    /// Minimum number of candles needed for a defined value
    pub fn required_lookback(&self) -> usize {
        match *self {
            IndicatorSpec::Rsi { period } => period.saturating_add(1),
            IndicatorSpec::Macd { slow, .. } => slow,
            IndicatorSpec::MacdSignal { slow, signal, .. } => {
                slow.saturating_add(signal).saturating_sub(1)
            }
            IndicatorSpec::Bollinger { period, .. } => period,
            IndicatorSpec::Sma { period } | IndicatorSpec::Ema { period } => period,
        }
    }

    fn evaluate(&self, closes: &[f64]) -> Option<f64> {
        match *self {
            IndicatorSpec::Rsi { period } => calculate_rsi(closes, period),
            IndicatorSpec::Macd { fast, slow, .. } => {
                macd_series(closes, fast, slow).last().copied()
            }
            IndicatorSpec::MacdSignal { fast, slow, signal } => {
                calculate_macd(closes, fast, slow, signal).map(|m| m.signal)
            }
            IndicatorSpec::Bollinger { period, k, side } => {
                calculate_bollinger(closes, period, k).map(|b| b.side(side))
            }
            IndicatorSpec::Sma { period } => calculate_sma(closes, period),
            IndicatorSpec::Ema { period } => calculate_ema(closes, period),
        }
    }
}

/// Pure indicator computation over an open registry of named indicators
///
/// New indicators are added with [`IndicatorEngine::register`]; the cache
/// only ever asks for a full snapshot and the maximum lookback, so it never
/// needs to know which indicators exist.
#[derive(Debug, Clone)]
pub struct IndicatorEngine {
    registry: BTreeMap<String, IndicatorSpec>,
}

impl IndicatorEngine {
    /// Engine with no indicators registered
    pub fn empty() -> Self {
        Self {
            registry: BTreeMap::new(),
        }
    }

    /// Register (or replace) a named indicator
    pub fn register(&mut self, name: impl Into<String>, spec: IndicatorSpec) -> &mut Self {
        self.registry.insert(name.into(), spec);
        self
    }

    pub fn with(mut self, name: impl Into<String>, spec: IndicatorSpec) -> Self {
        self.register(name, spec);
        self
    }

    pub fn spec(&self, name: &str) -> Option<&IndicatorSpec> {
        self.registry.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.registry.keys().map(String::as_str)
    }

    /// Candles needed before every registered indicator is defined
    pub fn required_lookback(&self) -> usize {
        self.registry
            .values()
            .map(IndicatorSpec::required_lookback)
            .max()
            .unwrap_or(1)
    }

    /// Compute a single indicator value from a candle window
    ///
    /// Returns `None` for too-short windows and non-finite results.
    pub fn compute(&self, candles: &[Candle], spec: &IndicatorSpec) -> Option<f64> {
        if candles.len() < spec.required_lookback() {
            return None;
        }
        let closes = closes(candles);
        spec.evaluate(&closes).filter(|v| v.is_finite())
    }

    /// Compute every registered indicator over the window
    ///
    /// Returns `None` only for an empty window; indicators that are undefined
    /// for this window are simply absent from the snapshot.
    pub fn snapshot(&self, candles: &[Candle]) -> Option<IndicatorSnapshot> {
        let last = candles.last()?;
        let closes = closes(candles);

        let mut snapshot = IndicatorSnapshot::new(last.close_time);
        for (name, spec) in &self.registry {
            if candles.len() < spec.required_lookback() {
                continue;
            }
            if let Some(value) = spec.evaluate(&closes) {
                snapshot.insert(name.clone(), value);
            }
        }

        Some(snapshot)
    }
}

impl Default for IndicatorEngine {
    /// RSI(14), MACD(12, 26, 9) and Bollinger(20, 2.0)
    fn default() -> Self {
        Self::empty()
            .with(RSI, IndicatorSpec::Rsi { period: 14 })
            .with(MACD, IndicatorSpec::Macd { fast: 12, slow: 26, signal: 9 })
            .with(MACD_SIGNAL, IndicatorSpec::MacdSignal { fast: 12, slow: 26, signal: 9 })
            .with(
                BOLLINGER_LOWER,
                IndicatorSpec::Bollinger { period: 20, k: 2.0, side: BandSide::Lower },
            )
            .with(
                BOLLINGER_UPPER,
                IndicatorSpec::Bollinger { period: 20, k: 2.0, side: BandSide::Upper },
            )
    }
}

fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close).collect()
}
