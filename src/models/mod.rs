use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Registry names of the built-in indicators
pub const RSI: &str = "rsi";
pub const MACD: &str = "macd";
pub const MACD_SIGNAL: &str = "macd_signal";
pub const BOLLINGER_LOWER: &str = "bollinger_lower";
pub const BOLLINGER_UPPER: &str = "bollinger_upper";

/// OHLCV candlestick
///
/// A window of candles is always ordered by ascending `close_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Side of a leveraged position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "long" => Ok(Direction::Long),
            "short" => Ok(Direction::Short),
            other => Err(format!("Unknown direction: {}", other)),
        }
    }
}

/// Candle interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    /// Interval string as used by the exchange kline endpoint
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Timeframe::M1 => Duration::minutes(1),
            Timeframe::M5 => Duration::minutes(5),
            Timeframe::M15 => Duration::minutes(15),
            Timeframe::H1 => Duration::hours(1),
            Timeframe::H4 => Duration::hours(4),
            Timeframe::D1 => Duration::days(1),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            other => Err(format!("Unknown timeframe: {}", other)),
        }
    }
}

/// Open leveraged position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub quantity: f64,
    pub leverage: f64,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Unrealized (or realized, at exit) P&L at the given price
    pub fn pnl_at(&self, price: f64) -> f64 {
        match self.direction {
            Direction::Long => (price - self.entry_price) * self.quantity,
            Direction::Short => (self.entry_price - price) * self.quantity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    ExitTriggered,
    Closed,
}

/// Indicator values computed from one candle window
///
/// `source_close_time` is the close time of the last candle in the window and
/// is the freshness key: the snapshot may be reused only while no later
/// candle has closed. Non-finite values are never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub values: BTreeMap<String, f64>,
    pub source_close_time: DateTime<Utc>,
}

impl IndicatorSnapshot {
    pub fn new(source_close_time: DateTime<Utc>) -> Self {
        Self {
            values: BTreeMap::new(),
            source_close_time,
        }
    }

    /// Insert a value, silently dropping NaN and infinities
    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        if value.is_finite() {
            self.values.insert(name.into(), value);
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied().filter(|v| v.is_finite())
    }

    pub fn rsi(&self) -> Option<f64> {
        self.get(RSI)
    }

    pub fn macd(&self) -> Option<f64> {
        self.get(MACD)
    }

    pub fn macd_signal(&self) -> Option<f64> {
        self.get(MACD_SIGNAL)
    }

    pub fn bollinger_lower(&self) -> Option<f64> {
        self.get(BOLLINGER_LOWER)
    }

    pub fn bollinger_upper(&self) -> Option<f64> {
        self.get(BOLLINGER_UPPER)
    }

    /// True if no candle newer than this snapshot's source has closed
    pub fn is_fresh_for(&self, latest_close_time: DateTime<Utc>) -> bool {
        self.source_close_time >= latest_close_time
    }
}
