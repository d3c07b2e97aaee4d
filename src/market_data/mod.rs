// Market data collaborators: candle/price providers and candle validation
pub mod binance;
pub mod synthetic;

pub use binance::BinanceFuturesClient;
pub use synthetic::{MarketScenario, SyntheticMarketData};

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Candle, Timeframe};

#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("exchange unavailable: {0}")]
    ExchangeUnavailable(String),

    #[error("rate limited by exchange")]
    RateLimited,

    #[error("market data request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("invalid market data: {0}")]
    InvalidData(String),
}

impl MarketDataError {
    /// Transient failures skip the cycle and are retried on the next tick
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MarketDataError::ExchangeUnavailable(_)
                | MarketDataError::RateLimited
                | MarketDataError::Timeout(_)
        )
    }
}

/// Source of candles and live prices
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Latest `limit` closed candles, ascending by close time
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, MarketDataError>;

    /// Current traded price
    async fn current_price(&self, symbol: &str) -> Result<f64, MarketDataError>;
}

/// Check a candle window for sanity
///
/// Close times must be strictly increasing, prices positive and OHLC
/// relationships consistent.
pub fn validate_candles(candles: &[Candle]) -> Result<(), MarketDataError> {
    for candle in candles {
        validate_candle(candle)?;
    }

    for pair in candles.windows(2) {
        if pair[1].close_time <= pair[0].close_time {
            return Err(MarketDataError::InvalidData(format!(
                "Candles out of order: {} followed by {}",
                pair[0].close_time, pair[1].close_time
            )));
        }
    }

    Ok(())
}

fn validate_candle(candle: &Candle) -> Result<(), MarketDataError> {
    let prices = [candle.open, candle.high, candle.low, candle.close];
    if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
        return Err(MarketDataError::InvalidData(format!(
            "Non-positive price in candle closing at {}",
            candle.close_time
        )));
    }

    // Volume can be 0.0 on quiet intervals
    if candle.volume < 0.0 {
        return Err(MarketDataError::InvalidData(format!(
            "Invalid volume: {}",
            candle.volume
        )));
    }

    if candle.high < candle.low
        || candle.high < candle.open.max(candle.close)
        || candle.low > candle.open.min(candle.close)
    {
        return Err(MarketDataError::InvalidData(format!(
            "Inconsistent OHLC in candle closing at {}",
            candle.close_time
        )));
    }

    if candle.close_time < candle.open_time {
        return Err(MarketDataError::InvalidData(format!(
            "Close time {} before open time {}",
            candle.close_time, candle.open_time
        )));
    }

    Ok(())
}
