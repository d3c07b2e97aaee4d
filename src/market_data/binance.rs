use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use governor::{Quota, RateLimiter};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use super::{validate_candles, MarketDataError, MarketDataProvider};
use crate::models::{Candle, Timeframe};

pub const BINANCE_FUTURES_API_BASE: &str = "https://fapi.binance.com";
const RATE_LIMIT_RPS: u32 = 10;
const DEFAULT_TIMEOUT_SECS: u64 = 10;

// Type alias for the rate limiter to simplify signatures
type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

/// Binance USD-M futures market data client
///
/// Cloneable; all clones share the rate limiter. There is no retry loop
/// here: a failed request surfaces as a transient error and the caller
/// skips its cycle.
#[derive(Clone)]
pub struct BinanceFuturesClient {
    client: Client,
    base_url: String,
    timeout: Duration,
    rate_limiter: Arc<BinanceRateLimiter>,
}

impl BinanceFuturesClient {
    pub fn new() -> Result<Self, MarketDataError> {
        Self::with_base_url(BINANCE_FUTURES_API_BASE, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Create a client against a custom endpoint (testnet, mock server)
    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self, MarketDataError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MarketDataError::ExchangeUnavailable(format!("HTTP client: {}", e)))?;

        let quota = Quota::per_second(NonZeroU32::new(RATE_LIMIT_RPS).unwrap_or(NonZeroU32::MIN));

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, MarketDataError> {
        self.rate_limiter.until_ready().await;

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                MarketDataError::Timeout(self.timeout)
            } else {
                MarketDataError::ExchangeUnavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        // 418 is Binance's escalation after ignoring 429s
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::IM_A_TEAPOT {
            tracing::warn!(url = %url, status = %status, "Rate limited by Binance");
            return Err(MarketDataError::RateLimited);
        }

        if status.is_server_error() {
            return Err(MarketDataError::ExchangeUnavailable(format!(
                "Binance returned {}",
                status
            )));
        }

        let body = response.text().await.unwrap_or_default();
        Err(MarketDataError::InvalidData(format!(
            "Binance returned {}: {}",
            status, body
        )))
    }
}

#[async_trait]
impl MarketDataProvider for BinanceFuturesClient {
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, MarketDataError> {
        // One extra row because the newest kline is usually still open
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            symbol,
            timeframe.as_str(),
            limit + 1
        );

        let rows: Vec<Vec<Value>> = self
            .get(&url)
            .await?
            .json()
            .await
            .map_err(|e| MarketDataError::InvalidData(format!("kline payload: {}", e)))?;

        let now = Utc::now();
        let mut candles = rows
            .iter()
            .map(|row| parse_kline(row))
            .collect::<Result<Vec<_>, _>>()?;
        candles.retain(|c| c.close_time <= now);

        if candles.len() > limit {
            candles.drain(..candles.len() - limit);
        }

        validate_candles(&candles)?;

        tracing::debug!(
            symbol = %symbol,
            timeframe = %timeframe,
            count = candles.len(),
            "Fetched candles"
        );

        Ok(candles)
    }

    async fn current_price(&self, symbol: &str) -> Result<f64, MarketDataError> {
        let url = format!("{}/fapi/v1/ticker/price?symbol={}", self.base_url, symbol);

        let ticker: TickerPrice = self
            .get(&url)
            .await?
            .json()
            .await
            .map_err(|e| MarketDataError::InvalidData(format!("ticker payload: {}", e)))?;

        let price = parse_number(&Value::String(ticker.price), "price")?;
        if price <= 0.0 {
            return Err(MarketDataError::InvalidData(format!(
                "Non-positive price {} for {}",
                price, symbol
            )));
        }

        Ok(price)
    }
}

/// Parse one kline row: `[openTime, open, high, low, close, volume, closeTime, ...]`
fn parse_kline(row: &[Value]) -> Result<Candle, MarketDataError> {
    if row.len() < 7 {
        return Err(MarketDataError::InvalidData(format!(
            "kline row has {} fields",
            row.len()
        )));
    }

    Ok(Candle {
        open_time: parse_millis(&row[0], "openTime")?,
        open: parse_number(&row[1], "open")?,
        high: parse_number(&row[2], "high")?,
        low: parse_number(&row[3], "low")?,
        close: parse_number(&row[4], "close")?,
        volume: parse_number(&row[5], "volume")?,
        close_time: parse_millis(&row[6], "closeTime")?,
    })
}

fn parse_number(value: &Value, field: &str) -> Result<f64, MarketDataError> {
    match value {
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
    .ok_or_else(|| MarketDataError::InvalidData(format!("bad {}: {}", field, value)))
}

fn parse_millis(value: &Value, field: &str) -> Result<DateTime<Utc>, MarketDataError> {
    value
        .as_i64()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .ok_or_else(|| MarketDataError::InvalidData(format!("bad {}: {}", field, value)))
}
