use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::TAU;
use std::sync::Mutex;

use super::{MarketDataError, MarketDataProvider};
use crate::models::{Candle, Timeframe};

/// Market scenario types for synthetic data generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketScenario {
    /// Climbs 20% over ~11 days, then retraces over ~3
    Uptrend,
    /// Mirror image of `Uptrend`
    Downtrend,
    /// Choppy market, ±1% around the base on a 12h wave
    Sideways,
    /// ±5% daily swings with heavier noise
    Volatile,
}

impl std::str::FromStr for MarketScenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "uptrend" => Ok(MarketScenario::Uptrend),
            "downtrend" => Ok(MarketScenario::Downtrend),
            "sideways" => Ok(MarketScenario::Sideways),
            "volatile" => Ok(MarketScenario::Volatile),
            other => Err(format!("Unknown scenario: {}", other)),
        }
    }
}

/// Minutes in one trend cycle; trends rise (or fall) for 80% of it and retrace
/// for the rest, so the series never jumps when a cycle wraps
const TREND_CYCLE_MINUTES: i64 = 20_000;
const TREND_AMPLITUDE: f64 = 0.2;

/// Deterministic synthetic market for paper runs
///
/// Prices live on a single one-minute grid counted from the Unix epoch. A
/// candle of any timeframe closes at the grid price of its last minute, and
/// the live price is the grid price of the current minute, so live prices and
/// candle closes always come from the same series. Repeated fetches inside one
/// interval return an identical window.
pub struct SyntheticMarketData {
    seed: u64,
    scenario: MarketScenario,
    base_price: f64,
    jitter: Mutex<StdRng>,
}

impl SyntheticMarketData {
    /// Create a new generator with a seed for reproducibility
    pub fn new(seed: u64, scenario: MarketScenario, base_price: f64) -> Self {
        Self {
            seed,
            scenario,
            base_price,
            jitter: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Candles for the `limit` intervals that closed at or before `now`
    pub fn candles_at(
        &self,
        timeframe: Timeframe,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Vec<Candle> {
        let minutes = timeframe.duration().num_minutes();
        // Index of the newest fully closed candle
        let last = now.timestamp() / 60 / minutes - 1;
        let first = (last - limit as i64 + 1).max(0);

        (first..=last)
            .filter_map(|i| self.candle(i, minutes))
            .collect()
    }

    /// Grid price for the minute containing `at`, without live jitter
    pub fn price_at(&self, at: DateTime<Utc>) -> f64 {
        self.minute_price(at.timestamp().div_euclid(60))
    }

    fn candle(&self, index: i64, minutes: i64) -> Option<Candle> {
        let first_minute = index * minutes;
        let last_minute = first_minute + minutes - 1;

        let open_time = Utc.timestamp_opt(first_minute * 60, 0).single()?;
        let close_time = open_time + Duration::minutes(minutes) - Duration::milliseconds(1);

        let open = self.minute_price(first_minute - 1);
        let close = self.minute_price(last_minute);
        let mut rng = self.rng_for(last_minute.wrapping_mul(31));
        let wick = close * rng.gen_range(0.0..0.002);

        Some(Candle {
            open_time,
            close_time,
            open,
            high: open.max(close) + wick,
            low: (open.min(close) - wick).max(f64::MIN_POSITIVE),
            close,
            volume: 1_000_000.0 * minutes as f64 * rng.gen_range(0.5..1.5),
        })
    }

    fn minute_price(&self, minute: i64) -> f64 {
        let mut rng = self.rng_for(minute);
        let m = minute as f64;

        let factor = match self.scenario {
            MarketScenario::Uptrend => 1.0 + trend(minute) + rng.gen_range(-0.001..0.001),
            MarketScenario::Downtrend => 1.0 - trend(minute) + rng.gen_range(-0.001..0.001),
            MarketScenario::Sideways => {
                1.0 + (m * TAU / 720.0).sin() * 0.01 + rng.gen_range(-0.001..0.001)
            }
            MarketScenario::Volatile => {
                1.0 + (m * TAU / 1440.0).sin() * 0.05 + rng.gen_range(-0.003..0.003)
            }
        };

        self.base_price * factor
    }

    fn rng_for(&self, index: i64) -> StdRng {
        StdRng::seed_from_u64(self.seed ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }
}

/// Continuous sawtooth-with-retrace in [0, TREND_AMPLITUDE]
fn trend(minute: i64) -> f64 {
    let rise = TREND_CYCLE_MINUTES * 4 / 5;
    let t = minute.rem_euclid(TREND_CYCLE_MINUTES);

    let phase = if t < rise {
        t as f64 / rise as f64
    } else {
        (TREND_CYCLE_MINUTES - t) as f64 / (TREND_CYCLE_MINUTES - rise) as f64
    };
    TREND_AMPLITUDE * phase
}

#[async_trait]
impl MarketDataProvider for SyntheticMarketData {
    async fn fetch_candles(
        &self,
        _symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, MarketDataError> {
        Ok(self.candles_at(timeframe, limit, Utc::now()))
    }

    async fn current_price(&self, _symbol: &str) -> Result<f64, MarketDataError> {
        let last = self.price_at(Utc::now());
        let noise = self
            .jitter
            .lock()
            .map_err(|e| MarketDataError::ExchangeUnavailable(e.to_string()))?
            .gen_range(-0.0005..0.0005);
        Ok(last * (1.0 + noise))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::validate_candles;

    #[test]
    fn test_same_window_within_interval() {
        let market = SyntheticMarketData::new(42, MarketScenario::Sideways, 100.0);
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 7, 0).unwrap();

        let a = market.candles_at(Timeframe::M5, 50, now);
        let b = market.candles_at(Timeframe::M5, 50, now + Duration::minutes(2));

        assert_eq!(a, b);
        assert_eq!(a.len(), 50);
    }

    #[test]
    fn test_new_candle_after_boundary() {
        let market = SyntheticMarketData::new(42, MarketScenario::Uptrend, 100.0);
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 7, 0).unwrap();

        let before = market.candles_at(Timeframe::M5, 10, now);
        let after = market.candles_at(Timeframe::M5, 10, now + Duration::minutes(5));

        assert!(after.last().unwrap().close_time > before.last().unwrap().close_time);
        assert!(after.last().unwrap().close_time <= now + Duration::minutes(5));
    }

    #[test]
    fn test_generated_candles_are_valid() {
        for scenario in [
            MarketScenario::Uptrend,
            MarketScenario::Downtrend,
            MarketScenario::Sideways,
            MarketScenario::Volatile,
        ] {
            let market = SyntheticMarketData::new(7, scenario, 50_000.0);
            let candles = market.candles_at(Timeframe::H1, 100, Utc::now());
            assert!(validate_candles(&candles).is_ok(), "{:?}", scenario);
        }
    }

    #[test]
    fn test_different_seeds_differ() {
        let now = Utc::now();
        let a = SyntheticMarketData::new(1, MarketScenario::Volatile, 100.0)
            .candles_at(Timeframe::M5, 5, now);
        let b = SyntheticMarketData::new(2, MarketScenario::Volatile, 100.0)
            .candles_at(Timeframe::M5, 5, now);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_current_price_near_base() {
        let market = SyntheticMarketData::new(3, MarketScenario::Sideways, 100.0);
        let price = market.current_price("BTCUSDT").await.unwrap();
        assert!(price > 95.0 && price < 105.0);
    }

    #[test]
    fn test_candle_closes_share_the_live_series() {
        let market = SyntheticMarketData::new(11, MarketScenario::Uptrend, 50_000.0);
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 7, 30).unwrap();

        for timeframe in [Timeframe::M1, Timeframe::M15, Timeframe::H1, Timeframe::H4] {
            let candles = market.candles_at(timeframe, 20, now);
            let last = candles.last().unwrap();
            assert_eq!(last.close, market.price_at(last.close_time), "{:?}", timeframe);
        }

        // Latest 1m close is the previous minute of the live grid
        let m1 = market.candles_at(Timeframe::M1, 1, now);
        assert_eq!(m1[0].close, market.price_at(now - Duration::minutes(1)));
    }

    #[test]
    fn test_trend_has_no_jump_at_cycle_wrap() {
        let market = SyntheticMarketData::new(5, MarketScenario::Uptrend, 50_000.0);

        let wrap = TREND_CYCLE_MINUTES * 1_500;
        let mut previous = market.minute_price(wrap - 100);
        for minute in (wrap - 99)..(wrap + 100) {
            let price = market.minute_price(minute);
            assert!((price / previous - 1.0).abs() < 0.005, "minute {}", minute);
            previous = price;
        }
    }
}
