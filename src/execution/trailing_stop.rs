use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Direction;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrailingStopError {
    #[error("trailing percent must be in (0, 1), got {0}")]
    InvalidTrailingPercent(f64),

    #[error("entry price must be positive, got {0}")]
    InvalidEntryPrice(f64),
}

/// Trailing stop state for one open position
///
/// `best_price` starts at the entry price and only ever moves in the
/// position's favour: up for LONG, down for SHORT. The tracker has no lock
/// of its own; its owner serialises updates and checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailingStopTracker {
    entry_price: f64,
    best_price: f64,
    trailing_percent: f64,
    direction: Direction,
}

impl TrailingStopTracker {
    pub fn new(
        entry_price: f64,
        trailing_percent: f64,
        direction: Direction,
    ) -> Result<Self, TrailingStopError> {
        if !entry_price.is_finite() || entry_price <= 0.0 {
            return Err(TrailingStopError::InvalidEntryPrice(entry_price));
        }
        if trailing_percent.is_nan() || trailing_percent <= 0.0 || trailing_percent >= 1.0 {
            return Err(TrailingStopError::InvalidTrailingPercent(trailing_percent));
        }

        Ok(Self {
            entry_price,
            best_price: entry_price,
            trailing_percent,
            direction,
        })
    }

    /// Record an observed price; unusable prices are ignored
    pub fn on_price_update(&mut self, price: f64) {
        if !price.is_finite() || price <= 0.0 {
            tracing::warn!(price, "Ignoring invalid price update");
            return;
        }

        let previous = self.best_price;
        self.best_price = match self.direction {
            Direction::Long => self.best_price.max(price),
            Direction::Short => self.best_price.min(price),
        };

        if self.best_price != previous {
            tracing::debug!(
                direction = %self.direction,
                best_price = self.best_price,
                stop_price = self.stop_price(),
                "Trailing stop moved"
            );
        }
    }

    /// Price at which the stop fires
    pub fn stop_price(&self) -> f64 {
        match self.direction {
            Direction::Long => self.best_price * (1.0 - self.trailing_percent),
            Direction::Short => self.best_price * (1.0 + self.trailing_percent),
        }
    }

    pub fn should_trigger_stop(&self, current_price: f64) -> bool {
        if !current_price.is_finite() {
            return false;
        }

        match self.direction {
            Direction::Long => current_price <= self.stop_price(),
            Direction::Short => current_price >= self.stop_price(),
        }
    }

    pub fn entry_price(&self) -> f64 {
        self.entry_price
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn best_price(&self) -> f64 {
        self.best_price
    }

    pub fn trailing_percent(&self) -> f64 {
        self.trailing_percent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let tracker = TrailingStopTracker::new(50_000.0, 0.01, Direction::Long).unwrap();
        assert_eq!(tracker.best_price(), 50_000.0);
        assert_eq!(tracker.entry_price(), 50_000.0);
        assert_eq!(tracker.direction(), Direction::Long);
    }

    #[test]
    fn test_long_trigger_boundary() {
        let mut tracker = TrailingStopTracker::new(50_000.0, 0.01, Direction::Long).unwrap();
        tracker.on_price_update(50_500.0);
        tracker.on_price_update(51_000.0);
        tracker.on_price_update(50_700.0);

        assert_eq!(tracker.best_price(), 51_000.0);
        // 51000 * 0.99 = 50490
        assert!(tracker.should_trigger_stop(50_490.0));
        assert!(!tracker.should_trigger_stop(50_491.0));
    }

    #[test]
    fn test_short_trigger() {
        let mut tracker = TrailingStopTracker::new(50_000.0, 0.02, Direction::Short).unwrap();
        tracker.on_price_update(48_000.0);
        tracker.on_price_update(49_000.0);

        assert_eq!(tracker.best_price(), 48_000.0);
        // 48000 * 1.02 = 48960
        assert!(tracker.should_trigger_stop(49_000.0));
        assert!(!tracker.should_trigger_stop(48_900.0));
    }

    #[test]
    fn test_long_best_price_is_monotonic() {
        let mut tracker = TrailingStopTracker::new(100.0, 0.05, Direction::Long).unwrap();
        let prices = [101.0, 99.0, 105.0, 80.0, 104.9, 110.0, 0.5, 109.0];

        let mut previous = tracker.best_price();
        for price in prices {
            tracker.on_price_update(price);
            assert!(tracker.best_price() >= previous);
            previous = tracker.best_price();
        }
        assert_eq!(tracker.best_price(), 110.0);
    }

    #[test]
    fn test_short_best_price_is_monotonic() {
        let mut tracker = TrailingStopTracker::new(100.0, 0.05, Direction::Short).unwrap();
        let prices = [101.0, 99.0, 105.0, 80.0, 104.9, 110.0, 79.5, 90.0];

        let mut previous = tracker.best_price();
        for price in prices {
            tracker.on_price_update(price);
            assert!(tracker.best_price() <= previous);
            previous = tracker.best_price();
        }
        assert_eq!(tracker.best_price(), 79.5);
    }

    #[test]
    fn test_ignores_invalid_prices() {
        let mut tracker = TrailingStopTracker::new(100.0, 0.05, Direction::Short).unwrap();
        tracker.on_price_update(f64::NAN);
        tracker.on_price_update(0.0);
        tracker.on_price_update(-5.0);
        assert_eq!(tracker.best_price(), 100.0);
        assert!(!tracker.should_trigger_stop(f64::NAN));
    }

    #[test]
    fn test_rejects_bad_parameters() {
        assert!(TrailingStopTracker::new(100.0, 0.0, Direction::Long).is_err());
        assert!(TrailingStopTracker::new(100.0, 1.0, Direction::Long).is_err());
        assert!(TrailingStopTracker::new(0.0, 0.01, Direction::Long).is_err());
        assert!(TrailingStopTracker::new(100.0, f64::NAN, Direction::Long).is_err());
    }
}
