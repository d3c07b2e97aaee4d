use serde::{Deserialize, Serialize};

use super::moving_average::calculate_sma;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BandSide {
    Lower,
    Middle,
    Upper,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerBands {
    pub lower: f64,
    pub middle: f64,
    pub upper: f64,
}

impl BollingerBands {
    pub fn side(&self, side: BandSide) -> f64 {
        match side {
            BandSide::Lower => self.lower,
            BandSide::Middle => self.middle,
            BandSide::Upper => self.upper,
        }
    }
}

/// Calculate Bollinger Bands over the last `period` prices
///
/// middle = SMA(period), bands = middle -/+ k * population stddev.
pub fn calculate_bollinger(prices: &[f64], period: usize, k: f64) -> Option<BollingerBands> {
    let middle = calculate_sma(prices, period)?;

    let variance = prices
        .iter()
        .rev()
        .take(period)
        .map(|p| (p - middle).powi(2))
        .sum::<f64>()
        / period as f64;
    let stddev = variance.sqrt();

    Some(BollingerBands {
        lower: middle - k * stddev,
        middle,
        upper: middle + k * stddev,
    })
}
