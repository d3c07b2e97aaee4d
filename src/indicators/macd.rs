use super::moving_average::ema_series;

/// MACD line, signal line and histogram at the last candle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdValue {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Calculate MACD: EMA(fast) - EMA(slow), with the signal line being the
/// EMA(signal) of the MACD series
///
/// Needs at least `slow + signal - 1` prices.
pub fn calculate_macd(
    prices: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> Option<MacdValue> {
    let line = macd_series(prices, fast, slow);
    let macd = *line.last()?;
    let signal = *ema_series(&line, signal).last()?;

    Some(MacdValue {
        macd,
        signal,
        histogram: macd - signal,
    })
}

/// MACD line for every candle from index `slow - 1` onwards
pub fn macd_series(prices: &[f64], fast: usize, slow: usize) -> Vec<f64> {
    if fast == 0 || fast >= slow {
        return Vec::new();
    }

    let fast_ema = ema_series(prices, fast);
    let slow_ema = ema_series(prices, slow);
    if slow_ema.is_empty() {
        return Vec::new();
    }

    // fast_ema[k] is at candle k + fast - 1, slow_ema[k] at k + slow - 1
    let offset = slow - fast;
    slow_ema
        .iter()
        .enumerate()
        .map(|(k, slow_value)| fast_ema[k + offset] - slow_value)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macd_insufficient_data() {
        let prices: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        // 26 + 9 - 1 = 34 needed for the signal line
        assert!(calculate_macd(&prices, 12, 26, 9).is_none());
        assert_eq!(macd_series(&prices, 12, 26).len(), 5);
    }

    #[test]
    fn test_macd_constant_prices_is_zero() {
        let prices = vec![50.0; 40];
        let value = calculate_macd(&prices, 12, 26, 9).unwrap();
        assert_eq!(value.macd, 0.0);
        assert_eq!(value.signal, 0.0);
        assert_eq!(value.histogram, 0.0);
    }

    #[test]
    fn test_macd_positive_in_uptrend() {
        let prices: Vec<f64> = (0..60).map(|i| 100.0 + i as f64 * 0.5).collect();
        let value = calculate_macd(&prices, 12, 26, 9).unwrap();
        assert!(value.macd > 0.0);
        assert!(value.signal > 0.0);
    }

    #[test]
    fn test_macd_rejects_inverted_periods() {
        let prices = vec![1.0; 50];
        assert!(calculate_macd(&prices, 26, 12, 9).is_none());
    }
}
