/// Calculate Relative Strength Index (RSI) with Wilder's smoothing
///
/// The first average gain/loss is the simple mean of the first `period`
/// changes; every later change is folded in as
/// `avg = (avg * (period - 1) + change) / period`.
///
/// Values:
/// - RSI > 70: Overbought
/// - RSI < 30: Oversold
///
/// Returns `None` with fewer than `period + 1` prices, or when the series is
/// completely flat (no gains and no losses).
pub fn calculate_rsi(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }

    let changes: Vec<f64> = prices.windows(2).map(|w| w[1] - w[0]).collect();

    let mut avg_gain = changes[..period].iter().map(|c| c.max(0.0)).sum::<f64>() / period as f64;
    let mut avg_loss =
        changes[..period].iter().map(|c| (-c).max(0.0)).sum::<f64>() / period as f64;

    let smoothing = (period - 1) as f64;
    for change in &changes[period..] {
        avg_gain = (avg_gain * smoothing + change.max(0.0)) / period as f64;
        avg_loss = (avg_loss * smoothing + (-change).max(0.0)) / period as f64;
    }

    if avg_loss == 0.0 {
        if avg_gain == 0.0 {
            return None;
        }
        return Some(100.0);
    }

    let rs = avg_gain / avg_loss;
    Some(100.0 - (100.0 / (1.0 + rs)))
}
