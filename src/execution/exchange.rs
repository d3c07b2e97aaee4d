use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("exchange unavailable: {0}")]
    Unavailable(String),
}

/// Order routing collaborator
///
/// Exit calls are made at most once per triggered exit; the duplicate-exit
/// guard lives in the position manager, not here.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn enter_long_position(&self, symbol: &str, quantity: f64) -> Result<(), ExchangeError>;
    async fn enter_short_position(&self, symbol: &str, quantity: f64) -> Result<(), ExchangeError>;
    async fn exit_long_position(&self, symbol: &str, quantity: f64) -> Result<(), ExchangeError>;
    async fn exit_short_position(&self, symbol: &str, quantity: f64) -> Result<(), ExchangeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    EnterLong,
    EnterShort,
    ExitLong,
    ExitShort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperOrder {
    pub symbol: String,
    pub kind: OrderKind,
    pub quantity: f64,
    pub timestamp: DateTime<Utc>,
}

/// In-memory exchange that fills every order instantly
#[derive(Default)]
pub struct PaperExchange {
    orders: Mutex<Vec<PaperOrder>>,
    reject_exits: AtomicBool,
}

impl PaperExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make exit orders fail until switched back
    pub fn set_reject_exits(&self, reject: bool) {
        self.reject_exits.store(reject, Ordering::SeqCst);
    }

    /// All filled orders, oldest first
    pub fn orders(&self) -> Vec<PaperOrder> {
        self.orders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record(&self, symbol: &str, kind: OrderKind, quantity: f64) -> Result<(), ExchangeError> {
        let is_exit = matches!(kind, OrderKind::ExitLong | OrderKind::ExitShort);
        if is_exit && self.reject_exits.load(Ordering::SeqCst) {
            return Err(ExchangeError::Rejected(format!(
                "paper exchange rejecting {:?} {}",
                kind, symbol
            )));
        }

        if quantity.is_nan() || quantity <= 0.0 {
            return Err(ExchangeError::Rejected(format!("invalid quantity {}", quantity)));
        }

        tracing::info!(symbol = %symbol, kind = ?kind, quantity, "Paper order filled");

        self.orders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(PaperOrder {
                symbol: symbol.to_string(),
                kind,
                quantity,
                timestamp: Utc::now(),
            });
        Ok(())
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn enter_long_position(&self, symbol: &str, quantity: f64) -> Result<(), ExchangeError> {
        self.record(symbol, OrderKind::EnterLong, quantity)
    }

    async fn enter_short_position(&self, symbol: &str, quantity: f64) -> Result<(), ExchangeError> {
        self.record(symbol, OrderKind::EnterShort, quantity)
    }

    async fn exit_long_position(&self, symbol: &str, quantity: f64) -> Result<(), ExchangeError> {
        self.record(symbol, OrderKind::ExitLong, quantity)
    }

    async fn exit_short_position(&self, symbol: &str, quantity: f64) -> Result<(), ExchangeError> {
        self.record(symbol, OrderKind::ExitShort, quantity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_orders_in_sequence() {
        let exchange = PaperExchange::new();
        exchange.enter_long_position("BTCUSDT", 0.5).await.unwrap();
        exchange.exit_long_position("BTCUSDT", 0.5).await.unwrap();

        let orders = exchange.orders();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].kind, OrderKind::EnterLong);
        assert_eq!(orders[1].kind, OrderKind::ExitLong);
    }

    #[tokio::test]
    async fn test_reject_exits_only() {
        let exchange = PaperExchange::new();
        exchange.set_reject_exits(true);

        assert!(exchange.enter_short_position("ETHUSDT", 1.0).await.is_ok());
        let err = exchange.exit_short_position("ETHUSDT", 1.0).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected(_)));
        assert_eq!(exchange.orders().len(), 1);

        exchange.set_reject_exits(false);
        assert!(exchange.exit_short_position("ETHUSDT", 1.0).await.is_ok());
    }

    #[tokio::test]
    async fn test_rejects_zero_quantity() {
        let exchange = PaperExchange::new();
        assert!(exchange.enter_long_position("BTCUSDT", 0.0).await.is_err());
        assert!(exchange.enter_long_position("BTCUSDT", f64::NAN).await.is_err());
        assert!(exchange.orders().is_empty());
    }
}
