// Evaluation cycle: market data -> indicators -> exit chain -> exchange
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{interval, timeout, MissedTickBehavior};
use uuid::Uuid;

use crate::cache::{IndicatorCache, IndicatorError};
use crate::execution::position_manager::{claim_exit, lock};
use crate::execution::{
    ClosedPosition, ExchangeClient, ExchangeError, PositionError, PositionManager,
};
use crate::exit::{ExitConditionChain, ExitContext};
use crate::market_data::{MarketDataError, MarketDataProvider};
use crate::models::{Direction, Position, PositionStatus, Timeframe};

pub const DEFAULT_PRICE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum EngineError {
    /// Exchange refused the exit; the position stays ExitTriggered for retry
    #[error("exit failed for {direction} {symbol}: {source}")]
    ExitFailed {
        symbol: String,
        direction: Direction,
        #[source]
        source: ExchangeError,
    },

    #[error("entry failed for {direction} {symbol}: {source}")]
    EntryFailed {
        symbol: String,
        direction: Direction,
        #[source]
        source: ExchangeError,
    },

    #[error(transparent)]
    Position(#[from] PositionError),

    #[error(transparent)]
    MarketData(#[from] MarketDataError),
}

/// Result of one evaluation cycle
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    NoPosition,
    /// Market data unavailable; nothing was mutated
    Skipped { reason: String },
    /// No condition fired
    Held { price: f64, indicators_available: bool },
    /// Another cycle is already sending the exit order
    ExitInFlight,
    Exited(ClosedPosition),
}

/// Runs exit evaluation cycles for one (timeframe, exit chain) setup
///
/// Collaborators are shared: several engines may point at the same cache,
/// position manager and exchange.
pub struct ExitEngine {
    market: Arc<dyn MarketDataProvider>,
    cache: Arc<IndicatorCache>,
    positions: Arc<PositionManager>,
    exchange: Arc<dyn ExchangeClient>,
    chain: ExitConditionChain,
    timeframe: Timeframe,
    price_timeout: Duration,
}

impl ExitEngine {
    pub fn new(
        market: Arc<dyn MarketDataProvider>,
        cache: Arc<IndicatorCache>,
        positions: Arc<PositionManager>,
        exchange: Arc<dyn ExchangeClient>,
        chain: ExitConditionChain,
        timeframe: Timeframe,
    ) -> Self {
        Self {
            market,
            cache,
            positions,
            exchange,
            chain,
            timeframe,
            price_timeout: DEFAULT_PRICE_TIMEOUT,
        }
    }

    pub fn with_price_timeout(mut self, price_timeout: Duration) -> Self {
        self.price_timeout = price_timeout;
        self
    }

    pub fn positions(&self) -> &Arc<PositionManager> {
        &self.positions
    }

    /// Open a position at the current market price
    ///
    /// The (symbol, direction) slot is reserved before the price fetch, so
    /// racing callers get `AlreadyOpen` instead of sending a second entry
    /// order. A rejected or failed order releases the slot.
    pub async fn enter_position(
        &self,
        symbol: &str,
        direction: Direction,
        quantity: f64,
        leverage: f64,
    ) -> Result<Uuid, EngineError> {
        let reservation = self.positions.reserve_entry(symbol, direction)?;

        let price = self.current_price(symbol).await?;
        // Validate before any order leaves the process
        self.positions.check_entry(price, quantity, leverage, direction)?;

        let sent = match direction {
            Direction::Long => self.exchange.enter_long_position(symbol, quantity).await,
            Direction::Short => self.exchange.enter_short_position(symbol, quantity).await,
        };
        sent.map_err(|source| EngineError::EntryFailed {
            symbol: symbol.to_string(),
            direction,
            source,
        })?;

        Ok(reservation.commit(price, quantity, leverage)?)
    }

    /// One evaluation cycle for the position on (symbol, direction)
    ///
    /// Prices and indicators are fetched before anything is mutated, so a
    /// market data failure leaves tracker and cache exactly as they were.
    /// A position whose previous exit order failed is re-sent directly.
    pub async fn run_cycle(
        &self,
        symbol: &str,
        direction: Direction,
    ) -> Result<CycleOutcome, EngineError> {
        let Some(entry) = self.positions.get(symbol, direction) else {
            return Ok(CycleOutcome::NoPosition);
        };

        let (pending_retry, in_flight) = {
            let managed = lock(&entry);
            (
                managed.status == PositionStatus::ExitTriggered,
                managed.exit_in_flight(),
            )
        };
        if in_flight {
            return Ok(CycleOutcome::ExitInFlight);
        }

        let price = match self.current_price(symbol).await {
            Ok(price) => price,
            Err(e) => return Ok(skip(symbol, &e)),
        };

        let snapshot = if pending_retry {
            None
        } else {
            match self.cache.get_or_compute(symbol, self.timeframe).await {
                Ok(snapshot) => Some(snapshot),
                Err(IndicatorError::Indeterminate { available, required }) => {
                    tracing::debug!(
                        symbol = %symbol,
                        available,
                        required,
                        "Indicators indeterminate, skipping indicator conditions"
                    );
                    None
                }
                Err(IndicatorError::MarketData(e)) => return Ok(skip(symbol, &e)),
            }
        };

        let claimed = {
            let mut managed = lock(&entry);
            match managed.status {
                PositionStatus::Closed => return Ok(CycleOutcome::NoPosition),
                PositionStatus::ExitTriggered => claim_exit(&mut managed, None),
                PositionStatus::Open => {
                    managed.tracker.on_price_update(price);

                    let reason = {
                        let ctx = ExitContext {
                            position: &managed.position,
                            tracker: &managed.tracker,
                            current_price: price,
                            snapshot: snapshot.as_ref(),
                        };
                        self.chain.first_triggered(&ctx)
                    };

                    match reason {
                        Some(reason) => {
                            tracing::info!(
                                symbol = %symbol,
                                direction = %direction,
                                price,
                                reason = %reason,
                                "Exit triggered"
                            );
                            claim_exit(&mut managed, Some(reason))
                        }
                        None => {
                            return Ok(CycleOutcome::Held {
                                price,
                                indicators_available: snapshot.is_some(),
                            })
                        }
                    }
                }
            }
        };

        match claimed {
            Some(position) => self.submit_exit(&position, price).await,
            None => Ok(CycleOutcome::ExitInFlight),
        }
    }

    /// Run cycles on a fixed interval until the position is gone
    pub async fn run_until_closed(
        &self,
        symbol: &str,
        direction: Direction,
        every: Duration,
    ) -> Option<ClosedPosition> {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            match self.run_cycle(symbol, direction).await {
                Ok(CycleOutcome::Exited(closed)) => return Some(closed),
                Ok(CycleOutcome::NoPosition) => return None,
                Ok(CycleOutcome::Held { price, indicators_available }) => {
                    tracing::debug!(symbol = %symbol, price, indicators_available, "Holding");
                }
                Ok(CycleOutcome::Skipped { .. }) | Ok(CycleOutcome::ExitInFlight) => {}
                Err(e) => {
                    tracing::error!(
                        symbol = %symbol,
                        direction = %direction,
                        error = %e,
                        "Cycle failed"
                    );
                }
            }
        }
    }

    async fn submit_exit(
        &self,
        position: &Position,
        price: f64,
    ) -> Result<CycleOutcome, EngineError> {
        let symbol = position.symbol.as_str();
        let direction = position.direction;

        let sent = match direction {
            Direction::Long => self.exchange.exit_long_position(symbol, position.quantity).await,
            Direction::Short => self.exchange.exit_short_position(symbol, position.quantity).await,
        };

        match sent {
            Ok(()) => {
                let closed = self.positions.confirm_exit(symbol, direction, price)?;
                Ok(CycleOutcome::Exited(closed))
            }
            Err(source) => {
                self.positions.exit_failed(symbol, direction)?;
                tracing::error!(
                    symbol = %symbol,
                    direction = %direction,
                    error = %source,
                    "Exit order rejected"
                );
                Err(EngineError::ExitFailed {
                    symbol: symbol.to_string(),
                    direction,
                    source,
                })
            }
        }
    }

    async fn current_price(&self, symbol: &str) -> Result<f64, MarketDataError> {
        let price = timeout(self.price_timeout, self.market.current_price(symbol))
            .await
            .map_err(|_| MarketDataError::Timeout(self.price_timeout))??;

        if !price.is_finite() || price <= 0.0 {
            return Err(MarketDataError::InvalidData(format!(
                "Unusable price {} for {}",
                price, symbol
            )));
        }
        Ok(price)
    }
}

fn skip(symbol: &str, error: &MarketDataError) -> CycleOutcome {
    tracing::warn!(
        symbol = %symbol,
        error = %error,
        transient = error.is_transient(),
        "Market data unavailable, skipping cycle"
    );
    CycleOutcome::Skipped {
        reason: error.to_string(),
    }
}
