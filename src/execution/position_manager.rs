use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use thiserror::Error;
use uuid::Uuid;

use super::trailing_stop::{TrailingStopError, TrailingStopTracker};
use crate::exit::ExitReason;
use crate::models::{Direction, Position, PositionStatus};
use crate::risk::{LiquidationRiskModel, RiskError};

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("already have open {direction} position for {symbol}")]
    AlreadyOpen { symbol: String, direction: Direction },

    #[error("no {direction} position for {symbol}")]
    NotFound { symbol: String, direction: Direction },

    #[error("{direction} position for {symbol} has no exit in progress")]
    ExitNotTriggered { symbol: String, direction: Direction },

    #[error("invalid quantity: {0}")]
    InvalidQuantity(f64),

    #[error(transparent)]
    Risk(#[from] RiskError),

    #[error(transparent)]
    TrailingStop(#[from] TrailingStopError),
}

/// Position plus its exit-tracking state
#[derive(Debug, Clone)]
pub struct ManagedPosition {
    pub position: Position,
    pub tracker: TrailingStopTracker,
    pub status: PositionStatus,
    pub exit_reason: Option<ExitReason>,
    pub exit_attempts: u32,
    exit_in_flight: bool,
}

impl ManagedPosition {
    /// True while an exit order has been sent and not yet resolved
    pub fn exit_in_flight(&self) -> bool {
        self.exit_in_flight
    }
}

/// Position that has been confirmed closed
#[derive(Debug, Clone)]
pub struct ClosedPosition {
    pub position: Position,
    pub exit_price: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_reason: Option<ExitReason>,
    pub realized_pnl: f64,
}

type PositionKey = (String, Direction);

/// Open positions keyed by (symbol, direction)
///
/// The map itself sits behind a `RwLock`; every entry has its own mutex so a
/// price update and a stop check on one position are serialised without
/// blocking other positions. Guards are never held across an `.await`.
///
/// Keys claimed through [`PositionManager::reserve_entry`] count as taken
/// until the reservation is committed or dropped.
pub struct PositionManager {
    positions: RwLock<HashMap<PositionKey, Arc<Mutex<ManagedPosition>>>>,
    pending: Mutex<HashSet<PositionKey>>,
    trailing_percent: f64,
}

/// Exclusive claim on a (symbol, direction) slot while an entry order is out
///
/// Dropping it without [`EntryReservation::commit`] frees the slot again.
#[must_use]
pub struct EntryReservation<'a> {
    manager: &'a PositionManager,
    key: PositionKey,
}

impl EntryReservation<'_> {
    /// Register the filled entry under the reserved key
    pub fn commit(
        self,
        entry_price: f64,
        quantity: f64,
        leverage: f64,
    ) -> Result<Uuid, PositionError> {
        let (symbol, direction) = &self.key;
        self.manager
            .insert_position(symbol, *direction, entry_price, quantity, leverage, true)
    }
}

impl Drop for EntryReservation<'_> {
    fn drop(&mut self) {
        self.manager.pending_keys().remove(&self.key);
    }
}

impl PositionManager {
    /// # Arguments
    /// * `trailing_percent` - Trailing stop distance for new positions (0.01 = 1%)
    pub fn new(trailing_percent: f64) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            trailing_percent,
        }
    }

    pub fn enter_long_position(
        &self,
        symbol: &str,
        entry_price: f64,
        quantity: f64,
        leverage: f64,
    ) -> Result<Uuid, PositionError> {
        self.insert_position(symbol, Direction::Long, entry_price, quantity, leverage, false)
    }

    pub fn enter_short_position(
        &self,
        symbol: &str,
        entry_price: f64,
        quantity: f64,
        leverage: f64,
    ) -> Result<Uuid, PositionError> {
        self.insert_position(symbol, Direction::Short, entry_price, quantity, leverage, false)
    }

    /// Claim the (symbol, direction) slot before sending an entry order
    ///
    /// Fails with `AlreadyOpen` if a position exists or another entry for the
    /// same key is already in progress.
    pub fn reserve_entry(
        &self,
        symbol: &str,
        direction: Direction,
    ) -> Result<EntryReservation<'_>, PositionError> {
        let key = (symbol.to_string(), direction);

        // Held so a concurrent insert cannot slip between the two checks
        let positions = self.read_map();
        let mut pending = self.pending_keys();
        if positions.contains_key(&key) || !pending.insert(key.clone()) {
            return Err(PositionError::AlreadyOpen {
                symbol: symbol.to_string(),
                direction,
            });
        }

        Ok(EntryReservation { manager: self, key })
    }

    /// Check entry parameters without touching any state
    pub fn check_entry(
        &self,
        entry_price: f64,
        quantity: f64,
        leverage: f64,
        direction: Direction,
    ) -> Result<f64, PositionError> {
        if !quantity.is_finite() || quantity <= 0.0 {
            return Err(PositionError::InvalidQuantity(quantity));
        }
        TrailingStopTracker::new(entry_price, self.trailing_percent, direction)?;
        Ok(LiquidationRiskModel::liquidation_price(entry_price, leverage, direction)?)
    }

    fn insert_position(
        &self,
        symbol: &str,
        direction: Direction,
        entry_price: f64,
        quantity: f64,
        leverage: f64,
        reserved: bool,
    ) -> Result<Uuid, PositionError> {
        let liquidation_price = self.check_entry(entry_price, quantity, leverage, direction)?;
        let tracker = TrailingStopTracker::new(entry_price, self.trailing_percent, direction)?;

        let mut positions = self.write_map();
        let key = (symbol.to_string(), direction);
        let taken_by_entry = !reserved && self.pending_keys().contains(&key);
        if positions.contains_key(&key) || taken_by_entry {
            return Err(PositionError::AlreadyOpen {
                symbol: symbol.to_string(),
                direction,
            });
        }

        let id = Uuid::new_v4();
        let position = Position {
            id,
            symbol: symbol.to_string(),
            direction,
            entry_price,
            quantity,
            leverage,
            opened_at: Utc::now(),
        };

        tracing::info!(
            symbol = %symbol,
            direction = %direction,
            entry_price,
            quantity,
            leverage,
            liquidation_price,
            "Opened position"
        );

        positions.insert(
            key,
            Arc::new(Mutex::new(ManagedPosition {
                position,
                tracker,
                status: PositionStatus::Open,
                exit_reason: None,
                exit_attempts: 0,
                exit_in_flight: false,
            })),
        );

        Ok(id)
    }

    /// Shared handle to a live position
    pub fn get(&self, symbol: &str, direction: Direction) -> Option<Arc<Mutex<ManagedPosition>>> {
        self.read_map()
            .get(&(symbol.to_string(), direction))
            .cloned()
    }

    pub fn has_open_position(&self, symbol: &str, direction: Direction) -> bool {
        self.read_map()
            .contains_key(&(symbol.to_string(), direction))
    }

    /// Copy of every live position (open or exit-triggered)
    pub fn open_positions(&self) -> Vec<ManagedPosition> {
        self.read_map()
            .values()
            .map(|entry| lock(entry).clone())
            .collect()
    }

    /// Claim the right to send an exit order
    ///
    /// Moves an `Open` position to `ExitTriggered`, or re-claims an
    /// `ExitTriggered` position whose previous order failed. Returns `None`
    /// while another exit order for this position is still in flight.
    pub fn begin_exit(
        &self,
        symbol: &str,
        direction: Direction,
        reason: Option<ExitReason>,
    ) -> Result<Option<Position>, PositionError> {
        let entry = self.require(symbol, direction)?;
        let mut managed = lock(&entry);
        Ok(claim_exit(&mut managed, reason))
    }

    /// Record a failed exit order; the position stays `ExitTriggered`
    pub fn exit_failed(&self, symbol: &str, direction: Direction) -> Result<(), PositionError> {
        let entry = self.require(symbol, direction)?;
        let mut managed = lock(&entry);

        if managed.status != PositionStatus::ExitTriggered {
            return Err(PositionError::ExitNotTriggered {
                symbol: symbol.to_string(),
                direction,
            });
        }

        managed.exit_in_flight = false;
        managed.exit_attempts += 1;

        tracing::warn!(
            symbol = %symbol,
            direction = %direction,
            attempts = managed.exit_attempts,
            "Exit order failed, will retry next cycle"
        );
        Ok(())
    }

    /// Exchange confirmed the fill: close and forget the position
    pub fn confirm_exit(
        &self,
        symbol: &str,
        direction: Direction,
        exit_price: f64,
    ) -> Result<ClosedPosition, PositionError> {
        let key = (symbol.to_string(), direction);
        let mut positions = self.write_map();

        let entry = positions.get(&key).cloned().ok_or_else(|| PositionError::NotFound {
            symbol: symbol.to_string(),
            direction,
        })?;

        let closed = {
            let mut managed = lock(&entry);
            if managed.status != PositionStatus::ExitTriggered {
                return Err(PositionError::ExitNotTriggered {
                    symbol: symbol.to_string(),
                    direction,
                });
            }

            managed.status = PositionStatus::Closed;
            managed.exit_in_flight = false;

            ClosedPosition {
                position: managed.position.clone(),
                exit_price,
                exit_time: Utc::now(),
                exit_reason: managed.exit_reason.clone(),
                realized_pnl: managed.position.pnl_at(exit_price),
            }
        };

        positions.remove(&key);

        tracing::info!(
            symbol = %symbol,
            direction = %direction,
            exit_price,
            pnl = closed.realized_pnl,
            "Closed position"
        );

        Ok(closed)
    }

    fn require(
        &self,
        symbol: &str,
        direction: Direction,
    ) -> Result<Arc<Mutex<ManagedPosition>>, PositionError> {
        self.get(symbol, direction).ok_or_else(|| PositionError::NotFound {
            symbol: symbol.to_string(),
            direction,
        })
    }

    fn pending_keys(&self) -> std::sync::MutexGuard<'_, HashSet<PositionKey>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_map(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<PositionKey, Arc<Mutex<ManagedPosition>>>> {
        self.positions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_map(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<PositionKey, Arc<Mutex<ManagedPosition>>>> {
        self.positions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Transition a locked position into an in-flight exit, if allowed
pub(crate) fn claim_exit(
    managed: &mut ManagedPosition,
    reason: Option<ExitReason>,
) -> Option<Position> {
    match managed.status {
        PositionStatus::Closed => None,
        _ if managed.exit_in_flight => None,
        PositionStatus::Open => {
            managed.status = PositionStatus::ExitTriggered;
            managed.exit_reason = reason;
            managed.exit_in_flight = true;
            Some(managed.position.clone())
        }
        PositionStatus::ExitTriggered => {
            if managed.exit_reason.is_none() {
                managed.exit_reason = reason;
            }
            managed.exit_in_flight = true;
            Some(managed.position.clone())
        }
    }
}

/// Lock a position, recovering the data if a holder panicked
pub(crate) fn lock(entry: &Mutex<ManagedPosition>) -> MutexGuard<'_, ManagedPosition> {
    entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
