// Position lifecycle, trailing stops and order routing
pub mod exchange;
pub mod position_manager;
pub mod trailing_stop;

pub use exchange::{ExchangeClient, ExchangeError, OrderKind, PaperExchange, PaperOrder};
pub use position_manager::{
    ClosedPosition, EntryReservation, ManagedPosition, PositionError, PositionManager,
};
pub use trailing_stop::{TrailingStopError, TrailingStopTracker};
