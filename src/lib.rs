// Core modules
pub mod cache;
pub mod config;
pub mod engine;
pub mod execution;
pub mod exit;
pub mod indicators;
pub mod market_data;
pub mod models;
pub mod risk;

// Re-export commonly used types
pub use cache::{IndicatorCache, IndicatorError};
pub use engine::{CycleOutcome, EngineError, ExitEngine};
pub use models::*;
