//! Trading logic: configuration, risk validation and sizing, order
//! execution, and the open-position map.

mod config;
mod executor;
mod position_tracker;
mod risk;

pub use config::{TradingConfig, TradingMode};
pub use executor::OrderExecutor;
pub use position_tracker::{PositionTracker, UpsertOutcome};
pub use risk::{Exposure, RiskManager, SizedOrder};
