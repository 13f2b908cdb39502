//! Data models for signals, positions, closed trades, and metrics.

mod metrics;
mod position;
mod signal;
mod symbol;
mod trade;

pub use metrics::AutoTradingMetrics;
pub use position::{PositionSnapshot, TrackedPosition};
pub use signal::AISignal;
pub use symbol::{SymbolCatalog, SymbolInfo};
pub use trade::{CloseReason, ClosedTrade, TradeSide};
