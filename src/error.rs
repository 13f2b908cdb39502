//! Error taxonomy for the trading core.
//!
//! - [`ConfigError`]: invalid configuration, fatal to `start()`
//! - [`RiskRejection`]: per-signal, recoverable; the engine skips and continues
//! - [`BrokerError`]: gateway failures, split into transient and terminal
//! - [`ExecutionError`]: order could not be placed; the trade is skipped
//! - [`SyncError`]: captured in the sync state, never affects the engine
//! - [`EngineError`]: lifecycle misuse and fatal engine faults

use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::engine::EngineState;

/// Invalid or self-contradictory trading configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("No trading configuration loaded")]
    Missing,

    #[error("Every allowed symbol is also excluded")]
    ContradictorySymbols,

    #[error("Allowed symbol list is empty")]
    EmptyAllowList,

    #[error("{field} must be in (0, 100], got {value}")]
    PercentOutOfRange { field: &'static str, value: Decimal },

    #[error("Confidence threshold must be in [0, 1], got {0}")]
    ConfidenceOutOfRange(f64),

    #[error("Daily loss limit {daily}% is below per-trade risk {per_trade}%")]
    DailyBelowPerTrade { daily: Decimal, per_trade: Decimal },

    #[error("Cycle interval must be at least one second")]
    ZeroInterval,
}

/// Reason a signal was refused by the risk manager.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RiskRejection {
    #[error("Symbol {symbol} is excluded or not in the allow list")]
    SymbolExcluded { symbol: String },

    #[error("A position on {symbol} is already open")]
    PositionAlreadyOpen { symbol: String },

    #[error("Confidence {confidence:.2} below threshold {threshold:.2}")]
    ConfidenceTooLow { confidence: f64, threshold: f64 },

    #[error("Confidence {0} outside 0.0 to 1.0")]
    ConfidenceOutOfRange(f64),

    #[error("Daily loss limit exceeded: projected loss {projected} > limit {limit}")]
    DailyLossLimitExceeded { projected: Decimal, limit: Decimal },

    #[error("Invalid stop distance for {symbol}: {reason}")]
    InvalidStopDistance { symbol: String, reason: String },

    #[error("Sized volume {volume} below minimum {minimum} for {symbol}")]
    VolumeBelowMinimum {
        symbol: String,
        volume: Decimal,
        minimum: Decimal,
    },
}

/// Failure reported by (or while talking to) the broker gateway.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("Broker call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Broker temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("Order rejected by broker: {0}")]
    Rejected(String),

    #[error("Unknown position: {0}")]
    UnknownPosition(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),
}

impl BrokerError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Timeout(_) | BrokerError::Network(_) | BrokerError::Unavailable(_)
        )
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Outcome of a retried broker call that did not succeed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Terminal broker error: {0}")]
    Terminal(BrokerError),

    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: BrokerError },

    #[error("Cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl ExecutionError {
    pub fn attempts(&self) -> u32 {
        match self {
            ExecutionError::Terminal(_) => 1,
            ExecutionError::RetriesExhausted { attempts, .. } => *attempts,
            ExecutionError::Cancelled { attempts } => *attempts,
        }
    }
}

/// Account reconciliation failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Failed to fetch account snapshot: {0}")]
    AccountFetch(ExecutionError),

    #[error("Failed to fetch open positions: {0}")]
    PositionsFetch(ExecutionError),

    #[error("Sync cancelled")]
    Cancelled,
}

/// Engine lifecycle errors and fatal faults.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine already running (state: {0})")]
    AlreadyRunning(EngineState),

    #[error("Engine not running (state: {0})")]
    NotRunning(EngineState),

    #[error("Engine not paused (state: {0})")]
    NotPaused(EngineState),

    #[error("Configuration can only be replaced while idle or stopped (state: {0})")]
    ConfigLocked(EngineState),

    #[error("Could not establish session baseline: {0}")]
    Baseline(ExecutionError),

    #[error("Inconsistent state transition {from} -> {to}")]
    InvalidTransition { from: EngineState, to: EngineState },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BrokerError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(BrokerError::Network("reset".into()).is_transient());
        assert!(!BrokerError::Rejected("insufficient margin".into()).is_transient());
        assert!(!BrokerError::Authentication("bad key".into()).is_transient());
    }
}
