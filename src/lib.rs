//! Autonomous, risk-bounded execution of AI trading signals.
//!
//! Signals flow through the [`trading::RiskManager`] into the
//! [`trading::OrderExecutor`], positions are kept in the
//! [`trading::PositionTracker`], and the [`sync::AccountSyncService`]
//! reconciles them with the broker account. [`engine::AutoTradingEngine`]
//! drives the cycle; [`context::TradingContext`] wires everything together.

pub mod broker;
pub mod context;
pub mod credentials;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod journal;
pub mod metrics;
pub mod models;
pub mod scheduler;
pub mod signals;
pub mod sync;
pub mod trading;
