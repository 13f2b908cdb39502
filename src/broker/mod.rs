//! Broker gateway boundary: the trait the core trades through, plus the
//! retry/timeout policy applied to every call and an in-process paper broker.
//!
//! The wire protocol of a real brokerage lives behind [`BrokerGateway`];
//! nothing in the core depends on a particular transport.

mod paper;
mod retry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::BrokerResult;
use crate::models::PositionSnapshot;
use crate::trading::SizedOrder;

pub use paper::PaperBroker;
pub use retry::{with_retry, RetryPolicy};

/// Account balances as reported by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub account_id: String,
    pub currency: String,
    pub balance: Decimal,
    pub equity: Decimal,
    pub margin_used: Decimal,
    pub free_margin: Decimal,
    pub as_of: DateTime<Utc>,
}

/// Confirmed fill of a submitted order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderFill {
    pub order_id: String,
    /// Resulting position as the broker sees it
    pub position: PositionSnapshot,
}

/// Confirmed close of a position.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseFill {
    pub position_id: String,
    pub close_price: Decimal,
    pub realized_pl: Decimal,
    pub closed_at: DateTime<Utc>,
}

/// Narrow interface to the brokerage.
///
/// Implementations classify failures through [`crate::error::BrokerError`]
/// so callers can tell transient from terminal errors. Callers wrap every
/// call in [`with_retry`], which also enforces the per-call timeout.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn get_account_snapshot(&self) -> BrokerResult<AccountSnapshot>;

    async fn get_open_positions(&self) -> BrokerResult<Vec<PositionSnapshot>>;

    /// Submit an order. A repeated `idempotency_key` must return the fill of
    /// the original request instead of opening a second position.
    async fn submit_order(&self, order: &SizedOrder, idempotency_key: &str) -> BrokerResult<OrderFill>;

    async fn close_position(&self, position_id: &str) -> BrokerResult<CloseFill>;
}
