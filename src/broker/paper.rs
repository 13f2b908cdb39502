//! In-process simulated broker for paper trading and tests.
//!
//! Fills at the order's entry price (or the latest mark), deduplicates
//! submissions by idempotency key, and settles realized P/L into the balance.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{AccountSnapshot, BrokerGateway, CloseFill, OrderFill};
use crate::error::{BrokerError, BrokerResult};
use crate::models::{PositionSnapshot, SymbolCatalog};
use crate::trading::SizedOrder;

#[derive(Debug, Default)]
struct PaperState {
    balance: Decimal,
    positions: HashMap<String, PositionSnapshot>,
    fills_by_key: HashMap<String, OrderFill>,
    marks: HashMap<String, Decimal>,
    next_id: u64,
}

/// Simulated brokerage account.
pub struct PaperBroker {
    account_id: String,
    currency: String,
    catalog: Arc<SymbolCatalog>,
    state: Mutex<PaperState>,
}

impl PaperBroker {
    pub fn new(account_id: impl Into<String>, balance: Decimal, catalog: Arc<SymbolCatalog>) -> Self {
        Self {
            account_id: account_id.into(),
            currency: "USD".to_string(),
            catalog,
            state: Mutex::new(PaperState {
                balance,
                ..Default::default()
            }),
        }
    }

    /// Set the current market price of a symbol, repricing open positions.
    pub async fn mark_price(&self, symbol: &str, price: Decimal) {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.marks.insert(symbol.to_uppercase(), price);
        for position in state.positions.values_mut() {
            if position.symbol.eq_ignore_ascii_case(symbol) {
                position.current_price = price;
                position.updated_at = now;
            }
        }
    }

    /// Number of distinct fills ever made.
    pub async fn fill_count(&self) -> usize {
        self.state.lock().await.fills_by_key.len()
    }

    fn unrealized(&self, position: &PositionSnapshot) -> Decimal {
        let info = self.catalog.info(&position.symbol);
        (position.current_price - position.open_price)
            * position.side.sign()
            * position.volume
            * info.units_per_lot()
    }
}

#[async_trait]
impl BrokerGateway for PaperBroker {
    fn name(&self) -> &str {
        "paper"
    }

    async fn get_account_snapshot(&self) -> BrokerResult<AccountSnapshot> {
        let state = self.state.lock().await;
        let unrealized: Decimal = state.positions.values().map(|p| self.unrealized(p)).sum();
        let equity = state.balance + unrealized;

        Ok(AccountSnapshot {
            account_id: self.account_id.clone(),
            currency: self.currency.clone(),
            balance: state.balance,
            equity,
            margin_used: Decimal::ZERO,
            free_margin: equity,
            as_of: Utc::now(),
        })
    }

    async fn get_open_positions(&self) -> BrokerResult<Vec<PositionSnapshot>> {
        let state = self.state.lock().await;
        Ok(state.positions.values().cloned().collect())
    }

    async fn submit_order(&self, order: &SizedOrder, idempotency_key: &str) -> BrokerResult<OrderFill> {
        let mut state = self.state.lock().await;

        if let Some(fill) = state.fills_by_key.get(idempotency_key) {
            debug!(key = %idempotency_key, "Duplicate submission, returning original fill");
            return Ok(fill.clone());
        }

        if order.volume <= Decimal::ZERO {
            return Err(BrokerError::Rejected(format!("invalid volume {}", order.volume)));
        }

        let price = state
            .marks
            .get(&order.symbol.to_uppercase())
            .copied()
            .unwrap_or(order.entry_price);

        state.next_id += 1;
        let now = Utc::now();
        let position = PositionSnapshot {
            id: format!("paper-{}", state.next_id),
            symbol: order.symbol.clone(),
            side: order.side,
            volume: order.volume,
            open_price: price,
            current_price: price,
            stop_loss: Some(order.stop_loss),
            take_profit: Some(order.take_profit),
            opened_at: now,
            updated_at: now,
        };

        let fill = OrderFill {
            order_id: format!("order-{}", state.next_id),
            position: position.clone(),
        };

        state.positions.insert(position.id.clone(), position);
        state.fills_by_key.insert(idempotency_key.to_string(), fill.clone());

        info!(
            order_id = %fill.order_id,
            symbol = %order.symbol,
            side = %order.side,
            volume = %order.volume,
            price = %price,
            "[PAPER] Order filled"
        );

        Ok(fill)
    }

    async fn close_position(&self, position_id: &str) -> BrokerResult<CloseFill> {
        let mut state = self.state.lock().await;

        let position = state
            .positions
            .remove(position_id)
            .ok_or_else(|| BrokerError::UnknownPosition(position_id.to_string()))?;

        let realized_pl = self.unrealized(&position);
        state.balance += realized_pl;

        info!(
            position_id = %position_id,
            realized_pl = %realized_pl,
            "[PAPER] Position closed"
        );

        Ok(CloseFill {
            position_id: position.id,
            close_price: position.current_price,
            realized_pl,
            closed_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TradeSide;
    use rust_decimal_macros::dec;

    fn order() -> SizedOrder {
        SizedOrder {
            signal_id: "sig-1".to_string(),
            symbol: "EURUSD".to_string(),
            side: TradeSide::Buy,
            volume: dec!(0.5),
            entry_price: dec!(1.1000),
            stop_loss: dec!(1.0980),
            take_profit: dec!(1.1040),
            risk_amount: dec!(100),
            stop_distance_pips: dec!(20),
        }
    }

    fn broker() -> PaperBroker {
        PaperBroker::new("paper-1", dec!(10000), Arc::new(SymbolCatalog::new()))
    }

    #[tokio::test]
    async fn test_same_key_fills_once() {
        let broker = broker();

        let first = broker.submit_order(&order(), "key-1").await.unwrap();
        let second = broker.submit_order(&order(), "key-1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(broker.fill_count().await, 1);
        assert_eq!(broker.get_open_positions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_close_settles_into_balance() {
        let broker = broker();
        let fill = broker.submit_order(&order(), "key-1").await.unwrap();

        broker.mark_price("EURUSD", dec!(1.0980)).await;
        let close = broker.close_position(&fill.position.id).await.unwrap();

        assert_eq!(close.realized_pl, dec!(-100));
        let account = broker.get_account_snapshot().await.unwrap();
        assert_eq!(account.balance, dec!(9900));
    }

    #[tokio::test]
    async fn test_close_unknown_position() {
        let broker = broker();
        let result = broker.close_position("missing").await;
        assert!(matches!(result, Err(BrokerError::UnknownPosition(_))));
    }
}
