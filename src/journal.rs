//! Closed-trade history shared by the engine, account sync, and metrics.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::db::Database;
use crate::models::ClosedTrade;

/// Default number of closed trades kept in memory and in the database.
pub const DEFAULT_JOURNAL_CAPACITY: usize = 500;

/// Bounded closed-trade history, optionally backed by SQLite.
pub struct TradeJournal {
    entries: RwLock<VecDeque<ClosedTrade>>,
    capacity: usize,
    db: Option<Arc<Database>>,
}

impl TradeJournal {
    pub fn new(capacity: usize, db: Option<Arc<Database>>) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            db,
        }
    }

    /// In-memory journal with the default capacity.
    pub fn in_memory() -> Self {
        Self::new(DEFAULT_JOURNAL_CAPACITY, None)
    }

    /// Replace the in-memory history with the most recent stored trades.
    pub async fn load(&self) -> Result<usize> {
        let Some(db) = &self.db else {
            return Ok(0);
        };

        let trades = db.recent_closed_trades(self.capacity as i64).await?;
        let count = trades.len();
        *self.entries.write().await = trades.into();

        info!(count, "Loaded closed-trade history");
        Ok(count)
    }

    /// Append a closed trade. A position already journaled is ignored.
    ///
    /// Persistence failures are logged; the in-memory record is kept.
    pub async fn record(&self, trade: ClosedTrade) -> bool {
        {
            let mut entries = self.entries.write().await;
            if entries.iter().any(|t| t.position_id == trade.position_id) {
                return false;
            }
            entries.push_back(trade.clone());
            while entries.len() > self.capacity {
                entries.pop_front();
            }
        }

        if let Some(db) = &self.db {
            if let Err(e) = db.record_closed_trade(&trade).await {
                warn!(position_id = %trade.position_id, error = %e, "Failed to persist closed trade");
            } else if let Err(e) = db.prune_closed_trades(self.capacity as i64).await {
                warn!(error = %e, "Failed to prune closed trades");
            }
        }

        true
    }

    /// Snapshot of the history, oldest first.
    pub async fn trades(&self) -> Vec<ClosedTrade> {
        self.entries.read().await.iter().cloned().collect()
    }

    /// Sum of realized P/L for trades closed on `day`.
    pub async fn realized_on(&self, day: NaiveDate) -> Decimal {
        self.entries
            .read()
            .await
            .iter()
            .filter(|t| t.closed_on(day))
            .map(|t| t.realized_pl)
            .sum()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
