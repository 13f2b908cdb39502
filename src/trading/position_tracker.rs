//! Authoritative map of open positions.
//!
//! Fills from the executor and snapshots from account sync both go through
//! [`PositionTracker::upsert`], which applies last-writer-wins on the
//! broker-reported `updated_at`. Closed positions leave a tombstone so a late
//! snapshot cannot bring them back.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::debug;

use crate::models::{PositionSnapshot, SymbolCatalog, TrackedPosition};

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Snapshot older than the stored state, or for a closed position
    Stale,
}

#[derive(Debug, Default)]
struct TrackerState {
    positions: HashMap<String, TrackedPosition>,
    /// Closed position id -> close time
    tombstones: HashMap<String, DateTime<Utc>>,
}

/// Shared handle to the open-position map. Cloning shares the same state.
#[derive(Debug, Clone)]
pub struct PositionTracker {
    state: Arc<RwLock<TrackerState>>,
    catalog: Arc<SymbolCatalog>,
}

impl PositionTracker {
    pub fn new(catalog: Arc<SymbolCatalog>) -> Self {
        Self {
            state: Arc::new(RwLock::new(TrackerState::default())),
            catalog,
        }
    }

    /// Insert or update a position from a broker snapshot.
    pub async fn upsert(&self, snapshot: PositionSnapshot) -> UpsertOutcome {
        let mut state = self.state.write().await;

        if let Some(closed_at) = state.tombstones.get(&snapshot.id) {
            if snapshot.updated_at <= *closed_at {
                debug!(id = %snapshot.id, "Ignoring snapshot of closed position");
                return UpsertOutcome::Stale;
            }
        }

        if let Some(existing) = state.positions.get(&snapshot.id) {
            if snapshot.updated_at < existing.updated_at {
                debug!(
                    id = %snapshot.id,
                    stored = %existing.updated_at,
                    incoming = %snapshot.updated_at,
                    "Ignoring stale snapshot"
                );
                return UpsertOutcome::Stale;
            }
        }

        let info = self.catalog.info(&snapshot.symbol);
        let position = TrackedPosition::from_snapshot(snapshot, &info);
        state.tombstones.remove(&position.id);

        match state.positions.insert(position.id.clone(), position) {
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        }
    }

    /// Remove a position after a confirmed close.
    pub async fn remove(&self, id: &str, closed_at: DateTime<Utc>) -> Option<TrackedPosition> {
        let mut state = self.state.write().await;
        state.tombstones.insert(id.to_string(), closed_at);
        state.positions.remove(id)
    }

    /// Remove positions the broker no longer reports.
    ///
    /// Only positions last updated before `as_of` are removed, so a fill that
    /// raced the remote fetch survives until the next sync.
    pub async fn remove_missing(
        &self,
        remote_ids: &HashSet<String>,
        as_of: DateTime<Utc>,
    ) -> Vec<TrackedPosition> {
        let mut state = self.state.write().await;

        let missing: Vec<String> = state
            .positions
            .values()
            .filter(|p| !remote_ids.contains(&p.id) && p.updated_at < as_of)
            .map(|p| p.id.clone())
            .collect();

        let mut removed = Vec::with_capacity(missing.len());
        for id in missing {
            if let Some(position) = state.positions.remove(&id) {
                state.tombstones.insert(id, as_of);
                removed.push(position);
            }
        }
        removed
    }

    pub async fn get(&self, id: &str) -> Option<TrackedPosition> {
        self.state.read().await.positions.get(id).cloned()
    }

    /// All open positions, oldest first.
    pub async fn positions(&self) -> Vec<TrackedPosition> {
        let state = self.state.read().await;
        let mut positions: Vec<_> = state.positions.values().cloned().collect();
        positions.sort_by_key(|p| p.opened_at);
        positions
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.positions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.positions.is_empty()
    }

    /// Uppercase symbols with an open position.
    pub async fn open_symbols(&self) -> HashSet<String> {
        let state = self.state.read().await;
        state.positions.values().map(|p| p.symbol.to_uppercase()).collect()
    }

    pub async fn unrealized_total(&self) -> Decimal {
        let state = self.state.read().await;
        state.positions.values().map(|p| p.unrealized_pl).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TradeSide;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn snapshot(id: &str, price: Decimal, updated_at: DateTime<Utc>) -> PositionSnapshot {
        PositionSnapshot {
            id: id.to_string(),
            symbol: "EURUSD".to_string(),
            side: TradeSide::Buy,
            volume: dec!(0.5),
            open_price: dec!(1.1000),
            current_price: price,
            stop_loss: None,
            take_profit: None,
            opened_at: updated_at,
            updated_at,
        }
    }

    fn tracker() -> PositionTracker {
        PositionTracker::new(Arc::new(SymbolCatalog::new()))
    }

    #[tokio::test]
    async fn test_older_snapshot_is_noop() {
        let tracker = tracker();
        let now = Utc::now();

        assert_eq!(tracker.upsert(snapshot("p1", dec!(1.1020), now)).await, UpsertOutcome::Inserted);
        let stale = snapshot("p1", dec!(1.0900), now - Duration::seconds(5));
        assert_eq!(tracker.upsert(stale).await, UpsertOutcome::Stale);

        let position = tracker.get("p1").await.unwrap();
        assert_eq!(position.current_price, dec!(1.1020));
        assert_eq!(position.unrealized_pl, dec!(100));
    }

    #[tokio::test]
    async fn test_newer_snapshot_wins() {
        let tracker = tracker();
        let now = Utc::now();

        tracker.upsert(snapshot("p1", dec!(1.1020), now)).await;
        let outcome = tracker.upsert(snapshot("p1", dec!(1.0990), now + Duration::seconds(1))).await;

        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(tracker.get("p1").await.unwrap().pips_profit, dec!(-10));
    }

    #[tokio::test]
    async fn test_removed_position_not_resurrected() {
        let tracker = tracker();
        let now = Utc::now();

        tracker.upsert(snapshot("p1", dec!(1.1000), now)).await;
        assert!(tracker.remove("p1", now + Duration::seconds(1)).await.is_some());

        let late = snapshot("p1", dec!(1.1000), now);
        assert_eq!(tracker.upsert(late).await, UpsertOutcome::Stale);
        assert!(tracker.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_missing_spares_fresh_positions() {
        let tracker = tracker();
        let fetch_started = Utc::now();

        tracker.upsert(snapshot("old", dec!(1.1000), fetch_started - Duration::seconds(10))).await;
        tracker.upsert(snapshot("fresh", dec!(1.1000), fetch_started + Duration::seconds(1))).await;

        let removed = tracker.remove_missing(&HashSet::new(), fetch_started).await;

        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, "old");
        assert!(tracker.get("fresh").await.is_some());
    }

    #[tokio::test]
    async fn test_aggregates() {
        let tracker = tracker();
        let now = Utc::now();
        tracker.upsert(snapshot("p1", dec!(1.1010), now)).await;

        assert_eq!(tracker.unrealized_total().await, dec!(50));
        assert!(tracker.open_symbols().await.contains("EURUSD"));
    }
}
