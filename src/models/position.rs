//! Open positions: broker snapshots and the locally tracked view with live P/L.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{SymbolInfo, TradeSide};

/// Position state as reported by the broker, either from a fill or a sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    /// Broker-assigned position id
    pub id: String,

    pub symbol: String,

    pub side: TradeSide,

    pub volume: Decimal,

    pub open_price: Decimal,

    pub current_price: Decimal,

    #[serde(default)]
    pub stop_loss: Option<Decimal>,

    #[serde(default)]
    pub take_profit: Option<Decimal>,

    pub opened_at: DateTime<Utc>,

    /// Broker-side timestamp of this state; orders concurrent writers
    pub updated_at: DateTime<Utc>,
}

/// Open position owned by the position tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedPosition {
    pub id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub volume: Decimal,
    pub open_price: Decimal,
    pub current_price: Decimal,
    pub unrealized_pl: Decimal,
    pub pips_profit: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrackedPosition {
    /// Build the tracked view of a snapshot, computing P/L.
    pub fn from_snapshot(snapshot: PositionSnapshot, info: &SymbolInfo) -> Self {
        let mut position = Self {
            id: snapshot.id,
            symbol: snapshot.symbol,
            side: snapshot.side,
            volume: snapshot.volume,
            open_price: snapshot.open_price,
            current_price: snapshot.current_price,
            unrealized_pl: Decimal::ZERO,
            pips_profit: Decimal::ZERO,
            stop_loss: snapshot.stop_loss,
            take_profit: snapshot.take_profit,
            opened_at: snapshot.opened_at,
            updated_at: snapshot.updated_at,
        };
        position.recompute(info);
        position
    }

    /// P/L = price delta x volume x direction, with volume in base units
    /// (lots x units per lot).
    fn recompute(&mut self, info: &SymbolInfo) {
        let delta = (self.current_price - self.open_price) * self.side.sign();
        self.unrealized_pl = delta * self.volume * info.units_per_lot();
        self.pips_profit = info.to_pips(delta);
    }

    /// Whether the current price has crossed the stop-loss.
    pub fn stop_loss_hit(&self) -> bool {
        match (self.stop_loss, self.side) {
            (Some(stop), TradeSide::Buy) => self.current_price <= stop,
            (Some(stop), TradeSide::Sell) => self.current_price >= stop,
            (None, _) => false,
        }
    }

    /// Whether the current price has reached the take-profit.
    pub fn take_profit_hit(&self) -> bool {
        match (self.take_profit, self.side) {
            (Some(target), TradeSide::Buy) => self.current_price >= target,
            (Some(target), TradeSide::Sell) => self.current_price <= target,
            (None, _) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot(side: TradeSide, open: Decimal, current: Decimal) -> PositionSnapshot {
        let now = Utc::now();
        PositionSnapshot {
            id: "p1".to_string(),
            symbol: "EURUSD".to_string(),
            side,
            volume: dec!(0.5),
            open_price: open,
            current_price: current,
            stop_loss: Some(dec!(1.0980)),
            take_profit: Some(dec!(1.1040)),
            opened_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_long_position_pnl() {
        let pos = TrackedPosition::from_snapshot(
            snapshot(TradeSide::Buy, dec!(1.1000), dec!(1.1020)),
            &SymbolInfo::forex(),
        );

        // (1.1020 - 1.1000) * 0.5 lots * 100,000 units * +1
        assert_eq!(pos.unrealized_pl, dec!(100));
        assert_eq!(pos.pips_profit, dec!(20));
    }

    #[test]
    fn test_short_position_pnl() {
        let pos = TrackedPosition::from_snapshot(
            snapshot(TradeSide::Sell, dec!(1.1000), dec!(1.0990)),
            &SymbolInfo::forex(),
        );

        assert_eq!(pos.unrealized_pl, dec!(50));
        assert_eq!(pos.pips_profit, dec!(10));
    }

    #[test]
    fn test_exit_triggers() {
        let info = SymbolInfo::forex();
        let at = |price| TrackedPosition::from_snapshot(snapshot(TradeSide::Buy, dec!(1.1000), price), &info);

        let flat = at(dec!(1.1000));
        assert!(!flat.stop_loss_hit());
        assert!(!flat.take_profit_hit());

        assert!(at(dec!(1.0975)).stop_loss_hit());
        assert!(at(dec!(1.1045)).take_profit_hit());
    }
}
