//! Trade direction and closed-trade records.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }

    /// +1 for longs, -1 for shorts.
    pub fn sign(&self) -> Decimal {
        match self {
            TradeSide::Buy => Decimal::ONE,
            TradeSide::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "buy" | "long" => Some(Self::Buy),
            "sell" | "short" => Some(Self::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    Manual,
    /// The broker no longer reports the position; detected during sync.
    ClosedRemotely,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::StopLoss => "stop_loss",
            CloseReason::TakeProfit => "take_profit",
            CloseReason::Manual => "manual",
            CloseReason::ClosedRemotely => "closed_remotely",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stop_loss" => Some(Self::StopLoss),
            "take_profit" => Some(Self::TakeProfit),
            "manual" => Some(Self::Manual),
            "closed_remotely" => Some(Self::ClosedRemotely),
            _ => None,
        }
    }
}

/// A position that has been closed, with its realized result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    /// Broker-assigned position id
    pub position_id: String,

    pub symbol: String,

    pub side: TradeSide,

    /// Volume in lots
    pub volume: Decimal,

    pub open_price: Decimal,

    pub close_price: Decimal,

    /// Realized P/L in account currency
    pub realized_pl: Decimal,

    pub opened_at: DateTime<Utc>,

    pub closed_at: DateTime<Utc>,

    pub reason: CloseReason,
}

impl ClosedTrade {
    pub fn is_win(&self) -> bool {
        self.realized_pl > Decimal::ZERO
    }

    pub fn is_loss(&self) -> bool {
        self.realized_pl < Decimal::ZERO
    }

    /// Whether the trade was closed on the given UTC day.
    pub fn closed_on(&self, day: NaiveDate) -> bool {
        self.closed_at.date_naive() == day
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_sign_and_parse() {
        assert_eq!(TradeSide::Buy.sign(), dec!(1));
        assert_eq!(TradeSide::Sell.sign(), dec!(-1));
        assert_eq!(TradeSide::parse("SELL"), Some(TradeSide::Sell));
        assert_eq!(TradeSide::parse("hold"), None);
    }

    #[test]
    fn test_close_reason_round_trips_through_str() {
        for reason in [
            CloseReason::StopLoss,
            CloseReason::TakeProfit,
            CloseReason::Manual,
            CloseReason::ClosedRemotely,
        ] {
            assert_eq!(CloseReason::parse(reason.as_str()), Some(reason));
        }
    }
}
