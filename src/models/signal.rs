//! AI-generated trade signals. Produced externally and never mutated here.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::TradeSide;

/// A trade idea emitted by the signal model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AISignal {
    pub id: String,

    pub symbol: String,

    pub action: TradeSide,

    /// Model confidence (0.0 to 1.0)
    pub confidence: f64,

    pub suggested_entry: Decimal,

    pub stop_loss: Decimal,

    pub take_profit: Decimal,

    pub generated_at: DateTime<Utc>,
}

impl AISignal {
    /// Absolute price distance between entry and stop.
    pub fn stop_distance(&self) -> Decimal {
        (self.suggested_entry - self.stop_loss).abs()
    }

    /// True when the stop sits on the losing side of the entry.
    pub fn stop_on_loss_side(&self) -> bool {
        match self.action {
            TradeSide::Buy => self.stop_loss < self.suggested_entry,
            TradeSide::Sell => self.stop_loss > self.suggested_entry,
        }
    }

    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.generated_at).num_seconds()
    }
}
