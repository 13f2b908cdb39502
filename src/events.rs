//! Broadcast channel for state changes observed by UIs, the CLI, and tests.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::trace;

use crate::engine::EngineState;
use crate::error::RiskRejection;
use crate::models::{ClosedTrade, TrackedPosition};
use crate::sync::SyncState;
use crate::trading::SizedOrder;

const EVENT_CAPACITY: usize = 256;

/// Something observable happened in the trading core.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    EngineStateChanged {
        from: EngineState,
        to: EngineState,
    },

    /// Risk manager refused a signal
    SignalRejected {
        signal_id: String,
        symbol: String,
        reason: RiskRejection,
    },

    /// Validated order awaiting manual action (auto-execute is off)
    SignalReady(SizedOrder),

    TradeExecuted(TrackedPosition),

    /// Order could not be placed after retries
    TradeSkipped {
        signal_id: String,
        symbol: String,
        error: String,
    },

    PositionClosed(ClosedTrade),

    /// Fatal engine fault; the engine is now stopped
    EngineFault {
        message: String,
        at: DateTime<Utc>,
    },

    SyncStateChanged(SyncState),

    /// Session baseline captured or rolled over
    SessionStarted {
        day: chrono::NaiveDate,
        start_balance: Decimal,
    },
}

/// Cloneable publisher. Events sent with no subscribers are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: CoreEvent) {
        if let Err(broadcast::error::SendError(event)) = self.tx.send(event) {
            trace!(?event, "No event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(CoreEvent::EngineStateChanged {
            from: EngineState::Idle,
            to: EngineState::Analyzing,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            CoreEvent::EngineStateChanged { from: EngineState::Idle, to: EngineState::Analyzing }
        );
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        EventBus::new().publish(CoreEvent::EngineFault {
            message: "boom".to_string(),
            at: Utc::now(),
        });
    }
}
