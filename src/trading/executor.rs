//! Order submission with bounded retries and broker-side deduplication.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use super::{PositionTracker, SizedOrder};
use crate::broker::{with_retry, BrokerGateway, RetryPolicy};
use crate::error::{BrokerError, ExecutionError};
use crate::models::TrackedPosition;

/// Submits sized orders and records the resulting positions.
pub struct OrderExecutor {
    broker: Arc<dyn BrokerGateway>,
    tracker: PositionTracker,
    policy: RetryPolicy,
}

impl OrderExecutor {
    pub fn new(broker: Arc<dyn BrokerGateway>, tracker: PositionTracker, policy: RetryPolicy) -> Self {
        Self {
            broker,
            tracker,
            policy,
        }
    }

    /// Submit `order`, retrying transient failures.
    ///
    /// One idempotency key is generated per call and reused on every attempt,
    /// so a fill that landed before a timeout is returned instead of duplicated.
    pub async fn execute(
        &self,
        order: &SizedOrder,
        cancel: &CancellationToken,
    ) -> Result<TrackedPosition, ExecutionError> {
        let key = Uuid::new_v4().to_string();
        let broker = self.broker.clone();

        info!(
            broker = broker.name(),
            signal_id = %order.signal_id,
            symbol = %order.symbol,
            side = %order.side,
            volume = %order.volume,
            key = %key,
            "Submitting order"
        );

        let result = with_retry(&self.policy, cancel, "submit_order", |_| {
            let broker = broker.clone();
            let key = key.clone();
            async move { broker.submit_order(order, &key).await }
        })
        .await;

        let fill = match result {
            Ok(fill) => fill,
            Err(e) => {
                error!(
                    symbol = %order.symbol,
                    attempts = e.attempts(),
                    error = %e,
                    "Order not placed"
                );
                return Err(e);
            }
        };

        let position_id = fill.position.id.clone();
        self.tracker.upsert(fill.position).await;

        info!(
            order_id = %fill.order_id,
            position_id = %position_id,
            symbol = %order.symbol,
            "Order filled"
        );

        // A newer sync snapshot may already have replaced the fill's state.
        match self.tracker.get(&position_id).await {
            Some(position) => Ok(position),
            None => Err(ExecutionError::Terminal(BrokerError::UnknownPosition(position_id))),
        }
    }
}
