//! Cycle timing for the engine and sync loops.
//!
//! Loops ask a [`Ticker`] for the next tick instead of owning a timer, so
//! tests can drive cycles by hand with [`ManualTicker`] and know when a
//! triggered cycle has finished.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Source of cycle ticks for one loop.
#[async_trait]
pub trait Ticker: Send {
    /// Wait for the next tick. Returns `false` when `cancel` fires or the
    /// source is exhausted; the loop should then exit.
    async fn tick(&mut self, cancel: &CancellationToken) -> bool;
}

/// Creates tickers for a requested period.
pub trait TickerSource: Send + Sync {
    fn ticker(&self, period: Duration) -> Box<dyn Ticker>;
}

/// Wall-clock ticks at a fixed period. The first tick fires immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntervalSource;

impl TickerSource for IntervalSource {
    fn ticker(&self, period: Duration) -> Box<dyn Ticker> {
        let mut timer = interval(period.max(Duration::from_millis(1)));
        // A slow cycle delays the next one instead of bursting to catch up.
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Box::new(IntervalTicker { timer })
    }
}

struct IntervalTicker {
    timer: Interval,
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = self.timer.tick() => true,
        }
    }
}

type Ack = oneshot::Sender<()>;

/// Ticks only when [`ManualTrigger::trigger`] is called. Ignores the period.
#[derive(Clone)]
pub struct ManualTicker {
    rx: Arc<Mutex<mpsc::Receiver<Ack>>>,
}

/// Handle that fires ticks into a [`ManualTicker`].
#[derive(Clone)]
pub struct ManualTrigger {
    tx: mpsc::Sender<Ack>,
}

impl ManualTicker {
    pub fn pair() -> (ManualTrigger, ManualTicker) {
        let (tx, rx) = mpsc::channel(1);
        (
            ManualTrigger { tx },
            ManualTicker {
                rx: Arc::new(Mutex::new(rx)),
            },
        )
    }
}

impl TickerSource for ManualTicker {
    fn ticker(&self, _period: Duration) -> Box<dyn Ticker> {
        Box::new(ManualTick {
            rx: self.rx.clone(),
            pending: None,
        })
    }
}

struct ManualTick {
    rx: Arc<Mutex<mpsc::Receiver<Ack>>>,
    /// Ack for the tick currently being handled
    pending: Option<Ack>,
}

#[async_trait]
impl Ticker for ManualTick {
    async fn tick(&mut self, cancel: &CancellationToken) -> bool {
        // Asking for the next tick means the previous cycle is done.
        if let Some(ack) = self.pending.take() {
            let _ = ack.send(());
        }

        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            ack = rx.recv() => match ack {
                Some(ack) => {
                    self.pending = Some(ack);
                    true
                }
                None => false,
            },
        }
    }
}

impl ManualTrigger {
    /// Fire one tick and wait until the loop has finished the cycle it
    /// started. Returns `false` if the loop exited before finishing.
    pub async fn trigger(&self) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(ack_tx).await.is_err() {
            return false;
        }
        ack_rx.await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_trigger_waits_for_cycle_completion() {
        let (trigger, source) = ManualTicker::pair();
        let cancel = CancellationToken::new();
        let cycles = Arc::new(AtomicU32::new(0));

        let mut ticker = source.ticker(Duration::from_secs(60));
        let loop_cancel = cancel.clone();
        let counter = cycles.clone();
        let handle = tokio::spawn(async move {
            while ticker.tick(&loop_cancel).await {
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert!(trigger.trigger().await);
        assert_eq!(cycles.load(Ordering::SeqCst), 1);
        assert!(trigger.trigger().await);
        assert_eq!(cycles.load(Ordering::SeqCst), 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_interval_ticker_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let mut ticker = IntervalSource.ticker(Duration::from_millis(10));

        assert!(ticker.tick(&cancel).await);
        cancel.cancel();
        assert!(!ticker.tick(&cancel).await);
    }
}
