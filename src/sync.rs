//! Account reconciliation against the broker.
//!
//! Runs independently of the engine but shares its [`PositionTracker`].
//! Only one sync pass runs at a time; a second request while one is in
//! flight returns [`SyncOutcome::AlreadyInProgress`] without touching the
//! broker.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{with_retry, AccountSnapshot, BrokerGateway, RetryPolicy};
use crate::db::Database;
use crate::error::{ExecutionError, SyncError};
use crate::events::{CoreEvent, EventBus};
use crate::journal::TradeJournal;
use crate::models::{CloseReason, ClosedTrade};
use crate::scheduler::TickerSource;
use crate::trading::{PositionTracker, UpsertOutcome};

const PROGRESS_ACCOUNT: f64 = 0.4;
const PROGRESS_POSITIONS: f64 = 0.7;
const PROGRESS_DONE: f64 = 1.0;

/// Where the sync service is in its lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncStatus {
    Idle,
    Syncing,
    Completed(DateTime<Utc>),
    Failed(SyncError),
}

/// Observable sync state.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncState {
    pub status: SyncStatus,

    /// Time of the last successful sync
    pub last_sync_date: Option<DateTime<Utc>>,

    /// Progress of the current or last pass (0.0 to 1.0)
    pub progress: f64,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            status: SyncStatus::Idle,
            last_sync_date: None,
            progress: 0.0,
        }
    }
}

/// Auto-sync settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub auto_sync_enabled: bool,

    /// Minimum time between automatic syncs
    pub interval: Duration,

    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync_enabled: true,
            interval: Duration::from_secs(300),        // 5 minutes
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of one completed pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub account: AccountSnapshot,

    /// Snapshots that inserted or updated a position
    pub applied: usize,

    /// Snapshots ignored as older than local state
    pub stale: usize,

    /// Local positions the broker no longer reports
    pub closed_remotely: usize,

    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Synced(SyncReport),
    /// Another pass was already running; nothing was done
    AlreadyInProgress,
}

struct AutoSync {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodic reconciliation of local positions with the broker account.
pub struct AccountSyncService {
    broker: Arc<dyn BrokerGateway>,
    tracker: PositionTracker,
    journal: Arc<TradeJournal>,
    db: Option<Arc<Database>>,
    events: EventBus,
    ticker_source: Arc<dyn TickerSource>,
    config: SyncConfig,

    state: RwLock<SyncState>,
    account: RwLock<Option<AccountSnapshot>>,
    auto: Mutex<Option<AutoSync>>,

    /// Cancels any in-flight pass on shutdown
    shutdown: CancellationToken,
}

impl AccountSyncService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn BrokerGateway>,
        tracker: PositionTracker,
        journal: Arc<TradeJournal>,
        db: Option<Arc<Database>>,
        events: EventBus,
        ticker_source: Arc<dyn TickerSource>,
        config: SyncConfig,
    ) -> Self {
        Self {
            broker,
            tracker,
            journal,
            db,
            events,
            ticker_source,
            config,
            state: RwLock::new(SyncState::default()),
            account: RwLock::new(None),
            auto: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Restore the last sync date from the database.
    pub async fn restore(&self) -> anyhow::Result<()> {
        if let Some(db) = &self.db {
            let last = db.load_last_sync_date().await?;
            self.state.write().await.last_sync_date = last;
            if let Some(last) = last {
                info!(last_sync = %last, "Restored last sync date");
            }
        }
        Ok(())
    }

    pub async fn state(&self) -> SyncState {
        self.state.read().await.clone()
    }

    /// Latest account snapshot from a successful pass.
    pub async fn account(&self) -> Option<AccountSnapshot> {
        self.account.read().await.clone()
    }

    /// Whether an automatic sync is due at `now`.
    pub async fn should_auto_sync(&self, now: DateTime<Utc>) -> bool {
        if !self.config.auto_sync_enabled {
            return false;
        }

        match self.state.read().await.last_sync_date {
            None => true,
            Some(last) => (now - last).to_std().map_or(false, |elapsed| elapsed >= self.config.interval),
        }
    }

    /// Run one reconciliation pass unless one is already running.
    pub async fn sync_account(&self) -> Result<SyncOutcome, SyncError> {
        self.sync_with(&self.shutdown).await
    }

    async fn sync_with(&self, cancel: &CancellationToken) -> Result<SyncOutcome, SyncError> {
        // Check-and-set under one write lock
        {
            let mut state = self.state.write().await;
            if state.status == SyncStatus::Syncing {
                return Ok(SyncOutcome::AlreadyInProgress);
            }
            state.status = SyncStatus::Syncing;
            state.progress = 0.0;
            self.events.publish(CoreEvent::SyncStateChanged(state.clone()));
        }

        info!(broker = self.broker.name(), "Account sync started");

        match self.run_pass(cancel).await {
            Ok(report) => {
                self.finish(&report).await;
                Ok(SyncOutcome::Synced(report))
            }
            Err(e) => {
                error!(error = %e, "Account sync failed");
                let mut state = self.state.write().await;
                state.status = SyncStatus::Failed(e.clone());
                self.events.publish(CoreEvent::SyncStateChanged(state.clone()));
                Err(e)
            }
        }
    }

    async fn run_pass(&self, cancel: &CancellationToken) -> Result<SyncReport, SyncError> {
        let fetch_started = Utc::now();
        let broker = self.broker.clone();

        let account = with_retry(&self.config.retry, cancel, "get_account_snapshot", |_| {
            let broker = broker.clone();
            async move { broker.get_account_snapshot().await }
        })
        .await
        .map_err(|e| classify(e, SyncError::AccountFetch))?;
        self.set_progress(PROGRESS_ACCOUNT).await;

        let remote = with_retry(&self.config.retry, cancel, "get_open_positions", |_| {
            let broker = broker.clone();
            async move { broker.get_open_positions().await }
        })
        .await
        .map_err(|e| classify(e, SyncError::PositionsFetch))?;
        self.set_progress(PROGRESS_POSITIONS).await;

        let remote_ids: HashSet<String> = remote.iter().map(|p| p.id.clone()).collect();
        let mut applied = 0;
        let mut stale = 0;
        for snapshot in remote {
            match self.tracker.upsert(snapshot).await {
                UpsertOutcome::Inserted | UpsertOutcome::Updated => applied += 1,
                UpsertOutcome::Stale => stale += 1,
            }
        }

        let closed = self.tracker.remove_missing(&remote_ids, fetch_started).await;
        let closed_remotely = closed.len();
        let now = Utc::now();
        for position in closed {
            warn!(
                position_id = %position.id,
                symbol = %position.symbol,
                "Position closed outside the engine"
            );
            let trade = ClosedTrade {
                position_id: position.id,
                symbol: position.symbol,
                side: position.side,
                volume: position.volume,
                open_price: position.open_price,
                close_price: position.current_price,
                realized_pl: position.unrealized_pl,
                opened_at: position.opened_at,
                closed_at: now,
                reason: CloseReason::ClosedRemotely,
            };
            if self.journal.record(trade.clone()).await {
                self.events.publish(CoreEvent::PositionClosed(trade));
            }
        }

        Ok(SyncReport {
            account,
            applied,
            stale,
            closed_remotely,
            completed_at: now,
        })
    }

    async fn finish(&self, report: &SyncReport) {
        *self.account.write().await = Some(report.account.clone());

        {
            let mut state = self.state.write().await;
            state.status = SyncStatus::Completed(report.completed_at);
            state.last_sync_date = Some(report.completed_at);
            state.progress = PROGRESS_DONE;
            self.events.publish(CoreEvent::SyncStateChanged(state.clone()));
        }

        if let Some(db) = &self.db {
            if let Err(e) = db.save_last_sync_date(report.completed_at).await {
                warn!(error = %e, "Failed to persist last sync date");
            }
        }

        info!(
            balance = %report.account.balance,
            equity = %report.account.equity,
            applied = report.applied,
            stale = report.stale,
            closed_remotely = report.closed_remotely,
            "Account sync completed"
        );
    }

    async fn set_progress(&self, progress: f64) {
        let mut state = self.state.write().await;
        state.progress = progress.clamp(0.0, 1.0);
        self.events.publish(CoreEvent::SyncStateChanged(state.clone()));
    }

    /// Start the periodic loop. Returns `false` if it is already running.
    pub async fn start_auto_sync(self: &Arc<Self>) -> bool {
        let mut auto = self.auto.lock().await;
        if auto.as_ref().is_some_and(|a| !a.handle.is_finished()) {
            return false;
        }

        let cancel = self.shutdown.child_token();
        let mut ticker = self.ticker_source.ticker(self.config.interval);
        let service = Arc::clone(self);
        let loop_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            info!(interval_secs = service.config.interval.as_secs(), "Auto-sync started");
            // Completion time of this loop's own last pass. Ticks already run
            // at the configured interval, so the due check only applies when a
            // sync happened outside the loop (manual, or restored at startup).
            let mut last_own: Option<DateTime<Utc>> = None;
            while ticker.tick(&loop_cancel).await {
                if !service.config.auto_sync_enabled {
                    continue;
                }
                let last = service.state().await.last_sync_date;
                if last != last_own && !service.should_auto_sync(Utc::now()).await {
                    debug!("Skipping tick, synced recently outside the loop");
                    continue;
                }
                // Failures are recorded in the sync state; the loop keeps going.
                if let Ok(SyncOutcome::Synced(report)) = service.sync_with(&loop_cancel).await {
                    last_own = Some(report.completed_at);
                }
            }
            info!("Auto-sync stopped");
        });

        *auto = Some(AutoSync { cancel, handle });
        true
    }

    /// Stop the periodic loop and wait for it to exit. Safe to call repeatedly.
    pub async fn stop_auto_sync(&self) {
        let Some(auto) = self.auto.lock().await.take() else {
            return;
        };

        auto.cancel.cancel();
        if let Err(e) = auto.handle.await {
            warn!(error = %e, "Auto-sync task ended abnormally");
        }
    }

    pub async fn is_auto_syncing(&self) -> bool {
        self.auto.lock().await.as_ref().is_some_and(|a| !a.handle.is_finished())
    }

    /// Stop the loop and cancel any in-flight pass.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.stop_auto_sync().await;
    }
}

fn classify(error: ExecutionError, wrap: fn(ExecutionError) -> SyncError) -> SyncError {
    match error {
        ExecutionError::Cancelled { .. } => SyncError::Cancelled,
        other => wrap(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{CloseFill, OrderFill, PaperBroker};
    use crate::error::{BrokerError, BrokerResult};
    use crate::models::{PositionSnapshot, SymbolCatalog, TradeSide};
    use crate::scheduler::{IntervalSource, ManualTicker};
    use crate::trading::SizedOrder;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    /// Broker whose account fetch blocks until released.
    struct GatedBroker {
        entered: Notify,
        release: Notify,
        account_calls: AtomicU32,
        fail: bool,
    }

    impl GatedBroker {
        fn new(fail: bool) -> Self {
            Self {
                entered: Notify::new(),
                release: Notify::new(),
                account_calls: AtomicU32::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl BrokerGateway for GatedBroker {
        fn name(&self) -> &str {
            "gated"
        }

        async fn get_account_snapshot(&self) -> BrokerResult<AccountSnapshot> {
            self.account_calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;

            if self.fail {
                return Err(BrokerError::Authentication("token expired".into()));
            }
            Ok(AccountSnapshot {
                account_id: "acc-1".to_string(),
                currency: "USD".to_string(),
                balance: dec!(10000),
                equity: dec!(10000),
                margin_used: dec!(0),
                free_margin: dec!(10000),
                as_of: Utc::now(),
            })
        }

        async fn get_open_positions(&self) -> BrokerResult<Vec<PositionSnapshot>> {
            Ok(Vec::new())
        }

        async fn submit_order(&self, _order: &SizedOrder, _key: &str) -> BrokerResult<OrderFill> {
            Err(BrokerError::Rejected("read-only".into()))
        }

        async fn close_position(&self, id: &str) -> BrokerResult<CloseFill> {
            Err(BrokerError::UnknownPosition(id.to_string()))
        }
    }

    fn service(
        broker: Arc<dyn BrokerGateway>,
        tracker: PositionTracker,
        journal: Arc<TradeJournal>,
        ticker: ManualTicker,
    ) -> Arc<AccountSyncService> {
        Arc::new(AccountSyncService::new(
            broker,
            tracker,
            journal,
            None,
            EventBus::new(),
            Arc::new(ticker),
            SyncConfig {
                retry: RetryPolicy::immediate(2),
                ..SyncConfig::default()
            },
        ))
    }

    fn catalog() -> Arc<SymbolCatalog> {
        Arc::new(SymbolCatalog::new())
    }

    #[tokio::test]
    async fn test_concurrent_sync_runs_once() {
        let broker = Arc::new(GatedBroker::new(false));
        let (_trigger, ticker) = ManualTicker::pair();
        let service = service(
            broker.clone(),
            PositionTracker::new(catalog()),
            Arc::new(TradeJournal::in_memory()),
            ticker,
        );

        let first = tokio::spawn({
            let service = service.clone();
            async move { service.sync_account().await }
        });
        broker.entered.notified().await;

        assert_eq!(service.state().await.status, SyncStatus::Syncing);
        assert_eq!(service.sync_account().await, Ok(SyncOutcome::AlreadyInProgress));

        broker.release.notify_one();
        let outcome = first.await.unwrap().unwrap();

        assert!(matches!(outcome, SyncOutcome::Synced(_)));
        assert_eq!(broker.account_calls.load(Ordering::SeqCst), 1);

        let state = service.state().await;
        assert!(matches!(state.status, SyncStatus::Completed(_)));
        assert_eq!(state.progress, 1.0);
        assert!(state.last_sync_date.is_some());
    }

    #[tokio::test]
    async fn test_fetch_failure_is_captured() {
        let broker = Arc::new(GatedBroker::new(true));
        broker.release.notify_one();
        let (_trigger, ticker) = ManualTicker::pair();
        let service = service(
            broker,
            PositionTracker::new(catalog()),
            Arc::new(TradeJournal::in_memory()),
            ticker,
        );

        let result = service.sync_account().await;

        assert!(matches!(result, Err(SyncError::AccountFetch(ExecutionError::Terminal(_)))));
        let state = service.state().await;
        assert!(matches!(state.status, SyncStatus::Failed(_)));
        assert!(state.last_sync_date.is_none());
        assert!(service.account().await.is_none());
    }

    #[tokio::test]
    async fn test_positions_closed_remotely_are_journaled() {
        let broker = Arc::new(PaperBroker::new("paper", dec!(10000), catalog()));
        let tracker = PositionTracker::new(catalog());
        let journal = Arc::new(TradeJournal::in_memory());

        let earlier = Utc::now() - ChronoDuration::minutes(5);
        tracker
            .upsert(PositionSnapshot {
                id: "gone".to_string(),
                symbol: "EURUSD".to_string(),
                side: TradeSide::Buy,
                volume: dec!(0.1),
                open_price: dec!(1.1000),
                current_price: dec!(1.1010),
                stop_loss: None,
                take_profit: None,
                opened_at: earlier,
                updated_at: earlier,
            })
            .await;

        let (_trigger, ticker) = ManualTicker::pair();
        let service = service(broker, tracker.clone(), journal.clone(), ticker);

        let outcome = service.sync_account().await.unwrap();

        let SyncOutcome::Synced(report) = outcome else {
            panic!("expected a sync pass");
        };
        assert_eq!(report.closed_remotely, 1);
        assert!(tracker.is_empty().await);

        let trades = journal.trades().await;
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].reason, CloseReason::ClosedRemotely);
        assert_eq!(trades[0].realized_pl, dec!(10));
        assert_eq!(service.account().await.unwrap().balance, dec!(10000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_sync_runs_every_interval() {
        let broker = Arc::new(PaperBroker::new("paper", dec!(10000), catalog()));
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let service = Arc::new(AccountSyncService::new(
            broker,
            PositionTracker::new(catalog()),
            Arc::new(TradeJournal::in_memory()),
            None,
            events,
            Arc::new(IntervalSource),
            SyncConfig {
                interval: Duration::from_secs(60),
                retry: RetryPolicy::immediate(2),
                ..SyncConfig::default()
            },
        ));

        assert!(service.start_auto_sync().await);
        // Ticks at 0, 60, 120, 180, 240 and 300 seconds
        tokio::time::sleep(Duration::from_secs(330)).await;
        service.stop_auto_sync().await;

        let mut completed = 0;
        while let Ok(event) = rx.try_recv() {
            if let CoreEvent::SyncStateChanged(SyncState { status: SyncStatus::Completed(_), .. }) = event {
                completed += 1;
            }
        }
        assert_eq!(completed, 6);
    }

    #[tokio::test]
    async fn test_auto_sync_skips_tick_after_manual_sync() {
        let broker = Arc::new(PaperBroker::new("paper", dec!(10000), catalog()));
        let (trigger, ticker) = ManualTicker::pair();
        let service = service(
            broker,
            PositionTracker::new(catalog()),
            Arc::new(TradeJournal::in_memory()),
            ticker,
        );

        service.sync_account().await.unwrap();
        let manual = service.state().await.last_sync_date;

        assert!(service.start_auto_sync().await);
        assert!(trigger.trigger().await);
        assert_eq!(service.state().await.last_sync_date, manual);

        service.stop_auto_sync().await;
    }

    #[tokio::test]
    async fn test_auto_sync_due_and_stop_is_idempotent() {
        let broker = Arc::new(PaperBroker::new("paper", dec!(10000), catalog()));
        let (trigger, ticker) = ManualTicker::pair();
        let service = service(
            broker,
            PositionTracker::new(catalog()),
            Arc::new(TradeJournal::in_memory()),
            ticker,
        );

        assert!(service.should_auto_sync(Utc::now()).await);

        assert!(service.start_auto_sync().await);
        assert!(!service.start_auto_sync().await);
        assert!(trigger.trigger().await);

        let last = service.state().await.last_sync_date.unwrap();
        assert!(!service.should_auto_sync(last + ChronoDuration::seconds(10)).await);
        assert!(service.should_auto_sync(last + ChronoDuration::seconds(300)).await);

        service.stop_auto_sync().await;
        service.stop_auto_sync().await;
        assert!(!service.is_auto_syncing().await);
    }
}
