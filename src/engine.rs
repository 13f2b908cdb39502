//! Auto-trading engine: the state machine that turns signals into trades.
//!
//! Each cycle:
//! - Pulls deferred and fresh signals (at most one per symbol per cycle)
//! - Validates and sizes them through the risk manager
//! - Submits approved orders, or publishes them when auto-execute is off
//! - Refreshes open positions and closes any that hit stop-loss or take-profit
//!
//! Cycles only run while the engine is analyzing or monitoring. Pausing or
//! stopping takes effect between steps; an in-flight broker call completes.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{with_retry, BrokerGateway, CloseFill, RetryPolicy};
use crate::db::Database;
use crate::error::{BrokerError, ConfigError, EngineError, ExecutionError};
use crate::events::{CoreEvent, EventBus};
use crate::journal::TradeJournal;
use crate::metrics::{MetricsAggregator, SessionBaseline};
use crate::models::{AISignal, AutoTradingMetrics, CloseReason, ClosedTrade, SymbolCatalog, TrackedPosition};
use crate::scheduler::TickerSource;
use crate::signals::SignalSource;
use crate::trading::{Exposure, OrderExecutor, PositionTracker, RiskManager, TradingConfig};

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    Idle,
    Analyzing,
    ExecutingTrade,
    Monitoring,
    Paused,
    Stopped,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::Analyzing => "analyzing",
            EngineState::ExecutingTrade => "executing_trade",
            EngineState::Monitoring => "monitoring",
            EngineState::Paused => "paused",
            EngineState::Stopped => "stopped",
        }
    }

    /// Whether the engine is running cycles.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            EngineState::Analyzing | EngineState::ExecutingTrade | EngineState::Monitoring
        )
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine tuning that is not part of the trading configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Retry policy for orders, closes, and account fetches
    pub retry: RetryPolicy,

    /// Deferred signals beyond this are dropped, oldest first
    pub max_deferred_signals: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_deferred_signals: 100,
        }
    }
}

/// Collaborators the engine is built from.
pub struct EngineParts {
    pub broker: Arc<dyn BrokerGateway>,
    pub signals: Box<dyn SignalSource>,
    pub tracker: PositionTracker,
    pub journal: Arc<TradeJournal>,
    pub catalog: Arc<SymbolCatalog>,
    pub db: Option<Arc<Database>>,
    pub events: EventBus,
    pub ticker_source: Arc<dyn TickerSource>,
}

struct EngineRun {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Top-level orchestrator: Signal -> Risk -> Execution -> Monitoring.
pub struct AutoTradingEngine {
    broker: Arc<dyn BrokerGateway>,
    risk: RiskManager,
    executor: OrderExecutor,
    tracker: PositionTracker,
    journal: Arc<TradeJournal>,
    db: Option<Arc<Database>>,
    events: EventBus,
    ticker_source: Arc<dyn TickerSource>,
    settings: EngineSettings,

    // === Runtime state ===
    signals: Mutex<Box<dyn SignalSource>>,
    config: RwLock<Option<TradingConfig>>,
    state: RwLock<EngineState>,
    baseline: RwLock<Option<SessionBaseline>>,
    deferred: Mutex<VecDeque<AISignal>>,
    last_error: RwLock<Option<EngineError>>,
    run: Mutex<Option<EngineRun>>,

    /// Cancelled by a pause or stop while an order is being placed
    trade_guard: Mutex<Option<CancellationToken>>,

    /// Cancels a `start()` still fetching the session baseline
    starting: Mutex<Option<CancellationToken>>,

    /// Serializes cycles
    cycle_lock: Mutex<()>,
}

impl AutoTradingEngine {
    pub fn new(parts: EngineParts, settings: EngineSettings) -> Self {
        let executor = OrderExecutor::new(parts.broker.clone(), parts.tracker.clone(), settings.retry.clone());

        Self {
            risk: RiskManager::new(parts.catalog),
            executor,
            broker: parts.broker,
            tracker: parts.tracker,
            journal: parts.journal,
            db: parts.db,
            events: parts.events,
            ticker_source: parts.ticker_source,
            settings,
            signals: Mutex::new(parts.signals),
            config: RwLock::new(None),
            state: RwLock::new(EngineState::Idle),
            baseline: RwLock::new(None),
            deferred: Mutex::new(VecDeque::new()),
            last_error: RwLock::new(None),
            run: Mutex::new(None),
            trade_guard: Mutex::new(None),
            starting: Mutex::new(None),
            cycle_lock: Mutex::new(()),
        }
    }

    // ==================== Accessors ====================

    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    pub async fn config(&self) -> Option<TradingConfig> {
        self.config.read().await.clone()
    }

    pub async fn baseline(&self) -> Option<SessionBaseline> {
        *self.baseline.read().await
    }

    /// Error that last stopped the engine, if any.
    pub async fn last_error(&self) -> Option<EngineError> {
        self.last_error.read().await.clone()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// Session metrics recomputed from the closed-trade journal.
    pub async fn metrics(&self) -> AutoTradingMetrics {
        let baseline = self.baseline().await.unwrap_or(SessionBaseline {
            day: Utc::now().date_naive(),
            start_balance: Decimal::ZERO,
        });
        let max_daily_loss_pct = self
            .config()
            .await
            .map(|c| c.max_daily_loss_pct)
            .unwrap_or_else(|| TradingConfig::default().max_daily_loss_pct);

        MetricsAggregator::compute(&self.journal.trades().await, &baseline, max_daily_loss_pct)
    }

    // ==================== Lifecycle ====================

    /// Replace the trading configuration. Only allowed while idle or stopped.
    pub async fn set_config(&self, config: TradingConfig) -> Result<(), EngineError> {
        let state = self.state().await;
        if !matches!(state, EngineState::Idle | EngineState::Stopped) {
            return Err(EngineError::ConfigLocked(state));
        }
        config.validate()?;

        if let Some(db) = &self.db {
            if let Err(e) = db.save_trading_config(&config).await {
                warn!(error = %e, "Failed to persist trading config");
            }
        }

        info!(
            mode = %config.mode,
            risk_pct = %config.max_risk_per_trade_pct,
            daily_loss_pct = %config.max_daily_loss_pct,
            min_confidence = config.min_confidence,
            auto_execute = config.auto_execute,
            "Trading config updated"
        );
        *self.config.write().await = Some(config);
        Ok(())
    }

    /// Validate the configuration, capture the session baseline, and start
    /// the cycle loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        let mut run = self.run.lock().await;

        let state = self.state().await;
        if !matches!(state, EngineState::Idle | EngineState::Stopped) {
            return Err(EngineError::AlreadyRunning(state));
        }

        let config = self.config().await.ok_or(ConfigError::Missing)?;
        config.validate()?;

        if let Some(previous) = run.take() {
            previous.cancel.cancel();
            let _ = previous.handle.await;
        }

        if state == EngineState::Stopped {
            self.set_state(EngineState::Idle).await;
        }

        let cancel = CancellationToken::new();
        *self.starting.lock().await = Some(cancel.clone());
        let baseline = self.establish_baseline(&cancel).await;
        self.starting.lock().await.take();
        baseline.map_err(EngineError::Baseline)?;
        if cancel.is_cancelled() {
            return Err(EngineError::Baseline(ExecutionError::Cancelled { attempts: 0 }));
        }

        *self.last_error.write().await = None;
        self.set_state(EngineState::Analyzing).await;

        let mut ticker = self.ticker_source.ticker(Duration::from_secs(config.cycle_interval_secs));
        let engine = Arc::clone(self);
        let loop_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            while ticker.tick(&loop_cancel).await {
                engine.run_cycle(&loop_cancel).await;
                if engine.state().await == EngineState::Stopped {
                    break;
                }
            }
            debug!("Engine loop exited");
        });

        info!(
            mode = %config.mode,
            interval_secs = config.cycle_interval_secs,
            "Auto-trading engine started"
        );
        *run = Some(EngineRun { cancel, handle });
        Ok(())
    }

    /// Suspend cycles. The step in progress completes.
    pub async fn pause(&self) -> Result<(), EngineError> {
        let mut state = self.state.write().await;
        if !state.is_active() {
            return Err(EngineError::NotRunning(*state));
        }

        let from = *state;
        *state = EngineState::Paused;
        self.events.publish(CoreEvent::EngineStateChanged { from, to: EngineState::Paused });
        self.halt_trade().await;
        info!(from = %from, "Engine paused");
        Ok(())
    }

    /// Resume after a pause, entering monitoring until the next tick.
    pub async fn resume(&self) -> Result<(), EngineError> {
        let mut state = self.state.write().await;
        if *state != EngineState::Paused {
            return Err(EngineError::NotPaused(*state));
        }

        *state = EngineState::Monitoring;
        self.events.publish(CoreEvent::EngineStateChanged {
            from: EngineState::Paused,
            to: EngineState::Monitoring,
        });
        info!("Engine resumed");
        Ok(())
    }

    /// Stop the engine and wait for the cycle loop to exit.
    pub async fn stop(&self) {
        if let Some(starting) = self.starting.lock().await.take() {
            starting.cancel();
        }
        let run = self.run.lock().await.take();

        self.set_state(EngineState::Stopped).await;
        self.halt_trade().await;

        if let Some(run) = run {
            run.cancel.cancel();
            if let Err(e) = run.handle.await {
                warn!(error = %e, "Engine loop ended abnormally");
            }
        }
        info!("Auto-trading engine stopped");
    }

    // ==================== Cycle ====================

    /// Run one engine cycle. Does nothing unless analyzing or monitoring.
    pub async fn run_cycle(&self, cancel: &CancellationToken) {
        let _cycle = self.cycle_lock.lock().await;

        match self.state().await {
            EngineState::Idle | EngineState::Paused | EngineState::Stopped => return,
            EngineState::Analyzing => {}
            EngineState::Monitoring => {
                if !self.step(EngineState::Monitoring, EngineState::Analyzing).await {
                    return;
                }
            }
            EngineState::ExecutingTrade => {
                self.fault(EngineError::InvalidTransition {
                    from: EngineState::ExecutingTrade,
                    to: EngineState::Analyzing,
                })
                .await;
                return;
            }
        }

        let Some(config) = self.config().await else {
            self.fault(ConfigError::Missing.into()).await;
            return;
        };

        self.roll_baseline(cancel).await;
        self.analyze(&config, cancel).await;

        // A trade may already have moved the engine to monitoring.
        match self.state().await {
            EngineState::Analyzing => {
                if !self.step(EngineState::Analyzing, EngineState::Monitoring).await {
                    return;
                }
            }
            EngineState::Monitoring => {}
            _ => return,
        }

        if !cancel.is_cancelled() {
            self.monitor(cancel).await;
        }
    }

    /// Process this cycle's signals. Signals left over by an interruption
    /// or a repeated symbol are deferred to the next cycle.
    async fn analyze(&self, config: &TradingConfig, cancel: &CancellationToken) {
        let mut queue = self.collect_signals(config).await;
        let mut handled: HashSet<String> = HashSet::new();
        let mut next_cycle: Vec<AISignal> = Vec::new();
        let now = Utc::now();

        while let Some(signal) = queue.pop_front() {
            if cancel.is_cancelled() || self.state().await != EngineState::Analyzing {
                queue.push_front(signal);
                break;
            }

            if signal.age_secs(now) > config.max_signal_age_secs as i64 {
                warn!(signal_id = %signal.id, symbol = %signal.symbol, "Skipping stale signal");
                continue;
            }

            let symbol = signal.symbol.to_uppercase();
            if !handled.insert(symbol) {
                debug!(signal_id = %signal.id, symbol = %signal.symbol, "Deferring signal to next cycle");
                next_cycle.push(signal);
                continue;
            }

            let exposure = self.exposure().await;
            let order = match self.risk.validate(&signal, config, &exposure) {
                Ok(order) => order,
                Err(reason) => {
                    info!(signal_id = %signal.id, symbol = %signal.symbol, reason = %reason, "Signal rejected");
                    self.events.publish(CoreEvent::SignalRejected {
                        signal_id: signal.id.clone(),
                        symbol: signal.symbol.clone(),
                        reason,
                    });
                    continue;
                }
            };

            if !config.auto_execute {
                info!(signal_id = %order.signal_id, symbol = %order.symbol, volume = %order.volume, "Signal ready for manual execution");
                self.events.publish(CoreEvent::SignalReady(order));
                continue;
            }

            let Some(halt) = self.begin_trade(cancel).await else {
                queue.push_front(signal);
                break;
            };
            let result = self.executor.execute(&order, &halt).await;
            self.trade_guard.lock().await.take();

            match result {
                Ok(position) => {
                    self.events.publish(CoreEvent::TradeExecuted(position));
                }
                Err(e) => {
                    warn!(signal_id = %order.signal_id, symbol = %order.symbol, error = %e, "Trade skipped");
                    self.events.publish(CoreEvent::TradeSkipped {
                        signal_id: order.signal_id.clone(),
                        symbol: order.symbol.clone(),
                        error: e.to_string(),
                    });
                }
            }

            if !self.step(EngineState::ExecutingTrade, EngineState::Monitoring).await {
                break;
            }
            if !queue.is_empty() && !self.step(EngineState::Monitoring, EngineState::Analyzing).await {
                break;
            }
        }

        next_cycle.extend(queue);
        self.defer(next_cycle).await;
    }

    /// Deferred signals first, then up to `max_signals_per_cycle` fresh ones.
    async fn collect_signals(&self, config: &TradingConfig) -> VecDeque<AISignal> {
        let mut queue: VecDeque<AISignal> = self.deferred.lock().await.drain(..).collect();

        let mut source = self.signals.lock().await;
        for _ in 0..config.max_signals_per_cycle {
            match source.next_signal().await {
                Some(signal) => queue.push_back(signal),
                None => break,
            }
        }
        queue
    }

    async fn defer(&self, signals: Vec<AISignal>) {
        if signals.is_empty() {
            return;
        }
        let mut deferred = self.deferred.lock().await;
        deferred.extend(signals);
        while deferred.len() > self.settings.max_deferred_signals {
            if let Some(dropped) = deferred.pop_front() {
                warn!(signal_id = %dropped.id, "Deferred signal queue full, dropping oldest");
            }
        }
    }

    async fn exposure(&self) -> Exposure {
        let baseline = self.baseline().await;
        let (start_balance, realized_today) = match baseline {
            Some(b) => (b.start_balance, self.journal.realized_on(b.day).await),
            None => (Decimal::ZERO, Decimal::ZERO),
        };

        Exposure {
            session_start_balance: start_balance,
            realized_today,
            unrealized_open: self.tracker.unrealized_total().await,
            open_symbols: self.tracker.open_symbols().await,
        }
    }

    /// Refresh open positions and close those past their stop or target.
    async fn monitor(&self, cancel: &CancellationToken) {
        let broker = self.broker.clone();
        match with_retry(&self.settings.retry, cancel, "get_open_positions", |_| {
            let broker = broker.clone();
            async move { broker.get_open_positions().await }
        })
        .await
        {
            Ok(snapshots) => {
                for snapshot in snapshots {
                    self.tracker.upsert(snapshot).await;
                }
            }
            Err(e) => warn!(error = %e, "Could not refresh positions"),
        }

        for position in self.tracker.positions().await {
            if cancel.is_cancelled() || self.state().await != EngineState::Monitoring {
                return;
            }

            let reason = if position.stop_loss_hit() {
                CloseReason::StopLoss
            } else if position.take_profit_hit() {
                CloseReason::TakeProfit
            } else {
                continue;
            };

            if let Err(e) = self.close(&position, reason, cancel).await {
                warn!(position_id = %position.id, error = %e, "Failed to close position");
            }
        }
    }

    /// Close a position at the broker on request.
    pub async fn close_position(&self, position_id: &str) -> Result<ClosedTrade, ExecutionError> {
        let position = self
            .tracker
            .get(position_id)
            .await
            .ok_or_else(|| ExecutionError::Terminal(BrokerError::UnknownPosition(position_id.to_string())))?;
        self.close(&position, CloseReason::Manual, &CancellationToken::new()).await
    }

    async fn close(
        &self,
        position: &TrackedPosition,
        reason: CloseReason,
        cancel: &CancellationToken,
    ) -> Result<ClosedTrade, ExecutionError> {
        let broker = self.broker.clone();
        let id = position.id.clone();
        let mut attempts = 0;

        let result = with_retry(&self.settings.retry, cancel, "close_position", |attempt| {
            attempts = attempt;
            let broker = broker.clone();
            let id = id.clone();
            async move { broker.close_position(&id).await }
        })
        .await;

        let (fill, reason) = match result {
            Ok(fill) => (fill, reason),
            Err(ExecutionError::Terminal(BrokerError::UnknownPosition(_))) => {
                // Gone after a retry: an earlier attempt closed it and the reply was lost.
                let reason = if attempts > 1 { reason } else { CloseReason::ClosedRemotely };
                warn!(
                    position_id = %position.id,
                    attempts,
                    reason = reason.as_str(),
                    "Position already closed at the broker, recording last known price"
                );
                let fill = CloseFill {
                    position_id: position.id.clone(),
                    close_price: position.current_price,
                    realized_pl: position.unrealized_pl,
                    closed_at: Utc::now(),
                };
                (fill, reason)
            }
            Err(e) => return Err(e),
        };

        self.tracker.remove(&position.id, fill.closed_at).await;

        let trade = ClosedTrade {
            position_id: position.id.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            volume: position.volume,
            open_price: position.open_price,
            close_price: fill.close_price,
            realized_pl: fill.realized_pl,
            opened_at: position.opened_at,
            closed_at: fill.closed_at,
            reason,
        };

        info!(
            position_id = %trade.position_id,
            symbol = %trade.symbol,
            reason = trade.reason.as_str(),
            realized_pl = %trade.realized_pl,
            "Position closed"
        );

        if self.journal.record(trade.clone()).await {
            self.events.publish(CoreEvent::PositionClosed(trade.clone()));
        }
        Ok(trade)
    }

    // ==================== Session Baseline ====================

    /// Reuse today's stored baseline, or capture one from the account.
    async fn establish_baseline(&self, cancel: &CancellationToken) -> Result<SessionBaseline, ExecutionError> {
        let day = Utc::now().date_naive();

        if let Some(db) = &self.db {
            match db.load_session_baseline(day).await {
                Ok(Some(baseline)) => {
                    info!(day = %day, balance = %baseline.start_balance, "Reusing session baseline");
                    *self.baseline.write().await = Some(baseline);
                    return Ok(baseline);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Failed to load session baseline"),
            }
        }

        let broker = self.broker.clone();
        let account = with_retry(&self.settings.retry, cancel, "get_account_snapshot", |_| {
            let broker = broker.clone();
            async move { broker.get_account_snapshot().await }
        })
        .await?;

        let baseline = SessionBaseline {
            day,
            start_balance: account.balance,
        };

        if let Some(db) = &self.db {
            if let Err(e) = db.save_session_baseline(&baseline).await {
                warn!(error = %e, "Failed to persist session baseline");
            }
        }

        info!(day = %day, balance = %baseline.start_balance, "Session baseline captured");
        *self.baseline.write().await = Some(baseline);
        self.events.publish(CoreEvent::SessionStarted {
            day,
            start_balance: baseline.start_balance,
        });
        Ok(baseline)
    }

    /// Start a new session when the UTC day has changed.
    async fn roll_baseline(&self, cancel: &CancellationToken) {
        let today = Utc::now().date_naive();
        if self.baseline().await.is_some_and(|b| b.day == today) {
            return;
        }

        if let Err(e) = self.establish_baseline(cancel).await {
            warn!(error = %e, "Could not roll session baseline, keeping previous");
        }
    }

    // ==================== State ====================

    /// Move `Analyzing -> ExecutingTrade` and arm the token that a pause or
    /// stop cancels. `None` when the engine already left `Analyzing`.
    async fn begin_trade(&self, cancel: &CancellationToken) -> Option<CancellationToken> {
        let from = {
            let mut state = self.state.write().await;
            if *state == EngineState::Analyzing {
                *state = EngineState::ExecutingTrade;
                self.events.publish(CoreEvent::EngineStateChanged {
                    from: EngineState::Analyzing,
                    to: EngineState::ExecutingTrade,
                });
                let halt = cancel.child_token();
                *self.trade_guard.lock().await = Some(halt.clone());
                return Some(halt);
            }
            *state
        };

        if !matches!(from, EngineState::Paused | EngineState::Stopped) {
            self.fault(EngineError::InvalidTransition {
                from,
                to: EngineState::ExecutingTrade,
            })
            .await;
        }
        None
    }

    /// Stop retries of the order being placed, if any.
    async fn halt_trade(&self) {
        if let Some(halt) = self.trade_guard.lock().await.take() {
            halt.cancel();
        }
    }

    async fn set_state(&self, to: EngineState) {
        let mut state = self.state.write().await;
        let from = *state;
        if from != to {
            *state = to;
            self.events.publish(CoreEvent::EngineStateChanged { from, to });
            debug!(from = %from, to = %to, "Engine state changed");
        }
    }

    /// Move `expected -> to`. Returns `false` without faulting when a pause
    /// or stop got in first; any other mismatch is a fault.
    async fn step(&self, expected: EngineState, to: EngineState) -> bool {
        let result = {
            let mut state = self.state.write().await;
            if *state == expected {
                *state = to;
                self.events.publish(CoreEvent::EngineStateChanged { from: expected, to });
                return true;
            }
            match *state {
                EngineState::Paused | EngineState::Stopped => None,
                from => Some(EngineError::InvalidTransition { from, to }),
            }
        };

        if let Some(e) = result {
            self.fault(e).await;
        }
        false
    }

    /// Stop on an unrecoverable error and report it.
    async fn fault(&self, e: EngineError) {
        error!(error = %e, "Engine fault, stopping");
        *self.last_error.write().await = Some(e.clone());
        self.set_state(EngineState::Stopped).await;
        self.events.publish(CoreEvent::EngineFault {
            message: e.to_string(),
            at: Utc::now(),
        });
    }
}
