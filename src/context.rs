//! Process-wide wiring of the trading core.
//!
//! Built once at startup and handed to whatever drives the engine (the CLI,
//! tests). `shutdown` stops the engine and the auto-sync loop.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::broker::BrokerGateway;
use crate::db::Database;
use crate::engine::{AutoTradingEngine, EngineParts, EngineSettings};
use crate::events::EventBus;
use crate::journal::{TradeJournal, DEFAULT_JOURNAL_CAPACITY};
use crate::models::SymbolCatalog;
use crate::scheduler::TickerSource;
use crate::signals::SignalSource;
use crate::sync::{AccountSyncService, SyncConfig};
use crate::trading::{PositionTracker, TradingConfig};

/// Options for [`TradingContext::init`].
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// SQLite URL; `None` keeps everything in memory
    pub database_url: Option<String>,
    pub journal_capacity: usize,
    pub engine: EngineSettings,
    pub sync: SyncConfig,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            database_url: None,
            journal_capacity: DEFAULT_JOURNAL_CAPACITY,
            engine: EngineSettings::default(),
            sync: SyncConfig::default(),
        }
    }
}

/// Shared services of one trading process.
pub struct TradingContext {
    pub db: Option<Arc<Database>>,
    pub catalog: Arc<SymbolCatalog>,
    pub tracker: PositionTracker,
    pub journal: Arc<TradeJournal>,
    pub events: EventBus,
    pub engine: Arc<AutoTradingEngine>,
    pub sync: Arc<AccountSyncService>,
}

impl TradingContext {
    pub async fn init(
        broker: Arc<dyn BrokerGateway>,
        signals: Box<dyn SignalSource>,
        ticker_source: Arc<dyn TickerSource>,
        catalog: Arc<SymbolCatalog>,
        options: ContextOptions,
    ) -> Result<Self> {
        let db = match &options.database_url {
            Some(url) => Some(Arc::new(
                Database::new(url)
                    .await
                    .with_context(|| format!("Failed to open database {}", url))?,
            )),
            None => None,
        };

        let journal = Arc::new(TradeJournal::new(options.journal_capacity, db.clone()));
        journal.load().await.context("Failed to load closed-trade history")?;

        let tracker = PositionTracker::new(catalog.clone());
        let events = EventBus::new();

        let engine = Arc::new(AutoTradingEngine::new(
            EngineParts {
                broker: broker.clone(),
                signals,
                tracker: tracker.clone(),
                journal: journal.clone(),
                catalog: catalog.clone(),
                db: db.clone(),
                events: events.clone(),
                ticker_source: ticker_source.clone(),
            },
            options.engine,
        ));

        let stored = match &db {
            Some(db) => db.load_trading_config().await.context("Failed to load trading config")?,
            None => None,
        };
        let config = match stored {
            Some(config) if config.validate().is_ok() => config,
            Some(_) => {
                warn!("Stored trading config is invalid, using defaults");
                TradingConfig::default()
            }
            None => TradingConfig::default(),
        };
        engine.set_config(config).await?;

        let sync = Arc::new(AccountSyncService::new(
            broker.clone(),
            tracker.clone(),
            journal.clone(),
            db.clone(),
            events.clone(),
            ticker_source,
            options.sync,
        ));
        sync.restore().await.context("Failed to restore sync state")?;

        info!(broker = broker.name(), persisted = db.is_some(), "Trading context ready");

        Ok(Self {
            db,
            catalog,
            tracker,
            journal,
            events,
            engine,
            sync,
        })
    }

    /// Stop the engine and auto-sync. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.engine.stop().await;
        self.sync.shutdown().await;
        info!("Trading context shut down");
    }
}
