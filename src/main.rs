//! Signal auto-trader CLI.
//!
//! Runs the auto-trading engine against a paper broker, fed from a
//! JSON-lines signal file, and inspects the persisted configuration,
//! metrics, and sync state.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use signal_autotrader::broker::{PaperBroker, RetryPolicy};
use signal_autotrader::context::{ContextOptions, TradingContext};
use signal_autotrader::credentials::{BrokerCredentials, CredentialError, EnvCredentialStore};
use signal_autotrader::db::Database;
use signal_autotrader::engine::{EngineSettings, EngineState};
use signal_autotrader::events::CoreEvent;
use signal_autotrader::journal::{TradeJournal, DEFAULT_JOURNAL_CAPACITY};
use signal_autotrader::metrics::{MetricsAggregator, SessionBaseline};
use signal_autotrader::models::SymbolCatalog;
use signal_autotrader::scheduler::IntervalSource;
use signal_autotrader::signals::JsonLinesSignalSource;
use signal_autotrader::sync::{SyncConfig, SyncStatus};
use signal_autotrader::trading::{TradingConfig, TradingMode};

/// Autonomous execution of AI trading signals.
#[derive(Parser)]
#[command(name = "autotrader")]
#[command(about = "Execute AI trading signals within configured risk limits", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(short, long, env = "AUTOTRADER_DATABASE", default_value = "sqlite:./autotrader.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, env = "AUTOTRADER_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine and auto-sync against a paper account until Ctrl+C
    Run {
        /// File with one JSON signal per line
        #[arg(short, long)]
        signals: PathBuf,

        /// Starting paper account balance
        #[arg(short, long, default_value = "10000")]
        balance: f64,

        /// Seconds between automatic account syncs
        #[arg(long, default_value = "300")]
        sync_interval: u64,

        /// Disable periodic account sync
        #[arg(long)]
        no_auto_sync: bool,

        /// Attempts per broker call, including the first
        #[arg(long, default_value = "4")]
        max_attempts: u32,
    },

    /// Show or change the trading configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show performance metrics from the closed-trade history
    Metrics,

    /// Show sync state, session baseline, and recent trades
    Status {
        /// Number of recent trades to show
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the stored configuration
    Show,

    /// Update the stored configuration
    Set {
        /// Preset (conservative, balanced, aggressive, custom)
        #[arg(short, long, value_parser = parse_mode)]
        mode: Option<TradingMode>,

        /// Max risk per trade, percent of session balance
        #[arg(long)]
        risk: Option<Decimal>,

        /// Max daily loss, percent of session balance
        #[arg(long)]
        daily_loss: Option<Decimal>,

        /// Minimum signal confidence (0.0 to 1.0)
        #[arg(long)]
        min_confidence: Option<f64>,

        /// Only trade these symbols (comma separated)
        #[arg(long, value_delimiter = ',')]
        allow: Vec<String>,

        /// Never trade these symbols (comma separated)
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<String>,

        /// Remove the allow and exclude lists
        #[arg(long)]
        clear_symbols: bool,

        /// Submit orders automatically (true) or only publish them (false)
        #[arg(long)]
        auto_execute: Option<bool>,

        /// Seconds between engine cycles
        #[arg(long)]
        interval: Option<u64>,

        /// Skip signals older than this many seconds
        #[arg(long)]
        max_signal_age: Option<u64>,
    },
}

fn parse_mode(s: &str) -> Result<TradingMode, String> {
    TradingMode::parse(s).ok_or_else(|| format!("unknown mode '{}'", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            signals,
            balance,
            sync_interval,
            no_auto_sync,
            max_attempts,
        } => {
            let balance = Decimal::try_from(balance).context("Invalid balance")?;
            let account_id = match BrokerCredentials::resolve(&EnvCredentialStore::default()) {
                Ok(creds) => creds.account_id,
                Err(CredentialError::NotFound(key)) => {
                    info!(missing = %key, "No broker credentials, using paper account");
                    "paper".to_string()
                }
                Err(e) => return Err(e).context("Failed to read broker credentials"),
            };

            let catalog = Arc::new(SymbolCatalog::new());
            let broker = Arc::new(PaperBroker::new(account_id.clone(), balance, catalog.clone()));
            let source = JsonLinesSignalSource::open(&signals).await?;
            let retry = RetryPolicy {
                max_attempts: max_attempts.max(1),
                ..RetryPolicy::default()
            };

            let ctx = TradingContext::init(
                broker,
                Box::new(source),
                Arc::new(IntervalSource),
                catalog,
                ContextOptions {
                    database_url: Some(cli.database.clone()),
                    engine: EngineSettings {
                        retry: retry.clone(),
                        ..EngineSettings::default()
                    },
                    sync: SyncConfig {
                        auto_sync_enabled: !no_auto_sync,
                        interval: Duration::from_secs(sync_interval.max(1)),
                        retry,
                    },
                    ..ContextOptions::default()
                },
            )
            .await?;

            let mut events = ctx.events.subscribe();
            let event_log = tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => log_event(&event),
                        Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log fell behind"),
                        Err(RecvError::Closed) => break,
                    }
                }
            });

            if let Err(e) = ctx.engine.start().await {
                ctx.shutdown().await;
                event_log.abort();
                return Err(e).context("Failed to start engine");
            }
            if !no_auto_sync {
                ctx.sync.start_auto_sync().await;
            }

            let config = ctx.engine.config().await.unwrap_or_default();
            println!("\n=== Signal Auto-Trader ===");
            println!("Account:          {} (paper)", account_id);
            println!("Balance:          ${:.2}", balance);
            println!("Mode:             {}", config.mode);
            println!("Cycle Interval:   {}s", config.cycle_interval_secs);
            println!("Auto-Execute:     {}", if config.auto_execute { "Yes" } else { "No" });
            println!("Auto-Sync:        {}", if no_auto_sync { "Off".to_string() } else { format!("every {}s", sync_interval) });
            println!("Signals:          {}", signals.display());
            println!("\nPress Ctrl+C to stop.\n");

            let mut watchdog = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        result.context("Failed to listen for Ctrl+C")?;
                        info!("Shutdown requested");
                        break;
                    }
                    _ = watchdog.tick() => {
                        if ctx.engine.state().await == EngineState::Stopped {
                            if let Some(e) = ctx.engine.last_error().await {
                                tracing::error!(error = %e, "Engine stopped after a fault");
                            }
                            break;
                        }
                    }
                }
            }

            ctx.shutdown().await;
            event_log.abort();

            println!("\n{}", ctx.engine.metrics().await);
        }

        Commands::Config { action } => {
            let db = Database::new(&cli.database).await?;
            let stored = db.load_trading_config().await?.unwrap_or_default();

            match action {
                ConfigAction::Show => print_config(&stored),

                ConfigAction::Set {
                    mode,
                    risk,
                    daily_loss,
                    min_confidence,
                    allow,
                    exclude,
                    clear_symbols,
                    auto_execute,
                    interval,
                    max_signal_age,
                } => {
                    let mut config = match mode {
                        Some(mode) => TradingConfig {
                            allowed_symbols: stored.allowed_symbols.clone(),
                            excluded_symbols: stored.excluded_symbols.clone(),
                            auto_execute: stored.auto_execute,
                            max_signal_age_secs: stored.max_signal_age_secs,
                            max_signals_per_cycle: stored.max_signals_per_cycle,
                            cycle_interval_secs: stored.cycle_interval_secs,
                            ..TradingConfig::for_mode(mode)
                        },
                        None => stored,
                    };

                    if risk.is_some() || daily_loss.is_some() || min_confidence.is_some() {
                        config.mode = TradingMode::Custom;
                    }
                    if let Some(risk) = risk {
                        config.max_risk_per_trade_pct = risk;
                    }
                    if let Some(daily_loss) = daily_loss {
                        config.max_daily_loss_pct = daily_loss;
                    }
                    if let Some(min_confidence) = min_confidence {
                        config.min_confidence = min_confidence;
                    }

                    if clear_symbols {
                        config.allowed_symbols = None;
                        config.excluded_symbols = None;
                    }
                    if !allow.is_empty() {
                        config.allowed_symbols = Some(symbol_set(allow));
                    }
                    if !exclude.is_empty() {
                        config.excluded_symbols = Some(symbol_set(exclude));
                    }

                    if let Some(auto_execute) = auto_execute {
                        config.auto_execute = auto_execute;
                    }
                    if let Some(interval) = interval {
                        config.cycle_interval_secs = interval;
                    }
                    if let Some(max_signal_age) = max_signal_age {
                        config.max_signal_age_secs = max_signal_age;
                    }

                    config.validate().context("Invalid configuration")?;
                    db.save_trading_config(&config).await?;

                    info!(mode = %config.mode, "Trading config saved");
                    print_config(&config);
                }
            }
        }

        Commands::Metrics => {
            let db = Arc::new(Database::new(&cli.database).await?);
            let config = db.load_trading_config().await?.unwrap_or_default();

            let journal = TradeJournal::new(DEFAULT_JOURNAL_CAPACITY, Some(db.clone()));
            journal.load().await?;

            let today = Utc::now().date_naive();
            let baseline = db.load_session_baseline(today).await?.unwrap_or(SessionBaseline {
                day: today,
                start_balance: Decimal::ZERO,
            });

            let metrics = MetricsAggregator::compute(&journal.trades().await, &baseline, config.max_daily_loss_pct);
            println!("\n{}", metrics);
        }

        Commands::Status { limit } => {
            let db = Arc::new(Database::new(&cli.database).await?);
            let config = db.load_trading_config().await?.unwrap_or_default();
            let last_sync = db.load_last_sync_date().await?;
            let today = Utc::now().date_naive();
            let baseline = db.load_session_baseline(today).await?;

            let journal = TradeJournal::new(DEFAULT_JOURNAL_CAPACITY, Some(db.clone()));
            journal.load().await?;
            let trades = journal.trades().await;

            println!("\n=== Status ===");
            println!("Mode:             {}", config.mode);
            println!(
                "Last Sync:        {}",
                last_sync.map(|t| t.to_rfc3339()).unwrap_or_else(|| "Never".to_string())
            );
            match baseline {
                Some(b) => println!("Session Balance:  ${:.2} ({})", b.start_balance, b.day),
                None => println!("Session Balance:  no session today"),
            }
            println!("Realized Today:   ${:.2}", journal.realized_on(today).await);
            println!("Closed Trades:    {}", trades.len());

            if !trades.is_empty() {
                println!(
                    "\n{:<20} {:<8} {:<5} {:>8} {:>12} {:>12} {:>10} {:<12}",
                    "POSITION", "SYMBOL", "SIDE", "VOLUME", "OPEN", "CLOSE", "P&L", "REASON"
                );
                println!("{}", "-".repeat(96));

                for trade in trades.iter().rev().take(limit) {
                    println!(
                        "{:<20} {:<8} {:<5} {:>8} {:>12} {:>12} {:>10.2} {:<12}",
                        truncate(&trade.position_id, 20),
                        trade.symbol,
                        trade.side.as_str(),
                        trade.volume,
                        trade.open_price,
                        trade.close_price,
                        trade.realized_pl,
                        trade.reason.as_str()
                    );
                }
            }
        }
    }

    Ok(())
}

fn log_event(event: &CoreEvent) {
    match event {
        CoreEvent::EngineStateChanged { from, to } => info!(from = %from, to = %to, "Engine state"),
        CoreEvent::SignalRejected { signal_id, symbol, reason } => {
            info!(signal_id = %signal_id, symbol = %symbol, reason = %reason, "Signal rejected")
        }
        CoreEvent::SignalReady(order) => info!(
            signal_id = %order.signal_id,
            symbol = %order.symbol,
            side = %order.side,
            volume = %order.volume,
            "Order ready for manual execution"
        ),
        CoreEvent::TradeExecuted(position) => info!(
            position_id = %position.id,
            symbol = %position.symbol,
            volume = %position.volume,
            "Trade executed"
        ),
        CoreEvent::TradeSkipped { signal_id, symbol, error } => {
            warn!(signal_id = %signal_id, symbol = %symbol, error = %error, "Trade skipped")
        }
        CoreEvent::PositionClosed(trade) => info!(
            position_id = %trade.position_id,
            symbol = %trade.symbol,
            pl = %trade.realized_pl,
            reason = trade.reason.as_str(),
            "Position closed"
        ),
        CoreEvent::EngineFault { message, .. } => warn!(message = %message, "Engine fault"),
        CoreEvent::SyncStateChanged(state) => match &state.status {
            SyncStatus::Failed(e) => warn!(error = %e, "Account sync failed"),
            SyncStatus::Completed(at) => info!(at = %at, "Account sync completed"),
            _ => {}
        },
        CoreEvent::SessionStarted { day, start_balance } => {
            info!(day = %day, start_balance = %start_balance, "Session started")
        }
    }
}

fn print_config(config: &TradingConfig) {
    println!("\n=== Trading Configuration ===\n");
    println!("Mode:                 {}", config.mode);

    println!("\nRisk Limits:");
    println!("  Max Risk per Trade: {}%", config.max_risk_per_trade_pct);
    println!("  Max Daily Loss:     {}%", config.max_daily_loss_pct);
    println!("  Min Confidence:     {:.0}%", config.min_confidence * 100.0);

    println!("\nSymbols:");
    println!("  Allowed:            {}", format_symbols(config.allowed_symbols.as_ref(), "all"));
    println!("  Excluded:           {}", format_symbols(config.excluded_symbols.as_ref(), "none"));

    println!("\nExecution:");
    println!("  Auto-Execute:       {}", if config.auto_execute { "Yes" } else { "No" });
    println!("  Cycle Interval:     {}s", config.cycle_interval_secs);
    println!("  Max Signal Age:     {}s", config.max_signal_age_secs);
    println!("  Signals per Cycle:  {}", config.max_signals_per_cycle);
}

fn format_symbols(symbols: Option<&HashSet<String>>, empty: &str) -> String {
    match symbols {
        Some(set) if !set.is_empty() => {
            let mut list: Vec<_> = set.iter().cloned().collect();
            list.sort();
            list.join(", ")
        }
        _ => empty.to_string(),
    }
}

fn symbol_set(symbols: Vec<String>) -> HashSet<String> {
    symbols
        .into_iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
