//! SQLite persistence for state that must survive a restart.
//!
//! Stores:
//! - The trading configuration
//! - Recent closed trades (the metrics input)
//! - The last successful account sync time
//! - The session baseline per UTC day
//!
//! Engine state is never persisted; the engine always starts idle.

use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::metrics::SessionBaseline;
use crate::models::{CloseReason, ClosedTrade, TradeSide};
use crate::trading::TradingConfig;

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Stored closed-trade record. Decimals are kept as TEXT to avoid float drift.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredClosedTrade {
    pub position_id: String,
    pub symbol: String,
    pub side: String,
    pub volume: String,
    pub open_price: String,
    pub close_price: String,
    pub realized_pl: String,
    pub opened_at: String,
    pub closed_at: String,
    pub reason: String,
}

impl TryFrom<StoredClosedTrade> for ClosedTrade {
    type Error = anyhow::Error;

    fn try_from(row: StoredClosedTrade) -> Result<Self> {
        Ok(ClosedTrade {
            side: TradeSide::parse(&row.side).ok_or_else(|| anyhow!("Invalid side: {}", row.side))?,
            reason: CloseReason::parse(&row.reason)
                .ok_or_else(|| anyhow!("Invalid close reason: {}", row.reason))?,
            volume: parse_decimal(&row.volume)?,
            open_price: parse_decimal(&row.open_price)?,
            close_price: parse_decimal(&row.close_price)?,
            realized_pl: parse_decimal(&row.realized_pl)?,
            opened_at: parse_time(&row.opened_at)?,
            closed_at: parse_time(&row.closed_at)?,
            position_id: row.position_id,
            symbol: row.symbol,
        })
    }
}

fn parse_decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).with_context(|| format!("Invalid decimal: {}", s))
}

/// Fixed-width RFC 3339 so TEXT ordering matches time ordering.
fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp: {}", s))?
        .with_timezone(&Utc))
}

impl Database {
    /// Open (creating if needed) the database and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Every connection to :memory: is a separate database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trading_config (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                config_json TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS closed_trades (
                position_id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                volume TEXT NOT NULL,
                open_price TEXT NOT NULL,
                close_price TEXT NOT NULL,
                realized_pl TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                closed_at TEXT NOT NULL,
                reason TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_closed_trades_closed_at ON closed_trades(closed_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_sync_date TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_baseline (
                day TEXT PRIMARY KEY,
                start_balance TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Trading Config ====================

    pub async fn save_trading_config(&self, config: &TradingConfig) -> Result<()> {
        let json = serde_json::to_string(config).context("Failed to serialize trading config")?;

        sqlx::query(
            r#"
            INSERT INTO trading_config (id, config_json, updated_at)
            VALUES (1, ?, datetime('now'))
            ON CONFLICT(id) DO UPDATE SET
                config_json = excluded.config_json,
                updated_at = datetime('now')
            "#,
        )
        .bind(json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load_trading_config(&self) -> Result<Option<TradingConfig>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT config_json FROM trading_config WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(json,)| serde_json::from_str(&json).context("Stored trading config is corrupt"))
            .transpose()
    }

    // ==================== Closed Trades ====================

    /// Record a closed trade. Recording the same position twice is a no-op.
    pub async fn record_closed_trade(&self, trade: &ClosedTrade) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO closed_trades (
                position_id, symbol, side, volume, open_price, close_price,
                realized_pl, opened_at, closed_at, reason
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trade.position_id)
        .bind(&trade.symbol)
        .bind(trade.side.as_str())
        .bind(trade.volume.to_string())
        .bind(trade.open_price.to_string())
        .bind(trade.close_price.to_string())
        .bind(trade.realized_pl.to_string())
        .bind(format_time(trade.opened_at))
        .bind(format_time(trade.closed_at))
        .bind(trade.reason.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent closed trades, oldest first.
    pub async fn recent_closed_trades(&self, limit: i64) -> Result<Vec<ClosedTrade>> {
        let rows = sqlx::query_as::<_, StoredClosedTrade>(
            "SELECT * FROM closed_trades ORDER BY closed_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch closed trades")?;

        let mut trades = rows
            .into_iter()
            .map(ClosedTrade::try_from)
            .collect::<Result<Vec<_>>>()?;
        trades.reverse();
        Ok(trades)
    }

    /// Delete all but the `keep` most recent closed trades.
    pub async fn prune_closed_trades(&self, keep: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM closed_trades WHERE position_id NOT IN (
                SELECT position_id FROM closed_trades ORDER BY closed_at DESC LIMIT ?
            )
            "#,
        )
        .bind(keep)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ==================== Sync State ====================

    pub async fn save_last_sync_date(&self, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (id, last_sync_date) VALUES (1, ?)
            ON CONFLICT(id) DO UPDATE SET last_sync_date = excluded.last_sync_date
            "#,
        )
        .bind(format_time(at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load_last_sync_date(&self) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT last_sync_date FROM sync_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(s,)| parse_time(&s)).transpose()
    }

    // ==================== Session Baseline ====================

    /// Store the baseline for its day. The first baseline of a day is kept.
    pub async fn save_session_baseline(&self, baseline: &SessionBaseline) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO session_baseline (day, start_balance) VALUES (?, ?)")
            .bind(baseline.day.to_string())
            .bind(baseline.start_balance.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn load_session_baseline(&self, day: NaiveDate) -> Result<Option<SessionBaseline>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT start_balance FROM session_baseline WHERE day = ?")
                .bind(day.to_string())
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(balance,)| {
            Ok(SessionBaseline {
                day,
                start_balance: parse_decimal(&balance)?,
            })
        })
        .transpose()
    }
}
