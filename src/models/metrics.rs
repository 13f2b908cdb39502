//! Auto-trading performance metrics derived from closed-trade history.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Session performance snapshot. Always recomputed, never edited in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoTradingMetrics {
    // === Basic Statistics ===
    /// Number of closed trades considered
    pub total_trades: u32,

    /// Sum of realized P/L
    pub net_profit: Decimal,

    /// Realized P/L of trades closed on the session day
    pub daily_profit: Decimal,

    /// Account balance at session start
    pub session_start_balance: Decimal,

    // === Win/Loss Metrics ===
    pub winning_trades: u32,

    pub losing_trades: u32,

    /// Win rate (0.0 to 1.0)
    pub win_rate: f64,

    /// Gross profit / |gross loss|; 0.0 when there are no losses
    pub profit_factor: f64,

    pub gross_profit: Decimal,

    /// Absolute value of summed losses
    pub gross_loss: Decimal,

    pub average_win: Decimal,

    /// Average loss (absolute value)
    pub average_loss: Decimal,

    // === Risk Metrics ===
    /// Peak-to-trough decline of the equity curve (0.0 to 1.0)
    pub max_drawdown: f64,

    /// Mean / std-dev of per-trade P/L
    pub sharpe_ratio: f64,

    /// Share of the daily loss budget consumed (0.0 to 1.0)
    pub daily_loss_used: f64,
}

impl AutoTradingMetrics {
    /// Empty metrics for a session.
    pub fn empty(session_start_balance: Decimal) -> Self {
        Self {
            total_trades: 0,
            net_profit: Decimal::ZERO,
            daily_profit: Decimal::ZERO,
            session_start_balance,
            winning_trades: 0,
            losing_trades: 0,
            win_rate: 0.0,
            profit_factor: 0.0,
            gross_profit: Decimal::ZERO,
            gross_loss: Decimal::ZERO,
            average_win: Decimal::ZERO,
            average_loss: Decimal::ZERO,
            max_drawdown: 0.0,
            sharpe_ratio: 0.0,
            daily_loss_used: 0.0,
        }
    }

    /// Balance implied by the session baseline plus today's result.
    pub fn current_balance(&self) -> Decimal {
        self.session_start_balance + self.daily_profit
    }
}

impl Default for AutoTradingMetrics {
    fn default() -> Self {
        Self::empty(Decimal::ZERO)
    }
}

impl std::fmt::Display for AutoTradingMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Auto-Trading Metrics ===")?;
        writeln!(f, "Session Balance: ${:.2}", self.session_start_balance)?;
        writeln!(f, "Total Trades:    {} (W: {}, L: {})",
            self.total_trades, self.winning_trades, self.losing_trades)?;
        writeln!(f, "Win Rate:        {:.1}%", self.win_rate * 100.0)?;
        writeln!(f, "Net Profit:      ${:.2}", self.net_profit)?;
        writeln!(f, "Daily Profit:    ${:.2}", self.daily_profit)?;
        writeln!(f, "Profit Factor:   {:.2}", self.profit_factor)?;
        writeln!(f, "Avg Win/Loss:    ${:.2} / ${:.2}", self.average_win, self.average_loss)?;
        writeln!(f, "Max Drawdown:    {:.2}%", self.max_drawdown * 100.0)?;
        writeln!(f, "Sharpe Ratio:    {:.2}", self.sharpe_ratio)?;
        writeln!(f, "Daily Loss Used: {:.1}%", self.daily_loss_used * 100.0)?;
        Ok(())
    }
}
