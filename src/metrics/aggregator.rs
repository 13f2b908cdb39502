//! Session metrics derived from closed-trade history.

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;

use crate::models::{AutoTradingMetrics, ClosedTrade};

/// Start-of-session reference the metrics are measured against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionBaseline {
    /// UTC day of the session
    pub day: NaiveDate,

    /// Account balance when the session started
    pub start_balance: Decimal,
}

/// Pure metrics calculator. The same inputs always give the same output.
pub struct MetricsAggregator;

impl MetricsAggregator {
    /// Compute metrics from closed trades, in any order.
    ///
    /// `max_daily_loss_pct` (percent units) scales `daily_loss_used`.
    pub fn compute(
        trades: &[ClosedTrade],
        baseline: &SessionBaseline,
        max_daily_loss_pct: Decimal,
    ) -> AutoTradingMetrics {
        let mut metrics = AutoTradingMetrics::empty(baseline.start_balance);

        if trades.is_empty() {
            return metrics;
        }

        let mut sorted: Vec<&ClosedTrade> = trades.iter().collect();
        sorted.sort_by(|a, b| a.closed_at.cmp(&b.closed_at).then_with(|| a.position_id.cmp(&b.position_id)));
        let pnls: Vec<Decimal> = sorted.iter().map(|t| t.realized_pl).collect();

        metrics.total_trades = pnls.len() as u32;
        metrics.net_profit = pnls.iter().copied().sum();
        metrics.daily_profit = sorted
            .iter()
            .filter(|t| t.closed_on(baseline.day))
            .map(|t| t.realized_pl)
            .sum();

        Self::calculate_win_loss(&mut metrics, &pnls);
        Self::calculate_drawdown(&mut metrics, &pnls, baseline.start_balance);
        Self::calculate_sharpe(&mut metrics, &pnls);
        Self::calculate_daily_loss_used(&mut metrics, baseline.start_balance, max_daily_loss_pct);

        metrics
    }

    fn calculate_win_loss(metrics: &mut AutoTradingMetrics, pnls: &[Decimal]) {
        let wins: Vec<Decimal> = pnls.iter().copied().filter(|p| *p > Decimal::ZERO).collect();
        let losses: Vec<Decimal> = pnls.iter().copied().filter(|p| *p < Decimal::ZERO).collect();

        metrics.winning_trades = wins.len() as u32;
        metrics.losing_trades = losses.len() as u32;
        metrics.win_rate = wins.len() as f64 / pnls.len() as f64;

        metrics.gross_profit = wins.iter().copied().sum();
        metrics.gross_loss = losses.iter().map(|l| l.abs()).sum();

        if !wins.is_empty() {
            metrics.average_win = metrics.gross_profit / Decimal::from(wins.len() as u32);
        }
        if !losses.is_empty() {
            metrics.average_loss = metrics.gross_loss / Decimal::from(losses.len() as u32);
        }

        // 0.0 when there are no losses
        if metrics.gross_loss > Decimal::ZERO {
            metrics.profit_factor = (metrics.gross_profit / metrics.gross_loss).to_f64().unwrap_or(0.0);
        }
    }

    /// Peak-to-trough decline of balance, seeded with the start balance.
    fn calculate_drawdown(metrics: &mut AutoTradingMetrics, pnls: &[Decimal], start_balance: Decimal) {
        let mut equity = start_balance;
        let mut peak = start_balance;
        let mut max_dd = 0.0f64;

        for pnl in pnls {
            equity += pnl;
            if equity > peak {
                peak = equity;
            }
            if peak > Decimal::ZERO {
                let dd = ((peak - equity) / peak).to_f64().unwrap_or(0.0);
                max_dd = max_dd.max(dd);
            }
        }

        metrics.max_drawdown = max_dd.clamp(0.0, 1.0);
    }

    /// Per-trade Sharpe with a zero risk-free rate.
    fn calculate_sharpe(metrics: &mut AutoTradingMetrics, pnls: &[Decimal]) {
        if pnls.len() < 2 {
            return;
        }

        let returns: Vec<f64> = pnls.iter().filter_map(|p| p.to_f64()).collect();
        let mean = returns.iter().mean();
        let std_dev = returns.iter().std_dev();

        if std_dev > 0.0 && std_dev.is_finite() {
            metrics.sharpe_ratio = mean / std_dev;
        }
    }

    fn calculate_daily_loss_used(
        metrics: &mut AutoTradingMetrics,
        start_balance: Decimal,
        max_daily_loss_pct: Decimal,
    ) {
        let budget = start_balance * max_daily_loss_pct / Decimal::ONE_HUNDRED;
        if budget <= Decimal::ZERO || metrics.daily_profit >= Decimal::ZERO {
            return;
        }

        let used = (-metrics.daily_profit / budget).to_f64().unwrap_or(0.0);
        metrics.daily_loss_used = used.clamp(0.0, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CloseReason, TradeSide};
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn trade(id: &str, pl: Decimal, hours: i64) -> ClosedTrade {
        let closed_at = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap() + Duration::hours(hours);
        ClosedTrade {
            position_id: id.to_string(),
            symbol: "EURUSD".to_string(),
            side: TradeSide::Buy,
            volume: dec!(0.5),
            open_price: dec!(1.1000),
            close_price: dec!(1.1000),
            realized_pl: pl,
            opened_at: closed_at - Duration::minutes(30),
            closed_at,
            reason: CloseReason::TakeProfit,
        }
    }

    fn baseline() -> SessionBaseline {
        SessionBaseline {
            day: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
            start_balance: dec!(10000),
        }
    }

    #[test]
    fn test_win_rate_net_and_profit_factor() {
        let trades = vec![trade("a", dec!(150), 0), trade("b", dec!(-50), 1)];
        let metrics = MetricsAggregator::compute(&trades, &baseline(), dec!(3));

        assert_eq!(metrics.total_trades, 2);
        assert!((metrics.win_rate - 0.5).abs() < 1e-9);
        assert_eq!(metrics.net_profit, dec!(100));
        assert!((metrics.profit_factor - 3.0).abs() < 1e-9);
        assert_eq!(metrics.daily_profit, dec!(100));
    }

    #[test]
    fn test_no_trades_and_no_losses() {
        let empty = MetricsAggregator::compute(&[], &baseline(), dec!(3));
        assert_eq!(empty.win_rate, 0.0);
        assert_eq!(empty.session_start_balance, dec!(10000));

        let winners = vec![trade("a", dec!(10), 0), trade("b", dec!(20), 1)];
        let metrics = MetricsAggregator::compute(&winners, &baseline(), dec!(3));
        assert_eq!(metrics.profit_factor, 0.0);
        assert_eq!(metrics.win_rate, 1.0);
    }

    #[test]
    fn test_compute_is_idempotent_and_order_independent() {
        let trades = vec![
            trade("a", dec!(100), 0),
            trade("b", dec!(-80), 1),
            trade("c", dec!(40), 2),
        ];
        let mut reversed = trades.clone();
        reversed.reverse();

        let first = MetricsAggregator::compute(&trades, &baseline(), dec!(3));
        let second = MetricsAggregator::compute(&trades, &baseline(), dec!(3));
        let third = MetricsAggregator::compute(&reversed, &baseline(), dec!(3));

        assert_eq!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn test_daily_profit_and_loss_budget() {
        // Yesterday's win does not count toward today's profit.
        let trades = vec![trade("a", dec!(500), -24), trade("b", dec!(-150), 0)];
        let metrics = MetricsAggregator::compute(&trades, &baseline(), dec!(3));

        assert_eq!(metrics.daily_profit, dec!(-150));
        assert!((metrics.daily_loss_used - 0.5).abs() < 1e-9);

        let blown = vec![trade("a", dec!(-900), 0)];
        let metrics = MetricsAggregator::compute(&blown, &baseline(), dec!(3));
        assert_eq!(metrics.daily_loss_used, 1.0);
    }

    #[test]
    fn test_drawdown_seeded_with_balance() {
        // 10,000 -> 10,200 -> 9,996: 204 / 10,200 = 2%
        let trades = vec![trade("a", dec!(200), 0), trade("b", dec!(-204), 1)];
        let metrics = MetricsAggregator::compute(&trades, &baseline(), dec!(3));
        assert!((metrics.max_drawdown - 0.02).abs() < 1e-9);
    }
}
