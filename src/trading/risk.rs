//! Signal validation and fixed-fractional position sizing.
//!
//! A signal becomes an order only if it passes, in order: the symbol lists,
//! the one-position-per-symbol rule, the confidence threshold, the daily loss
//! budget, and stop-based sizing.

use std::collections::HashSet;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::TradingConfig;
use crate::error::RiskRejection;
use crate::models::{AISignal, SymbolCatalog, TradeSide};

/// An order the risk manager has approved and sized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizedOrder {
    pub signal_id: String,

    pub symbol: String,

    pub side: TradeSide,

    /// Volume in lots, rounded down to the symbol's lot step
    pub volume: Decimal,

    pub entry_price: Decimal,

    pub stop_loss: Decimal,

    pub take_profit: Decimal,

    /// Account-currency amount budgeted for a stop-out
    pub risk_amount: Decimal,

    pub stop_distance_pips: Decimal,
}

/// Current exposure the risk manager validates against.
#[derive(Debug, Clone, Default)]
pub struct Exposure {
    /// Balance at session start; all percentage limits are relative to it
    pub session_start_balance: Decimal,

    /// Realized P/L of trades closed today
    pub realized_today: Decimal,

    /// Unrealized P/L of open positions
    pub unrealized_open: Decimal,

    /// Symbols with an open position (uppercase)
    pub open_symbols: HashSet<String>,
}

impl Exposure {
    /// Loss already incurred this session (never negative).
    pub fn session_loss(&self) -> Decimal {
        (-(self.realized_today + self.unrealized_open)).max(Decimal::ZERO)
    }

    pub fn has_open(&self, symbol: &str) -> bool {
        self.open_symbols.contains(&symbol.to_uppercase())
    }
}

/// Validates signals and computes position sizes. Stateless and deterministic.
#[derive(Debug, Clone)]
pub struct RiskManager {
    catalog: Arc<SymbolCatalog>,
}

impl RiskManager {
    pub fn new(catalog: Arc<SymbolCatalog>) -> Self {
        Self { catalog }
    }

    /// Validate a signal against the configuration and current exposure.
    ///
    /// # Returns
    /// The sized order, or the first rule the signal violated.
    pub fn validate(
        &self,
        signal: &AISignal,
        config: &TradingConfig,
        exposure: &Exposure,
    ) -> Result<SizedOrder, RiskRejection> {
        if !config.symbol_allowed(&signal.symbol) {
            return Err(RiskRejection::SymbolExcluded {
                symbol: signal.symbol.clone(),
            });
        }

        if exposure.has_open(&signal.symbol) {
            return Err(RiskRejection::PositionAlreadyOpen {
                symbol: signal.symbol.clone(),
            });
        }

        if !(0.0..=1.0).contains(&signal.confidence) {
            return Err(RiskRejection::ConfidenceOutOfRange(signal.confidence));
        }

        if signal.confidence < config.min_confidence {
            return Err(RiskRejection::ConfidenceTooLow {
                confidence: signal.confidence,
                threshold: config.min_confidence,
            });
        }

        let balance = exposure.session_start_balance;
        let risk_amount = balance * config.max_risk_per_trade_pct / Decimal::ONE_HUNDRED;
        let daily_limit = balance * config.max_daily_loss_pct / Decimal::ONE_HUNDRED;

        // Rounding the volume down can only shrink the loss at stop below risk_amount.
        let projected = exposure.session_loss() + risk_amount;
        if projected > daily_limit {
            return Err(RiskRejection::DailyLossLimitExceeded {
                projected,
                limit: daily_limit,
            });
        }

        self.size(signal, risk_amount)
    }

    /// Volume such that the loss at the stop equals `risk_amount`.
    fn size(&self, signal: &AISignal, risk_amount: Decimal) -> Result<SizedOrder, RiskRejection> {
        let invalid = |reason: &str| RiskRejection::InvalidStopDistance {
            symbol: signal.symbol.clone(),
            reason: reason.to_string(),
        };

        if signal.stop_distance().is_zero() {
            return Err(invalid("stop loss equals entry"));
        }
        if !signal.stop_on_loss_side() {
            return Err(invalid("stop loss on the profit side of entry"));
        }

        let info = self.catalog.info(&signal.symbol);
        let stop_pips = info.to_pips(signal.stop_distance());
        let loss_per_lot = stop_pips * info.pip_value_per_lot;
        if loss_per_lot <= Decimal::ZERO {
            return Err(invalid("symbol has no pip value"));
        }

        let raw_volume = risk_amount / loss_per_lot;
        let volume = info.round_volume(raw_volume);

        debug!(
            symbol = %signal.symbol,
            stop_pips = %stop_pips,
            risk = %risk_amount,
            raw_volume = %raw_volume,
            volume = %volume,
            "Sized order"
        );

        if volume < info.min_volume || volume.is_zero() {
            return Err(RiskRejection::VolumeBelowMinimum {
                symbol: signal.symbol.clone(),
                volume,
                minimum: info.min_volume,
            });
        }

        Ok(SizedOrder {
            signal_id: signal.id.clone(),
            symbol: signal.symbol.clone(),
            side: signal.action,
            volume,
            entry_price: signal.suggested_entry,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            risk_amount,
            stop_distance_pips: stop_pips,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::TradingMode;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn signal(confidence: f64, stop: Decimal) -> AISignal {
        AISignal {
            id: "sig-1".to_string(),
            symbol: "EURUSD".to_string(),
            action: TradeSide::Buy,
            confidence,
            suggested_entry: dec!(1.1000),
            stop_loss: stop,
            take_profit: dec!(1.1040),
            generated_at: Utc::now(),
        }
    }

    fn exposure() -> Exposure {
        Exposure {
            session_start_balance: dec!(10000),
            ..Default::default()
        }
    }

    fn manager() -> RiskManager {
        RiskManager::new(Arc::new(SymbolCatalog::new()))
    }

    fn config() -> TradingConfig {
        TradingConfig::for_mode(TradingMode::Balanced)
    }

    #[test]
    fn test_sizes_to_risk_budget() {
        // 1% of 10,000 = 100 risked over 20 pips at $10/pip/lot
        let order = manager().validate(&signal(0.8, dec!(1.0980)), &config(), &exposure()).unwrap();

        assert_eq!(order.volume, dec!(0.5));
        assert_eq!(order.risk_amount, dec!(100));
        assert_eq!(order.stop_distance_pips, dec!(20));
    }

    #[test]
    fn test_low_confidence_rejected() {
        let result = manager().validate(&signal(0.5, dec!(1.0980)), &config(), &exposure());
        assert_eq!(
            result,
            Err(RiskRejection::ConfidenceTooLow { confidence: 0.5, threshold: 0.70 })
        );
    }

    #[test]
    fn test_confidence_outside_unit_range_rejected() {
        for confidence in [1.7, -0.2, f64::NAN] {
            let result = manager().validate(&signal(confidence, dec!(1.0980)), &config(), &exposure());
            assert!(matches!(result, Err(RiskRejection::ConfidenceOutOfRange(_))));
        }

        assert!(manager().validate(&signal(1.0, dec!(1.0980)), &config(), &exposure()).is_ok());
    }

    #[test]
    fn test_daily_loss_budget() {
        // 3% of 10,000 = 300. 200 lost + 100 at risk is exactly at the limit.
        let mut exposure = exposure();
        exposure.realized_today = dec!(-150);
        exposure.unrealized_open = dec!(-50);
        assert!(manager().validate(&signal(0.8, dec!(1.0980)), &config(), &exposure).is_ok());

        exposure.realized_today = dec!(-250);
        let result = manager().validate(&signal(0.8, dec!(1.0980)), &config(), &exposure);
        assert_eq!(
            result,
            Err(RiskRejection::DailyLossLimitExceeded { projected: dec!(400), limit: dec!(300) })
        );
    }

    #[test]
    fn test_profit_offsets_session_loss() {
        let mut exposure = exposure();
        exposure.realized_today = dec!(500);
        exposure.unrealized_open = dec!(-100);
        assert_eq!(exposure.session_loss(), Decimal::ZERO);
    }

    #[test]
    fn test_invalid_stops() {
        let zero = manager().validate(&signal(0.8, dec!(1.1000)), &config(), &exposure());
        assert!(matches!(zero, Err(RiskRejection::InvalidStopDistance { .. })));

        let wrong_side = manager().validate(&signal(0.8, dec!(1.1020)), &config(), &exposure());
        assert!(matches!(wrong_side, Err(RiskRejection::InvalidStopDistance { .. })));
    }

    #[test]
    fn test_wide_stop_below_minimum_volume() {
        // 100 / (20,000 pips * $10) rounds down to zero lots
        let result = manager().validate(&signal(0.8, dec!(-0.9000)), &config(), &exposure());
        assert!(matches!(result, Err(RiskRejection::VolumeBelowMinimum { .. })));
    }

    #[test]
    fn test_rules_checked_in_order() {
        let mut exposure = exposure();
        exposure.open_symbols.insert("EURUSD".to_string());

        // Open position reported before the confidence failure
        let result = manager().validate(&signal(0.1, dec!(1.0980)), &config(), &exposure);
        assert!(matches!(result, Err(RiskRejection::PositionAlreadyOpen { .. })));

        let excluded = TradingConfig {
            excluded_symbols: Some(["EURUSD".to_string()].into_iter().collect()),
            ..config()
        };
        let result = manager().validate(&signal(0.1, dec!(1.0980)), &excluded, &exposure);
        assert!(matches!(result, Err(RiskRejection::SymbolExcluded { .. })));
    }
}
