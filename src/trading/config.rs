//! Trading configuration and risk-mode presets.

use std::collections::HashSet;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Risk appetite preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Conservative,
    Balanced,
    Aggressive,
    /// Risk limits supplied by the user
    Custom,
}

impl TradingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingMode::Conservative => "conservative",
            TradingMode::Balanced => "balanced",
            TradingMode::Aggressive => "aggressive",
            TradingMode::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "conservative" => Some(Self::Conservative),
            "balanced" => Some(Self::Balanced),
            "aggressive" => Some(Self::Aggressive),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for one engine run. Replaced only while the engine is
/// idle or stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingConfig {
    pub mode: TradingMode,

    /// Maximum loss at stop per trade, in percent of session start balance
    pub max_risk_per_trade_pct: Decimal,

    /// Maximum realized plus unrealized session loss, in percent of session start balance
    pub max_daily_loss_pct: Decimal,

    /// Minimum signal confidence to act on (0.0 to 1.0)
    pub min_confidence: f64,

    /// When set, only these symbols are traded
    #[serde(default)]
    pub allowed_symbols: Option<HashSet<String>>,

    /// When set, these symbols are never traded
    #[serde(default)]
    pub excluded_symbols: Option<HashSet<String>>,

    /// Submit validated orders automatically; otherwise only publish them
    pub auto_execute: bool,

    /// Signals older than this are skipped
    pub max_signal_age_secs: u64,

    /// Upper bound on signals pulled from the source per cycle
    pub max_signals_per_cycle: usize,

    /// Seconds between engine cycles
    pub cycle_interval_secs: u64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self::for_mode(TradingMode::Balanced)
    }
}

impl TradingConfig {
    /// Preset limits for a mode. `Custom` starts from the balanced values.
    pub fn for_mode(mode: TradingMode) -> Self {
        let (risk, daily, confidence) = match mode {
            TradingMode::Conservative => (dec!(0.5), dec!(2), 0.80),
            TradingMode::Balanced | TradingMode::Custom => (dec!(1), dec!(3), 0.70),
            TradingMode::Aggressive => (dec!(2), dec!(5), 0.60),
        };

        Self {
            mode,
            max_risk_per_trade_pct: risk,
            max_daily_loss_pct: daily,
            min_confidence: confidence,
            allowed_symbols: None,
            excluded_symbols: None,
            auto_execute: true,
            max_signal_age_secs: 300,      // 5 minutes
            max_signals_per_cycle: 10,
            cycle_interval_secs: 60,
        }
    }

    /// Check ranges and symbol lists for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_percent("max_risk_per_trade_pct", self.max_risk_per_trade_pct)?;
        check_percent("max_daily_loss_pct", self.max_daily_loss_pct)?;

        if !(0.0..=1.0).contains(&self.min_confidence) || self.min_confidence.is_nan() {
            return Err(ConfigError::ConfidenceOutOfRange(self.min_confidence));
        }

        if self.max_daily_loss_pct < self.max_risk_per_trade_pct {
            return Err(ConfigError::DailyBelowPerTrade {
                daily: self.max_daily_loss_pct,
                per_trade: self.max_risk_per_trade_pct,
            });
        }

        if self.cycle_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval);
        }

        if let Some(allowed) = &self.allowed_symbols {
            if allowed.is_empty() {
                return Err(ConfigError::EmptyAllowList);
            }
            if let Some(excluded) = &self.excluded_symbols {
                let excluded = normalized(excluded);
                if normalized(allowed).is_subset(&excluded) {
                    return Err(ConfigError::ContradictorySymbols);
                }
            }
        }

        Ok(())
    }

    /// Whether the allow/deny lists permit trading `symbol`.
    pub fn symbol_allowed(&self, symbol: &str) -> bool {
        let symbol = symbol.to_uppercase();

        if let Some(excluded) = &self.excluded_symbols {
            if excluded.iter().any(|s| s.eq_ignore_ascii_case(&symbol)) {
                return false;
            }
        }

        match &self.allowed_symbols {
            Some(allowed) => allowed.iter().any(|s| s.eq_ignore_ascii_case(&symbol)),
            None => true,
        }
    }
}

fn check_percent(field: &'static str, value: Decimal) -> Result<(), ConfigError> {
    if value <= Decimal::ZERO || value > dec!(100) {
        return Err(ConfigError::PercentOutOfRange { field, value });
    }
    Ok(())
}

fn normalized(symbols: &HashSet<String>) -> HashSet<String> {
    symbols.iter().map(|s| s.to_uppercase()).collect()
}
