//! Per-symbol pip metadata used for sizing and P/L in pips.

use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Contract metadata for one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolInfo {
    /// Smallest standardized price increment
    pub pip_size: Decimal,

    /// Account-currency value of one pip for one lot
    pub pip_value_per_lot: Decimal,

    /// Volume granularity accepted by the broker
    pub lot_step: Decimal,

    /// Smallest tradable volume
    pub min_volume: Decimal,
}

impl SymbolInfo {
    pub fn forex() -> Self {
        Self {
            pip_size: dec!(0.0001),
            pip_value_per_lot: dec!(10),
            lot_step: dec!(0.01),
            min_volume: dec!(0.01),
        }
    }

    pub fn jpy_cross() -> Self {
        Self {
            pip_size: dec!(0.01),
            ..Self::forex()
        }
    }

    pub fn metal() -> Self {
        Self {
            pip_size: dec!(0.1),
            pip_value_per_lot: dec!(10),
            ..Self::forex()
        }
    }

    /// Base units per lot implied by pip size and pip value
    /// (100,000 for a standard FX lot).
    pub fn units_per_lot(&self) -> Decimal {
        if self.pip_size.is_zero() {
            return Decimal::ZERO;
        }
        self.pip_value_per_lot / self.pip_size
    }

    /// Convert a price delta to pips.
    pub fn to_pips(&self, price_delta: Decimal) -> Decimal {
        if self.pip_size.is_zero() {
            return Decimal::ZERO;
        }
        price_delta / self.pip_size
    }

    /// Round a volume down to the lot step.
    pub fn round_volume(&self, volume: Decimal) -> Decimal {
        if self.lot_step.is_zero() {
            return volume;
        }
        (volume / self.lot_step).floor() * self.lot_step
    }
}

/// Lookup table of symbol metadata with fallbacks for unknown symbols.
#[derive(Debug, Clone, Default)]
pub struct SymbolCatalog {
    symbols: HashMap<String, SymbolInfo>,
}

impl SymbolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: impl Into<String>, info: SymbolInfo) {
        self.symbols.insert(symbol.into().to_uppercase(), info);
    }

    #[must_use]
    pub fn with(mut self, symbol: impl Into<String>, info: SymbolInfo) -> Self {
        self.insert(symbol, info);
        self
    }

    /// Metadata for a symbol, guessed from its name when not registered.
    pub fn info(&self, symbol: &str) -> SymbolInfo {
        let key = symbol.to_uppercase();
        if let Some(info) = self.symbols.get(&key) {
            return *info;
        }
        if key.starts_with("XAU") || key.starts_with("XAG") {
            SymbolInfo::metal()
        } else if key.contains("JPY") {
            SymbolInfo::jpy_cross()
        } else {
            SymbolInfo::forex()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_guesses() {
        let catalog = SymbolCatalog::new();
        assert_eq!(catalog.info("eurusd").pip_size, dec!(0.0001));
        assert_eq!(catalog.info("USDJPY").pip_size, dec!(0.01));
        assert_eq!(catalog.info("XAUUSD").pip_size, dec!(0.1));
        assert_eq!(catalog.info("EURUSD").units_per_lot(), dec!(100000));
    }

    #[test]
    fn test_registered_symbol_overrides_guess() {
        let custom = SymbolInfo {
            pip_size: dec!(1),
            pip_value_per_lot: dec!(1),
            lot_step: dec!(0.1),
            min_volume: dec!(0.1),
        };
        let catalog = SymbolCatalog::new().with("US30", custom);
        assert_eq!(catalog.info("us30"), custom);
    }

    #[test]
    fn test_round_volume_floors_to_step() {
        let info = SymbolInfo::forex();
        assert_eq!(info.round_volume(dec!(0.4999)), dec!(0.49));
        assert_eq!(info.round_volume(dec!(0.5)), dec!(0.50));
    }
}
