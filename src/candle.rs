use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ReplayError;

/// A single OHLCV bar. Bars are per (symbol, timeframe), globally sorted ascending
/// by timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    /// `low <= min(open, close) <= max(open, close) <= high`, `volume >= 0`.
    pub fn validate(&self) -> Result<(), ReplayError> {
        let body_low = self.open.min(self.close);
        let body_high = self.open.max(self.close);
        if self.low > body_low || body_high > self.high || self.volume < Decimal::ZERO {
            return Err(ReplayError::data(format!(
                "candle OHLC invariant violated at {}: o={} h={} l={} c={} v={}",
                self.timestamp, self.open, self.high, self.low, self.close, self.volume
            )));
        }
        Ok(())
    }

    pub fn mid(&self) -> Decimal {
        (self.high + self.low) / Decimal::from(2)
    }
}

/// Replaces `/` and `:` in a trading symbol with `_`, matching the data directory's
/// file-naming convention.
pub fn safe_symbol(symbol: &str) -> String {
    symbol.replace('/', "_").replace(':', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bar(o: Decimal, h: Decimal, l: Decimal, c: Decimal, v: Decimal) -> Candle {
        Candle {
            timestamp: Utc::now(),
            open: o,
            high: h,
            low: l,
            close: c,
            volume: v,
        }
    }

    #[test]
    fn valid_candle_passes() {
        bar(dec!(10), dec!(12), dec!(9), dec!(11), dec!(5))
            .validate()
            .unwrap();
    }

    #[test]
    fn low_above_body_is_rejected() {
        let c = bar(dec!(10), dec!(12), dec!(10.5), dec!(11), dec!(5));
        assert!(c.validate().is_err());
    }

    #[test]
    fn negative_volume_is_rejected() {
        let c = bar(dec!(10), dec!(12), dec!(9), dec!(11), dec!(-1));
        assert!(c.validate().is_err());
    }

    #[test]
    fn safe_symbol_replaces_separators() {
        assert_eq!(safe_symbol("BTC/USD:USD"), "BTC_USD_USD");
    }
}
