use chrono::{DateTime, Utc};
use itertools::Itertools;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::candle::Candle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolatilityRegime {
    Low,
    Normal,
    High,
    Extreme,
}

impl VolatilityRegime {
    /// `vol_mult` table used by the entered-book delay formula.
    pub fn vol_mult(&self) -> Decimal {
        match self {
            Self::Low => Decimal::new(2, 1),      // 0.2
            Self::Normal => Decimal::ONE,          // 1.0
            Self::High => Decimal::new(3, 0),      // 3.0
            Self::Extreme => Decimal::new(8, 0),   // 8.0
        }
    }

    pub fn is_elevated(&self) -> bool {
        matches!(self, Self::High | Self::Extreme)
    }
}

/// Per (symbol, time) liquidity record. `liquidity_at` returns the record active at a
/// time as a right-open step function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidityParams {
    pub timestamp: DateTime<Utc>,
    pub spread_bps: Decimal,
    pub depth_usd_at_1bp: Decimal,
    pub volatility_regime: VolatilityRegime,
}

impl LiquidityParams {
    /// `depth_mult` steps down by depth thresholds used by the entered-book delay
    /// formula.
    pub fn depth_mult(&self) -> Decimal {
        let depth = self.depth_usd_at_1bp;
        if depth > Decimal::new(80_000, 0) {
            Decimal::new(5, 1) // 0.5
        } else if depth > Decimal::new(30_000, 0) {
            Decimal::ONE
        } else if depth > Decimal::new(10_000, 0) {
            Decimal::new(2, 0)
        } else {
            Decimal::new(4, 0)
        }
    }
}

/// Classification thresholds applied to a rolling 20-bar ATR-percent when no
/// liquidity file is supplied for a symbol.
struct RegimeTable {
    regime: VolatilityRegime,
    spread_bps: Decimal,
    depth_usd: Decimal,
}

const REGIME_TABLE: [(f64, VolatilityRegime, i64, i64); 4] = [
    (0.003, VolatilityRegime::Low, 3, 100_000),
    (0.008, VolatilityRegime::Normal, 5, 50_000),
    (0.02, VolatilityRegime::High, 12, 20_000),
    (f64::INFINITY, VolatilityRegime::Extreme, 25, 5_000),
];

/// Derives a liquidity record for `at_index` from a rolling 20-bar ATR-percent window
/// ending at that bar, applying the volume factor to depth.
///
/// `bars` must be sorted ascending and `at_index` must be a valid index into it.
pub fn derive_liquidity(bars: &[Candle], at_index: usize) -> LiquidityParams {
    let window_start = at_index.saturating_sub(19);
    let window = &bars[window_start..=at_index];

    let atr_pct = average_true_range_percent(window);
    let entry = REGIME_TABLE
        .iter()
        .find(|(threshold, ..)| atr_pct < *threshold)
        .unwrap_or(&REGIME_TABLE[3]);
    let table = RegimeTable {
        regime: entry.1,
        spread_bps: Decimal::from(entry.2),
        depth_usd: Decimal::from(entry.3),
    };

    let bar = &bars[at_index];
    let volume_factor = volume_factor(bar.volume);

    LiquidityParams {
        timestamp: bar.timestamp,
        spread_bps: table.spread_bps,
        depth_usd_at_1bp: table.depth_usd * volume_factor,
        volatility_regime: table.regime,
    }
}

/// `max(0.2, min(1.0, volume / 100_000))`.
fn volume_factor(volume: Decimal) -> Decimal {
    let factor = (volume / Decimal::from(100_000)).min(Decimal::ONE);
    factor.max(Decimal::new(2, 1))
}

/// Average of per-bar true-range-as-percent-of-close over the window. The first bar
/// has no previous close, so true range there is just its own high-low range.
fn average_true_range_percent(window: &[Candle]) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let first_bar_range = (window[0].high - window[0].low, window[0].close);
    let paired_ranges = window.iter().tuple_windows().map(|(prev, bar)| {
        let true_range = (bar.high - bar.low).max((bar.high - prev.close).abs()).max((bar.low - prev.close).abs());
        (true_range, bar.close)
    });

    let (sum, count) = std::iter::once(first_bar_range)
        .chain(paired_ranges)
        .filter(|(_, close)| !close.is_zero())
        .fold((0.0_f64, 0_u32), |(sum, count), (true_range, close)| {
            (sum + (true_range / close).to_f64().unwrap_or(0.0), count + 1)
        });

    if count == 0 { 0.0 } else { sum / count as f64 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bar(ts: DateTime<Utc>, o: Decimal, h: Decimal, l: Decimal, c: Decimal, v: Decimal) -> Candle {
        Candle {
            timestamp: ts,
            open: o,
            high: h,
            low: l,
            close: c,
            volume: v,
        }
    }

    #[test]
    fn vol_mult_table_matches_spec() {
        assert_eq!(VolatilityRegime::Low.vol_mult(), dec!(0.2));
        assert_eq!(VolatilityRegime::Normal.vol_mult(), dec!(1));
        assert_eq!(VolatilityRegime::High.vol_mult(), dec!(3));
        assert_eq!(VolatilityRegime::Extreme.vol_mult(), dec!(8));
    }

    #[test]
    fn depth_mult_steps_down_by_threshold() {
        let mk = |depth: Decimal| LiquidityParams {
            timestamp: Utc::now(),
            spread_bps: dec!(5),
            depth_usd_at_1bp: depth,
            volatility_regime: VolatilityRegime::Normal,
        };
        assert_eq!(mk(dec!(90000)).depth_mult(), dec!(0.5));
        assert_eq!(mk(dec!(50000)).depth_mult(), dec!(1));
        assert_eq!(mk(dec!(20000)).depth_mult(), dec!(2));
        assert_eq!(mk(dec!(5000)).depth_mult(), dec!(4));
    }

    #[test]
    fn volume_factor_floors_at_point_two() {
        assert_eq!(volume_factor(dec!(0)), dec!(0.2));
        assert_eq!(volume_factor(dec!(50000)), dec!(0.5));
        assert_eq!(volume_factor(dec!(500000)), dec!(1));
    }

    #[test]
    fn derive_liquidity_classifies_calm_market_as_low() {
        let ts = Utc::now();
        let bars: Vec<Candle> = (0..20)
            .map(|i| {
                bar(
                    ts + chrono::Duration::minutes(i),
                    dec!(100),
                    dec!(100.1),
                    dec!(99.95),
                    dec!(100.05),
                    dec!(200000),
                )
            })
            .collect();
        let liq = derive_liquidity(&bars, 19);
        assert_eq!(liq.volatility_regime, VolatilityRegime::Low);
    }

    #[test]
    fn derive_liquidity_classifies_violent_swings_as_extreme() {
        let ts = Utc::now();
        let bars: Vec<Candle> = (0..20)
            .map(|i| {
                bar(
                    ts + chrono::Duration::minutes(i),
                    dec!(100),
                    dec!(110),
                    dec!(90),
                    dec!(105),
                    dec!(200000),
                )
            })
            .collect();
        let liq = derive_liquidity(&bars, 19);
        assert_eq!(liq.volatility_regime, VolatilityRegime::Extreme);
    }
}
