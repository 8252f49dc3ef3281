use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use fnv::FnvHashMap;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::candle::{Candle, safe_symbol};
use crate::error::{ReplayError, ReplayResult};
use crate::liquidity::{LiquidityParams, VolatilityRegime, derive_liquidity};

#[derive(Debug, Deserialize)]
struct CandleRow {
    timestamp: String,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
}

#[derive(Debug, Deserialize)]
struct LiquidityRow {
    timestamp: String,
    spread_bps: Decimal,
    depth_usd: Decimal,
    vol_regime: String,
}

fn parse_timestamp(raw: &str) -> ReplayResult<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Ok(unix) = raw.parse::<i64>() {
        return Utc
            .timestamp_opt(unix, 0)
            .single()
            .ok_or_else(|| ReplayError::data(format!("out-of-range unix timestamp: {raw}")));
    }
    // Fall back to a naive ISO form (no offset), normalized to UTC at load time —
    // never left alive as an unzoned representation.
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    Err(ReplayError::data(format!("unparseable timestamp: {raw}")))
}

fn parse_regime(raw: &str) -> ReplayResult<VolatilityRegime> {
    match raw {
        "low" => Ok(VolatilityRegime::Low),
        "normal" => Ok(VolatilityRegime::Normal),
        "high" => Ok(VolatilityRegime::High),
        "extreme" => Ok(VolatilityRegime::Extreme),
        other => Err(ReplayError::data(format!("unknown volatility regime: {other}"))),
    }
}

#[derive(Default)]
struct SymbolSeries {
    by_timeframe: FnvHashMap<String, Vec<Candle>>,
    liquidity: Vec<LiquidityParams>,
}

/// Loads candles and liquidity records once at startup and serves them read-only for
/// the rest of the run via binary search. Immutable after `load()`; safe to share
/// across readers by construction.
pub struct DataStore {
    data_dir: PathBuf,
    symbols: Vec<String>,
    timeframes: Vec<String>,
    series: FnvHashMap<String, SymbolSeries>,
}

impl DataStore {
    pub fn new(data_dir: impl Into<PathBuf>, symbols: Vec<String>, timeframes: Vec<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            symbols,
            timeframes,
            series: FnvHashMap::default(),
        }
    }

    pub fn load(&mut self) -> ReplayResult<()> {
        for symbol in self.symbols.clone() {
            let mut entry = SymbolSeries::default();
            for tf in self.timeframes.clone() {
                let path = self.candle_path(&symbol, &tf);
                let bars = load_candles(&path)?;
                entry.by_timeframe.insert(tf, bars);
            }

            let liq_path = self.liquidity_path(&symbol);
            entry.liquidity = if liq_path.exists() {
                load_liquidity(&liq_path)?
            } else {
                self.derive_liquidity_series(entry.by_timeframe.get("1m"))
            };

            self.series.insert(symbol, entry);
        }
        Ok(())
    }

    fn derive_liquidity_series(&self, bars: Option<&Vec<Candle>>) -> Vec<LiquidityParams> {
        match bars {
            Some(bars) => (0..bars.len()).map(|i| derive_liquidity(bars, i)).collect(),
            None => Vec::new(),
        }
    }

    fn candle_path(&self, symbol: &str, tf: &str) -> PathBuf {
        self.data_dir
            .join("candles")
            .join(format!("{}_{}.csv", safe_symbol(symbol), tf))
    }

    fn liquidity_path(&self, symbol: &str) -> PathBuf {
        self.data_dir
            .join("liquidity")
            .join(format!("{}.csv", safe_symbol(symbol)))
    }

    pub fn all_symbols(&self) -> Vec<&str> {
        self.symbols.iter().map(String::as_str).collect()
    }

    pub fn time_range(&self, symbol: &str, tf: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let bars = self.series.get(symbol)?.by_timeframe.get(tf)?;
        match (bars.first(), bars.last()) {
            (Some(first), Some(last)) => Some((first.timestamp, last.timestamp)),
            _ => None,
        }
    }

    /// Up to `limit` most-recent bars with timestamp <= `t`, ascending.
    pub fn candles_up_to(&self, symbol: &str, tf: &str, t: DateTime<Utc>, limit: usize) -> Vec<Candle> {
        let Some(bars) = self.series.get(symbol).and_then(|s| s.by_timeframe.get(tf)) else {
            return Vec::new();
        };
        let idx = partition_point(bars, |b| b.timestamp <= t);
        let start = idx.saturating_sub(limit);
        bars[start..idx].to_vec()
    }

    /// The unique bar with the largest timestamp <= `t`, or none.
    pub fn candle_at(&self, symbol: &str, tf: &str, t: DateTime<Utc>) -> Option<Candle> {
        let bars = self.series.get(symbol)?.by_timeframe.get(tf)?;
        let idx = partition_point(bars, |b| b.timestamp <= t);
        if idx == 0 { None } else { Some(bars[idx - 1]) }
    }

    /// The liquidity record active at `t` (step function, right-open interval), or
    /// `None` if nothing was loaded for this symbol.
    pub fn liquidity_at(&self, symbol: &str, t: DateTime<Utc>) -> Option<LiquidityParams> {
        let records = &self.series.get(symbol)?.liquidity;
        let idx = partition_point(records, |r| r.timestamp <= t);
        if idx == 0 { None } else { Some(records[idx - 1]) }
    }

    /// Installs bars directly, bypassing `load()`'s CSV round trip. Exists only for
    /// other modules' tests that need a `DataStore` without touching the filesystem.
    #[cfg(test)]
    pub(crate) fn inject_for_test(&mut self, symbol: &str, tf: &str, bars: Vec<Candle>) {
        let entry = self.series.entry(symbol.to_string()).or_default();
        entry.by_timeframe.insert(tf.to_string(), bars);
    }
}

/// Equivalent to the nightly `slice::partition_point`: the index of the first element
/// for which `pred` is false, assuming `pred` holds on a prefix.
fn partition_point<T>(slice: &[T], pred: impl Fn(&T) -> bool) -> usize {
    let mut lo = 0;
    let mut hi = slice.len();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(&slice[mid]) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

fn load_candles(path: &Path) -> ReplayResult<Vec<Candle>> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| ReplayError::data(format!("failed to open {}: {e}", path.display())))?;
    let mut bars = Vec::new();
    for row in reader.deserialize::<CandleRow>() {
        let row = row.map_err(|e| ReplayError::data(format!("malformed candle row in {}: {e}", path.display())))?;
        let candle = Candle {
            timestamp: parse_timestamp(&row.timestamp)?,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
        };
        candle.validate()?;
        bars.push(candle);
    }
    bars.sort_by_key(|c| c.timestamp);
    Ok(bars)
}

fn load_liquidity(path: &Path) -> ReplayResult<Vec<LiquidityParams>> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| ReplayError::data(format!("failed to open {}: {e}", path.display())))?;
    let mut records: BTreeMap<DateTime<Utc>, LiquidityParams> = BTreeMap::new();
    for row in reader.deserialize::<LiquidityRow>() {
        let row = row.map_err(|e| ReplayError::data(format!("malformed liquidity row in {}: {e}", path.display())))?;
        let timestamp = parse_timestamp(&row.timestamp)?;
        records.insert(
            timestamp,
            LiquidityParams {
                timestamp,
                spread_bps: row.spread_bps,
                depth_usd_at_1bp: row.depth_usd,
                volatility_regime: parse_regime(&row.vol_regime)?,
            },
        );
    }
    Ok(records.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_point_finds_boundary() {
        let xs = [1, 2, 3, 5, 8];
        assert_eq!(partition_point(&xs, |x| *x <= 3), 3);
        assert_eq!(partition_point(&xs, |x| *x <= 0), 0);
        assert_eq!(partition_point(&xs, |x| *x <= 100), 5);
    }

    #[test]
    fn parses_rfc3339_and_unix_timestamps() {
        let a = parse_timestamp("2025-01-01T00:00:00Z").unwrap();
        let b = parse_timestamp(&a.timestamp().to_string()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_unparseable_timestamp() {
        assert!(parse_timestamp("not-a-time").is_err());
    }
}
