use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

use crate::metrics::EncodedMetrics;

/// Raw OHLCV bar as provided by a data source. No adjustments applied.
/// Uniquely keyed by (asset, source, timeframe, timestamp).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketBar {
    pub asset: String,
    pub source: String,
    pub timeframe: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Corporate action companion row for a bar (dividends, splits, capital gains).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketAction {
    pub asset: String,
    pub source: String,
    pub timeframe: String,
    pub timestamp: DateTime<Utc>,
    pub dividends: Option<f64>,
    pub stock_splits: Option<f64>,
    pub capital_gains: Option<f64>,
}

#[derive(Debug, Error)]
#[error("Invalid MACD parameters: fast={fast}, slow={slow}, signal={signal}")]
pub struct InvalidMacdParams {
    pub fast: u32,
    pub slow: u32,
    pub signal: u32,
}

/// MACD (fast, slow, signal) period triple. Construction enforces
/// `0 < fast < slow` and `signal < slow`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacdParams {
    fast: u32,
    slow: u32,
    signal: u32,
}

impl MacdParams {
    pub fn new(fast: u32, slow: u32, signal: u32) -> Result<Self, InvalidMacdParams> {
        if fast > 0 && signal > 0 && fast < slow && signal < slow {
            Ok(Self { fast, slow, signal })
        } else {
            Err(InvalidMacdParams { fast, slow, signal })
        }
    }

    pub fn fast(&self) -> u32 {
        self.fast
    }

    pub fn slow(&self) -> u32 {
        self.slow
    }

    pub fn signal(&self) -> u32 {
        self.signal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionSizing {
    Fixed,
    PercentEquity,
    VolTarget,
    Kelly,
}

impl PositionSizing {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSizing::Fixed => "fixed",
            PositionSizing::PercentEquity => "percent_equity",
            PositionSizing::VolTarget => "vol_target",
            PositionSizing::Kelly => "kelly",
        }
    }
}

impl FromStr for PositionSizing {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fixed" => Ok(PositionSizing::Fixed),
            "percent_equity" => Ok(PositionSizing::PercentEquity),
            "vol_target" => Ok(PositionSizing::VolTarget),
            "kelly" => Ok(PositionSizing::Kelly),
            other => Err(anyhow!("Unknown position sizing mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeDirection {
    LongOnly,
    ShortOnly,
    LongShort,
}

impl TradeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeDirection::LongOnly => "long_only",
            TradeDirection::ShortOnly => "short_only",
            TradeDirection::LongShort => "long_short",
        }
    }
}

impl FromStr for TradeDirection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "long_only" => Ok(TradeDirection::LongOnly),
            "short_only" => Ok(TradeDirection::ShortOnly),
            "long_short" => Ok(TradeDirection::LongShort),
            other => Err(anyhow!("Unknown trade direction '{}'", other)),
        }
    }
}

/// Composite identity of a simulation run: execution context plus strategy
/// parameters, excluding run timestamp and metrics. Two runs with the same
/// key are the same run regardless of when they executed, so this tuple is
/// used for deduplication, diffing against the store, and as the
/// insert-conflict target.
#[derive(Debug, Clone)]
pub struct RunKey {
    pub asset: String,
    pub timeframe: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub initial_cash: f64,
    pub fee: f64,
    pub slippage: f64,
    pub position_sizing: PositionSizing,
    pub direction: TradeDirection,
    pub random_seed: i64,
    pub fast_period: u32,
    pub slow_period: u32,
    pub signal_period: u32,
}

impl PartialEq for RunKey {
    fn eq(&self, other: &Self) -> bool {
        self.asset == other.asset
            && self.timeframe == other.timeframe
            && self.start_date == other.start_date
            && self.end_date == other.end_date
            && self.initial_cash.to_bits() == other.initial_cash.to_bits()
            && self.fee.to_bits() == other.fee.to_bits()
            && self.slippage.to_bits() == other.slippage.to_bits()
            && self.position_sizing == other.position_sizing
            && self.direction == other.direction
            && self.random_seed == other.random_seed
            && self.fast_period == other.fast_period
            && self.slow_period == other.slow_period
            && self.signal_period == other.signal_period
    }
}

impl Eq for RunKey {}

impl Hash for RunKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.asset.hash(state);
        self.timeframe.hash(state);
        self.start_date.hash(state);
        self.end_date.hash(state);
        // Floats participate in the composite key; hash their bit patterns.
        self.initial_cash.to_bits().hash(state);
        self.fee.to_bits().hash(state);
        self.slippage.to_bits().hash(state);
        self.position_sizing.hash(state);
        self.direction.hash(state);
        self.random_seed.hash(state);
        self.fast_period.hash(state);
        self.slow_period.hash(state);
        self.signal_period.hash(state);
    }
}

impl RunKey {
    /// Keys are only ever built from validated params, so this cannot fail.
    pub fn params(&self) -> MacdParams {
        MacdParams {
            fast: self.fast_period,
            slow: self.slow_period,
            signal: self.signal_period,
        }
    }
}

impl std::fmt::Display for RunKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} -> {} fast={} slow={} signal={}",
            self.asset,
            self.timeframe,
            self.start_date.format("%Y-%m-%d"),
            self.end_date.format("%Y-%m-%d"),
            self.fast_period,
            self.slow_period,
            self.signal_period
        )
    }
}

/// A simulation run through its lifecycle: built by the task-set builder with
/// index bounds and empty metrics, filled in by a worker, then persisted.
/// `start_idx`/`end_idx` are execution-only and never stored.
#[derive(Debug, Clone)]
pub struct SimulationRun {
    pub key: RunKey,
    pub start_idx: usize,
    pub end_idx: usize,
    pub metrics: Option<EncodedMetrics>,
}

/// Parses a timeframe string like "1d", "4h" or "15m" into a duration.
pub fn parse_timeframe(timeframe: &str) -> Result<Duration> {
    let trimmed = timeframe.trim();
    if trimmed.len() < 2 {
        return Err(anyhow!("Invalid timeframe '{}'", timeframe));
    }
    let (value_part, unit) = trimmed.split_at(trimmed.len() - 1);
    let value: i64 = value_part
        .parse()
        .map_err(|_| anyhow!("Invalid timeframe '{}'", timeframe))?;
    if value <= 0 {
        return Err(anyhow!("Timeframe '{}' must be positive", timeframe));
    }
    match unit {
        "w" => Ok(Duration::weeks(value)),
        "d" => Ok(Duration::days(value)),
        "h" => Ok(Duration::hours(value)),
        "m" => Ok(Duration::minutes(value)),
        "s" => Ok(Duration::seconds(value)),
        other => Err(anyhow!("Unknown timeframe unit '{}'", other)),
    }
}
