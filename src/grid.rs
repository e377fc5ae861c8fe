use anyhow::{anyhow, Result};

use crate::models::MacdParams;

/// Inclusive-exclusive integer range with step, matching the usual
/// `start..stop` by `step` semantics of the grid configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodRange {
    pub start: u32,
    pub stop: u32,
    pub step: u32,
}

impl PeriodRange {
    pub fn new(start: u32, stop: u32, step: u32) -> Result<Self> {
        if step == 0 {
            return Err(anyhow!("Period range step must be positive"));
        }
        Ok(Self { start, stop, step })
    }

    pub fn expand(&self) -> Vec<u32> {
        (self.start..self.stop)
            .step_by(self.step as usize)
            .collect()
    }
}

/// Candidate periods for each MACD axis. Valid parameter triples are the
/// cross product filtered through the `MacdParams` invariant.
#[derive(Debug, Clone)]
pub struct MacdParamsGrid {
    pub fast_periods: Vec<u32>,
    pub slow_periods: Vec<u32>,
    pub signal_periods: Vec<u32>,
}

impl MacdParamsGrid {
    pub fn from_ranges(fast: PeriodRange, slow: PeriodRange, signal: PeriodRange) -> Result<Self> {
        let grid = Self {
            fast_periods: fast.expand(),
            slow_periods: slow.expand(),
            signal_periods: signal.expand(),
        };
        if grid.fast_periods.is_empty()
            || grid.slow_periods.is_empty()
            || grid.signal_periods.is_empty()
        {
            return Err(anyhow!("MACD parameter grid has an empty period axis"));
        }
        if grid.valid_params().next().is_none() {
            return Err(anyhow!("MACD parameter grid contains no valid triple"));
        }
        Ok(grid)
    }

    /// Enumerates valid parameter triples, fast outer, slow middle, signal
    /// inner. Structurally invalid combinations are dropped, not errors.
    /// Consumers must treat the output as a set.
    pub fn valid_params(&self) -> impl Iterator<Item = MacdParams> + '_ {
        self.fast_periods.iter().flat_map(move |&fast| {
            self.slow_periods.iter().flat_map(move |&slow| {
                self.signal_periods
                    .iter()
                    .filter_map(move |&signal| MacdParams::new(fast, slow, signal).ok())
            })
        })
    }

    /// Largest warm-up any triple of this grid can need. Used to pad data
    /// collection and to align window planning across the whole grid.
    pub fn max_warmup_period(&self) -> usize {
        let max_slow = self.slow_periods.iter().copied().max().unwrap_or(0);
        let max_signal = self.signal_periods.iter().copied().max().unwrap_or(0);
        ((max_slow + max_signal) as usize).saturating_sub(1)
    }
}

/// Number of leading bars a MACD needs before its histogram is stable:
/// `slow` bars for the slow EMA plus `signal - 1` more for the signal EMA.
pub fn warmup_period(params: &MacdParams) -> usize {
    (params.slow() + params.signal()) as usize - 1
}
