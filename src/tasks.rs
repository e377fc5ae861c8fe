use std::collections::{HashMap, HashSet};

use anyhow::Result;
use log::info;

use crate::config::{DataConfig, ExecutionContext};
use crate::grid::{warmup_period, MacdParamsGrid};
use crate::models::{MarketBar, RunKey, SimulationRun};
use crate::windows::{plan_windows, SimWindow, WindowConfig};

/// Composes the parameter grid with every sliding window of every window
/// config into the full set of runs the series requires, keyed by run
/// identity. Only identifiers and index bounds are held per run; bars are
/// never copied here.
///
/// The stored `start_date` points at the first bar after warm-up (the first
/// bar that can produce a signal) and `end_date` is exclusive, one timeframe
/// past the last simulated bar, so identical runs scheduled from different
/// series fetches resolve to the same key.
pub fn build_required_runs(
    data_config: &DataConfig,
    execution: &ExecutionContext,
    grid: &MacdParamsGrid,
    window_configs: &[WindowConfig],
    bars: &[MarketBar],
) -> Result<HashMap<RunKey, SimWindow>> {
    let max_warmup = grid.max_warmup_period();
    let mut required: HashMap<RunKey, SimWindow> = HashMap::new();

    for params in grid.valid_params() {
        let warmup = warmup_period(&params);
        for window_config in window_configs {
            let windows = plan_windows(bars.len(), *window_config, warmup, max_warmup)?;
            for window in windows {
                let start_date = bars[window.start_idx + warmup].timestamp;
                let end_date = bars[window.end_idx - 1].timestamp + data_config.timeframe_delta;
                let key = RunKey {
                    asset: data_config.asset.clone(),
                    timeframe: data_config.timeframe.clone(),
                    start_date,
                    end_date,
                    initial_cash: execution.initial_cash,
                    fee: execution.fee,
                    slippage: execution.slippage,
                    position_sizing: execution.position_sizing,
                    direction: execution.direction,
                    random_seed: execution.random_seed,
                    fast_period: params.fast(),
                    slow_period: params.slow(),
                    signal_period: params.signal(),
                };
                required.entry(key).or_insert(window);
            }
        }
    }

    Ok(required)
}

/// Diffs the required set against the persisted identity set and materializes
/// runs for the keys that still need to execute.
pub fn missing_runs(
    required: HashMap<RunKey, SimWindow>,
    existing: &HashSet<RunKey>,
) -> Vec<SimulationRun> {
    let total = required.len();
    let missing: Vec<SimulationRun> = required
        .into_iter()
        .filter(|(key, _)| !existing.contains(key))
        .map(|(key, window)| SimulationRun {
            key,
            start_idx: window.start_idx,
            end_idx: window.end_idx,
            metrics: None,
        })
        .collect();
    info!(
        "{} existing runs, {} missing out of {} required",
        existing.len(),
        missing.len(),
        total
    );
    missing
}
