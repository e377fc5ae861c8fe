use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, TimeZone, Utc};
use tokio::sync::mpsc;

use macd_grid::config::{DataConfig, ExecutionContext};
use macd_grid::grid::{MacdParamsGrid, PeriodRange};
use macd_grid::metrics::TRACKED_METRICS;
use macd_grid::models::{MarketBar, PositionSizing, RunKey, SimulationRun, TradeDirection};
use macd_grid::runner::{
    persist_results, run_missing_simulations, ConsumerMessage, ResultSink,
};
use macd_grid::tasks::{build_required_runs, missing_runs};
use macd_grid::windows::WindowConfig;

struct MemorySink {
    persisted: Vec<SimulationRun>,
}

impl ResultSink for &mut MemorySink {
    async fn persist(&mut self, runs: &[SimulationRun]) -> Result<usize> {
        self.persisted.extend_from_slice(runs);
        Ok(runs.len())
    }
}

fn synthetic_series(count: usize) -> Vec<MarketBar> {
    let base = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap();
    (0..count)
        .map(|i| {
            let close = 50.0 + 8.0 * ((i as f64) * 0.21).sin() + i as f64 * 0.01;
            MarketBar {
                asset: "TEST".to_string(),
                source: "yahoo".to_string(),
                timeframe: "1d".to_string(),
                timestamp: base + Duration::days(i as i64),
                open: close,
                high: close + 0.5,
                low: close - 0.5,
                close,
                volume: 10_000.0,
            }
        })
        .collect()
}

fn data_config(bars: &[MarketBar]) -> DataConfig {
    DataConfig {
        source: "yahoo".to_string(),
        asset: "TEST".to_string(),
        timeframe: "1d".to_string(),
        timeframe_delta: Duration::days(1),
        start_date: bars[0].timestamp,
        end_date: bars[bars.len() - 1].timestamp + Duration::days(1),
    }
}

fn execution() -> ExecutionContext {
    ExecutionContext {
        initial_cash: 10_000.0,
        fee: 0.001,
        slippage: 0.0005,
        position_sizing: PositionSizing::Fixed,
        direction: TradeDirection::LongOnly,
        random_seed: 0,
    }
}

fn small_grid() -> MacdParamsGrid {
    MacdParamsGrid::from_ranges(
        PeriodRange::new(5, 9, 2).unwrap(),
        PeriodRange::new(12, 17, 4).unwrap(),
        PeriodRange::new(4, 7, 2).unwrap(),
    )
    .unwrap()
}

/// Schedules the full grid against an empty store and checks every run is
/// executed exactly once and lands with a complete metric payload.
#[tokio::test]
async fn full_pipeline_executes_and_persists_every_missing_run() {
    let bars = synthetic_series(160);
    let config = data_config(&bars);
    let grid = small_grid();
    let windows = [WindowConfig {
        window_size: 60,
        window_shift: 25,
    }];

    let required = build_required_runs(&config, &execution(), &grid, &windows, &bars).unwrap();
    let expected_keys: HashSet<RunKey> = required.keys().cloned().collect();
    assert!(!expected_keys.is_empty());

    let missing = missing_runs(required, &HashSet::new());
    assert_eq!(missing.len(), expected_keys.len());

    let shared_bars = Arc::new(bars);
    let (queue_tx, queue_rx) = mpsc::channel(4);
    let scheduler_bars = Arc::clone(&shared_bars);
    let total = missing.len();
    let scheduler = tokio::task::spawn_blocking(move || {
        run_missing_simulations(missing, scheduler_bars, Duration::days(1), 3, 2, &queue_tx)
    });

    let mut sink = MemorySink {
        persisted: Vec::new(),
    };
    let consumer = persist_results(queue_rx, &mut sink, 5);

    let (schedule, flush) = tokio::join!(scheduler, consumer);
    let schedule = schedule.unwrap().unwrap();

    assert_eq!(schedule.completed, total);
    assert_eq!(schedule.failed, 0);
    assert_eq!(flush.received, total);
    assert_eq!(flush.flushed, total);
    assert_eq!(flush.failed, 0);

    let persisted_keys: HashSet<RunKey> =
        sink.persisted.iter().map(|run| run.key.clone()).collect();
    assert_eq!(persisted_keys, expected_keys);

    for run in &sink.persisted {
        let metrics = run.metrics.as_ref().expect("persisted run without metrics");
        assert_eq!(metrics.len(), TRACKED_METRICS.len());
        // Every alias always carries both a value slot and a kind tag.
        for (_, alias) in TRACKED_METRICS {
            assert!(metrics.get(alias).is_some(), "missing alias {}", alias);
        }
    }
}

/// After everything is persisted a rerun of the diff schedules nothing.
#[tokio::test]
async fn rerun_against_the_persisted_set_schedules_nothing() {
    let bars = synthetic_series(160);
    let config = data_config(&bars);
    let grid = small_grid();
    let windows = [WindowConfig {
        window_size: 60,
        window_shift: 25,
    }];

    let required = build_required_runs(&config, &execution(), &grid, &windows, &bars).unwrap();
    let persisted: HashSet<RunKey> = required.keys().cloned().collect();

    let rerun = build_required_runs(&config, &execution(), &grid, &windows, &bars).unwrap();
    assert!(missing_runs(rerun, &persisted).is_empty());
}

/// Execution-context changes alter the run identity, so a store populated
/// under one context never satisfies a diff under another.
#[tokio::test]
async fn changed_execution_context_requires_fresh_runs() {
    let bars = synthetic_series(160);
    let config = data_config(&bars);
    let grid = small_grid();
    let windows = [WindowConfig {
        window_size: 60,
        window_shift: 25,
    }];

    let required = build_required_runs(&config, &execution(), &grid, &windows, &bars).unwrap();
    let persisted: HashSet<RunKey> = required.keys().cloned().collect();

    let mut bumped_fee = execution();
    bumped_fee.fee = 0.002;
    let rerun = build_required_runs(&config, &bumped_fee, &grid, &windows, &bars).unwrap();
    let total = rerun.len();
    assert_eq!(missing_runs(rerun, &persisted).len(), total);
}
