use std::path::Path;

use anyhow::{Context, Result};
use chrono::Duration;
use log::info;

use crate::context::AppContext;
use crate::metrics::{decode_metrics, EncodedMetrics, TRACKED_METRICS};
use crate::models::{parse_timeframe, RunKey};

/// Exports persisted runs for one series as a CSV: run parameters and window
/// dates plus one column per decoded metric alias. Unrecoverable metric slots
/// (missing or invalid) export as empty cells. Optionally restricted to runs
/// simulated with one window length, in bars.
pub async fn run(
    app: &AppContext,
    asset: &str,
    timeframe: &str,
    window_size: Option<usize>,
    output: &Path,
) -> Result<()> {
    let db = app.database().await?;
    let runs = db.fetch_completed_runs(asset, timeframe).await?;
    let timeframe_delta = parse_timeframe(timeframe)?;

    let rows = export_rows(&runs, timeframe_delta, window_size);
    let row_count = rows.len();

    let mut writer = csv::Writer::from_path(output)
        .with_context(|| format!("failed to open {} for writing", output.display()))?;
    let mut header = vec![
        "fast_period".to_string(),
        "slow_period".to_string(),
        "signal_period".to_string(),
        "start_date".to_string(),
        "end_date".to_string(),
    ];
    header.extend(TRACKED_METRICS.iter().map(|(_, alias)| alias.to_string()));
    writer.write_record(&header)?;
    for row in rows {
        writer.write_record(&row)?;
    }
    writer.flush()?;

    info!(
        "Exported {} of {} runs for {} ({}) to {}",
        row_count,
        runs.len(),
        asset,
        timeframe,
        output.display()
    );
    Ok(())
}

/// The number of bars the run's window spanned. The stored dates cover the
/// post-warm-up region of a `window_size + warmup` slice, which is exactly
/// `window_size` bars.
fn window_bars(key: &RunKey, timeframe_delta: Duration) -> usize {
    let span = (key.end_date - key.start_date).num_seconds()
        / timeframe_delta.num_seconds().max(1);
    span as usize
}

fn export_rows(
    runs: &[(RunKey, EncodedMetrics)],
    timeframe_delta: Duration,
    window_size: Option<usize>,
) -> Vec<Vec<String>> {
    runs.iter()
        .filter(|(key, _)| match window_size {
            Some(size) => window_bars(key, timeframe_delta) == size,
            None => true,
        })
        .map(|(key, metrics)| {
            let decoded = decode_metrics(metrics, false);
            let mut row = vec![
                key.fast_period.to_string(),
                key.slow_period.to_string(),
                key.signal_period.to_string(),
                key.start_date.to_rfc3339(),
                key.end_date.to_rfc3339(),
            ];
            for (_, alias) in TRACKED_METRICS {
                let cell = match decoded.get(alias) {
                    Some(Some(value)) => value.as_f64().to_string(),
                    _ => String::new(),
                };
                row.push(cell);
            }
            row
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{encode_metrics, RawStats, StatValue};
    use crate::models::{PositionSizing, TradeDirection};
    use chrono::{TimeZone, Utc};

    fn key_with_window(window_size: usize) -> RunKey {
        // The stored dates span window_size bars, the warm-up prefix is not
        // part of the persisted period.
        let start = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        RunKey {
            asset: "AAPL".to_string(),
            timeframe: "1d".to_string(),
            start_date: start,
            end_date: start + Duration::days(window_size as i64),
            initial_cash: 10_000.0,
            fee: 0.001,
            slippage: 0.0,
            position_sizing: PositionSizing::Fixed,
            direction: TradeDirection::LongOnly,
            random_seed: 0,
            fast_period: 12,
            slow_period: 26,
            signal_period: 9,
        }
    }

    fn sample_metrics() -> EncodedMetrics {
        let mut stats = RawStats::new();
        stats.insert("Sharpe Ratio".to_string(), StatValue::Float(1.25));
        stats.insert("Win Rate [%]".to_string(), StatValue::Float(f64::NAN));
        stats.insert("Total Trades".to_string(), StatValue::Int(7));
        encode_metrics(&stats)
    }

    #[test]
    fn rows_carry_parameters_and_fixed_metric_columns() {
        let runs = vec![(key_with_window(100), sample_metrics())];
        let rows = export_rows(&runs, Duration::days(1), None);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].len(), 5 + TRACKED_METRICS.len());
        assert_eq!(rows[0][0], "12");
        assert_eq!(rows[0][1], "26");
        assert_eq!(rows[0][2], "9");

        let sharpe_col = 5 + TRACKED_METRICS
            .iter()
            .position(|(_, alias)| *alias == "sharpe")
            .unwrap();
        assert_eq!(rows[0][sharpe_col], "1.25");

        // Absent metrics export as empty cells, NaN stays NaN.
        let omega_col = 5 + TRACKED_METRICS
            .iter()
            .position(|(_, alias)| *alias == "omega")
            .unwrap();
        assert_eq!(rows[0][omega_col], "");
        let win_rate_col = 5 + TRACKED_METRICS
            .iter()
            .position(|(_, alias)| *alias == "win_rate_pct")
            .unwrap();
        assert_eq!(rows[0][win_rate_col], "NaN");
    }

    #[test]
    fn window_filter_matches_scheduled_run_dates() {
        use crate::config::{DataConfig, ExecutionContext};
        use crate::grid::{MacdParamsGrid, PeriodRange};
        use crate::models::MarketBar;
        use crate::tasks::build_required_runs;
        use crate::windows::WindowConfig;

        let base = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let bars: Vec<MarketBar> = (0..100)
            .map(|i| MarketBar {
                asset: "AAPL".to_string(),
                source: "yahoo".to_string(),
                timeframe: "1d".to_string(),
                timestamp: base + Duration::days(i as i64),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0 + i as f64,
                volume: 1_000.0,
            })
            .collect();
        let data_config = DataConfig {
            source: "yahoo".to_string(),
            asset: "AAPL".to_string(),
            timeframe: "1d".to_string(),
            timeframe_delta: Duration::days(1),
            start_date: base,
            end_date: base + Duration::days(100),
        };
        let execution = ExecutionContext {
            initial_cash: 10_000.0,
            fee: 0.001,
            slippage: 0.0,
            position_sizing: PositionSizing::Fixed,
            direction: TradeDirection::LongOnly,
            random_seed: 0,
        };
        let grid = MacdParamsGrid::from_ranges(
            PeriodRange::new(12, 13, 1).unwrap(),
            PeriodRange::new(26, 27, 1).unwrap(),
            PeriodRange::new(9, 10, 1).unwrap(),
        )
        .unwrap();
        let windows = [WindowConfig {
            window_size: 50,
            window_shift: 10,
        }];

        let required =
            build_required_runs(&data_config, &execution, &grid, &windows, &bars).unwrap();
        assert_eq!(required.len(), 2);
        let runs: Vec<(RunKey, EncodedMetrics)> = required
            .into_keys()
            .map(|key| (key, sample_metrics()))
            .collect();

        let rows = export_rows(&runs, Duration::days(1), Some(50));
        assert_eq!(rows.len(), 2);
        assert!(export_rows(&runs, Duration::days(1), Some(84)).is_empty());
    }

    #[test]
    fn window_filter_recovers_bar_counts_from_dates() {
        let runs = vec![
            (key_with_window(100), sample_metrics()),
            (key_with_window(50), sample_metrics()),
        ];
        let rows = export_rows(&runs, Duration::days(1), Some(100));
        assert_eq!(rows.len(), 1);
        let rows = export_rows(&runs, Duration::days(1), Some(50));
        assert_eq!(rows.len(), 1);
        let rows = export_rows(&runs, Duration::days(1), Some(60));
        assert!(rows.is_empty());
    }
}
