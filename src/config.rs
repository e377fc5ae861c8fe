use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::warn;
use std::collections::HashMap;

use crate::grid::{MacdParamsGrid, PeriodRange};
use crate::models::{parse_timeframe, PositionSizing, TradeDirection};
use crate::windows::WindowConfig;

/// Execution-context settings shared by every simulation of a run. Together
/// with the parameter triple and the window dates these form the run identity.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext {
    pub initial_cash: f64,
    pub fee: f64,
    pub slippage: f64,
    pub position_sizing: PositionSizing,
    pub direction: TradeDirection,
    pub random_seed: i64,
}

/// One asset/timeframe series to analyze, with its requested date range.
#[derive(Debug, Clone)]
pub struct DataConfig {
    pub source: String,
    pub asset: String,
    pub timeframe: String,
    pub timeframe_delta: Duration,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

impl std::fmt::Display for DataConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} ({}) {} -> {}",
            self.source,
            self.asset,
            self.timeframe,
            self.start_date.format("%Y-%m-%d"),
            self.end_date.format("%Y-%m-%d")
        )
    }
}

/// Batching and parallelism knobs for the runner.
#[derive(Debug, Clone, Copy)]
pub struct RunControl {
    pub simulation_batch_size: usize,
    pub db_bulk_insert_size: usize,
    pub consumer_queue_size: usize,
    pub threads_to_use: usize,
}

#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    pub grid: MacdParamsGrid,
    pub window_configs: Vec<WindowConfig>,
    pub execution: ExecutionContext,
    pub run_control: RunControl,
    pub data_configs: Vec<DataConfig>,
}

impl AnalysisSettings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let grid = MacdParamsGrid::from_ranges(
            require_setting_period_range(settings, "FAST_PERIODS")?,
            require_setting_period_range(settings, "SLOW_PERIODS")?,
            require_setting_period_range(settings, "SIGNAL_PERIODS")?,
        )?;

        let window_configs = require_setting_window_configs(settings, "WINDOW_CONFIGS")?;

        let position_sizing = require_setting(settings, "POSITION_SIZING")?
            .parse::<PositionSizing>()
            .map_err(|e| anyhow!("Setting POSITION_SIZING: {}", e))?;
        let direction = require_setting(settings, "TRADE_DIRECTION")?
            .parse::<TradeDirection>()
            .map_err(|e| anyhow!("Setting TRADE_DIRECTION: {}", e))?;

        let execution = ExecutionContext {
            initial_cash: require_setting_f64(settings, "INITIAL_CASH", Some(0.0), None)?,
            fee: require_setting_f64(settings, "FEE_RATE", Some(0.0), Some(1.0))?,
            slippage: require_setting_f64(settings, "SLIPPAGE_RATE", Some(0.0), Some(1.0))?,
            position_sizing,
            direction,
            random_seed: require_setting_i64(settings, "RANDOM_SEED")?,
        };

        let run_control = RunControl {
            simulation_batch_size: require_setting_usize(settings, "SIMULATION_BATCH_SIZE", 1)?,
            db_bulk_insert_size: require_setting_usize(settings, "DB_BULK_INSERT_SIZE", 1)?,
            consumer_queue_size: require_setting_usize(settings, "CONSUMER_QUEUE_SIZE", 1)?,
            threads_to_use: resolve_threads_to_use(settings, num_cpus::get())?,
        };

        let data_configs = require_setting_data_configs(settings, "DATA_CONFIGS")?;

        Ok(Self {
            grid,
            window_configs,
            execution,
            run_control,
            data_configs,
        })
    }
}

/// Advances each data config's start date so the simulation period begins on
/// the last whole-window boundary for every window config. A shifted start is
/// logged as a warning; the end date is never moved.
pub fn align_start_dates(data_configs: &mut [DataConfig], window_configs: &[WindowConfig]) {
    for data_config in data_configs.iter_mut() {
        let base_start = data_config.start_date;
        let base_end = data_config.end_date;
        let delta_secs = data_config.timeframe_delta.num_seconds().max(1);
        let mut max_aligned_start = base_start;

        for window_config in window_configs {
            let total_samples = (base_end - base_start).num_seconds() / delta_secs;

            let aligned_start = if (total_samples as usize) < window_config.window_size {
                base_end
            } else {
                let last_window_start = base_end
                    - data_config.timeframe_delta * window_config.window_size as i32;
                let shift = data_config.timeframe_delta * window_config.window_shift as i32;
                let max_back_shifts =
                    (last_window_start - base_start).num_seconds() / shift.num_seconds().max(1);
                last_window_start - shift * max_back_shifts as i32
            };

            if aligned_start > max_aligned_start {
                max_aligned_start = aligned_start;
            }
        }

        if max_aligned_start != base_start {
            warn!(
                "Adjusting start date for {} ({}) from {} to {} to align with window configuration(s)",
                data_config.asset, data_config.timeframe, base_start, max_aligned_start
            );
            data_config.start_date = max_aligned_start;
        }
    }
}

/// Collects the process environment into the settings map the loaders consume.
pub fn settings_from_env() -> HashMap<String, String> {
    std::env::vars().collect()
}

fn resolve_threads_to_use(settings: &HashMap<String, String>, cpu_count: usize) -> Result<usize> {
    let default = cpu_count.saturating_sub(2).max(1);
    let raw = match settings.get("THREADS_TO_USE").map(|v| v.trim()) {
        Some(value) if !value.is_empty() => value,
        _ => return Ok(default),
    };
    let requested = raw
        .parse::<usize>()
        .map_err(|_| anyhow!("Setting THREADS_TO_USE must be an integer (value: {})", raw))?;
    if requested == 0 || requested > cpu_count {
        return Ok(default);
    }
    Ok(requested)
}

fn require_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("Missing required setting {}", key))
}

fn require_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    let raw = require_setting(settings, key)?;
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(value)
}

fn require_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    min: usize,
) -> Result<usize> {
    let raw = require_setting(settings, key)?;
    let value = raw
        .parse::<usize>()
        .map_err(|_| anyhow!("Setting {} must be an integer (value: {})", key, raw))?;
    if value < min {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value)
}

fn require_setting_i64(settings: &HashMap<String, String>, key: &str) -> Result<i64> {
    let raw = require_setting(settings, key)?;
    raw.parse::<i64>()
        .map_err(|_| anyhow!("Setting {} must be an integer (value: {})", key, raw))
}

/// Parses a `start:stop:step` half-open range, e.g. `8:15:2` -> 8, 10, 12, 14.
fn require_setting_period_range(
    settings: &HashMap<String, String>,
    key: &str,
) -> Result<PeriodRange> {
    let raw = require_setting(settings, key)?;
    let parts: Vec<&str> = raw.split(':').map(|p| p.trim()).collect();
    if parts.len() != 3 {
        return Err(anyhow!(
            "Setting {} must be start:stop:step (value: {})",
            key,
            raw
        ));
    }
    let mut values = [0u32; 3];
    for (slot, part) in values.iter_mut().zip(&parts) {
        *slot = part
            .parse::<u32>()
            .map_err(|_| anyhow!("Setting {} must contain integers (value: {})", key, raw))?;
    }
    PeriodRange::new(values[0], values[1], values[2])
        .map_err(|e| anyhow!("Setting {}: {}", key, e))
}

/// Parses comma-separated `window_size:window_shift` pairs, e.g. `200:20,100:10`.
fn require_setting_window_configs(
    settings: &HashMap<String, String>,
    key: &str,
) -> Result<Vec<WindowConfig>> {
    let raw = require_setting(settings, key)?;
    let mut configs = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (size_raw, shift_raw) = entry.split_once(':').ok_or_else(|| {
            anyhow!(
                "Setting {} entries must be window_size:window_shift (value: {})",
                key,
                entry
            )
        })?;
        let window_size = size_raw
            .trim()
            .parse::<usize>()
            .map_err(|_| anyhow!("Setting {} has a bad window size (value: {})", key, entry))?;
        let window_shift = shift_raw
            .trim()
            .parse::<usize>()
            .map_err(|_| anyhow!("Setting {} has a bad window shift (value: {})", key, entry))?;
        if window_size == 0 || window_shift == 0 {
            return Err(anyhow!(
                "Setting {} requires positive window size and shift (value: {})",
                key,
                entry
            ));
        }
        configs.push(WindowConfig {
            window_size,
            window_shift,
        });
    }
    if configs.is_empty() {
        return Err(anyhow!("Setting {} must list at least one window", key));
    }
    Ok(configs)
}

/// Parses comma-separated `source:asset:timeframe:start:end` entries with
/// ISO dates, e.g. `yahoo:AAPL:1d:2015-01-01:2024-01-01`.
fn require_setting_data_configs(
    settings: &HashMap<String, String>,
    key: &str,
) -> Result<Vec<DataConfig>> {
    let raw = require_setting(settings, key)?;
    let mut configs = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let parts: Vec<&str> = entry.split(':').map(|p| p.trim()).collect();
        if parts.len() != 5 {
            return Err(anyhow!(
                "Setting {} entries must be source:asset:timeframe:start:end (value: {})",
                key,
                entry
            ));
        }
        let timeframe = parts[2].to_string();
        let timeframe_delta = parse_timeframe(&timeframe)
            .map_err(|e| anyhow!("Setting {}: {} (value: {})", key, e, entry))?;
        let start_date = parse_config_date(key, parts[3])?;
        let end_date = parse_config_date(key, parts[4])?;
        if end_date <= start_date {
            return Err(anyhow!(
                "Setting {} requires end after start (value: {})",
                key,
                entry
            ));
        }
        configs.push(DataConfig {
            source: parts[0].to_string(),
            asset: parts[1].to_string(),
            timeframe,
            timeframe_delta,
            start_date,
            end_date,
        });
    }
    if configs.is_empty() {
        return Err(anyhow!("Setting {} must list at least one series", key));
    }
    Ok(configs)
}

fn parse_config_date(key: &str, raw: &str) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
        anyhow!(
            "Setting {} must use YYYY-MM-DD dates (value: {})",
            key,
            raw
        )
    })?;
    Ok(DateTime::from_naive_utc_and_offset(
        date.and_hms_opt(0, 0, 0).unwrap(),
        Utc,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base_settings() -> HashMap<String, String> {
        let entries = [
            ("FAST_PERIODS", "8:15:2"),
            ("SLOW_PERIODS", "20:31:5"),
            ("SIGNAL_PERIODS", "5:12:3"),
            ("WINDOW_CONFIGS", "200:20,100:10"),
            ("INITIAL_CASH", "10000"),
            ("FEE_RATE", "0.001"),
            ("SLIPPAGE_RATE", "0.0005"),
            ("POSITION_SIZING", "fixed"),
            ("TRADE_DIRECTION", "long_only"),
            ("RANDOM_SEED", "0"),
            ("SIMULATION_BATCH_SIZE", "50"),
            ("DB_BULK_INSERT_SIZE", "500"),
            ("CONSUMER_QUEUE_SIZE", "1000"),
            ("DATA_CONFIGS", "yahoo:AAPL:1d:2015-01-01:2024-01-01"),
        ];
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn loads_a_complete_settings_map() {
        let settings = AnalysisSettings::from_settings_map(&base_settings()).unwrap();
        assert_eq!(settings.grid.fast_periods, vec![8, 10, 12, 14]);
        assert_eq!(settings.grid.slow_periods, vec![20, 25, 30]);
        assert_eq!(settings.grid.signal_periods, vec![5, 8, 11]);
        assert_eq!(settings.window_configs.len(), 2);
        assert_eq!(settings.window_configs[0].window_size, 200);
        assert_eq!(settings.window_configs[1].window_shift, 10);
        assert_eq!(settings.execution.position_sizing, PositionSizing::Fixed);
        assert_eq!(settings.execution.direction, TradeDirection::LongOnly);
        assert_eq!(settings.run_control.simulation_batch_size, 50);
        assert_eq!(settings.data_configs.len(), 1);
        assert_eq!(settings.data_configs[0].asset, "AAPL");
        assert_eq!(settings.data_configs[0].timeframe_delta, Duration::days(1));
    }

    #[test]
    fn missing_setting_is_an_error() {
        let mut settings = base_settings();
        settings.remove("WINDOW_CONFIGS");
        let err = AnalysisSettings::from_settings_map(&settings).unwrap_err();
        assert!(err.to_string().contains("WINDOW_CONFIGS"));
    }

    #[test]
    fn malformed_data_config_is_an_error() {
        let mut settings = base_settings();
        settings.insert("DATA_CONFIGS".to_string(), "yahoo:AAPL:1d".to_string());
        assert!(AnalysisSettings::from_settings_map(&settings).is_err());
    }

    #[test]
    fn thread_count_defaults_and_clamps_to_available_parallelism() {
        let mut settings = HashMap::new();
        assert_eq!(resolve_threads_to_use(&settings, 8).unwrap(), 6);
        assert_eq!(resolve_threads_to_use(&settings, 2).unwrap(), 1);

        settings.insert("THREADS_TO_USE".to_string(), "4".to_string());
        assert_eq!(resolve_threads_to_use(&settings, 8).unwrap(), 4);

        // A request above the machine falls back to the default.
        settings.insert("THREADS_TO_USE".to_string(), "64".to_string());
        assert_eq!(resolve_threads_to_use(&settings, 8).unwrap(), 6);
    }

    #[test]
    fn start_dates_advance_to_the_last_whole_window_boundary() {
        // 30 daily bars requested, window of 10 shifted by 7: the last window
        // starts at day 20 and only two back-shifts fit, so the aligned start
        // is day 6.
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut configs = vec![DataConfig {
            source: "yahoo".to_string(),
            asset: "AAPL".to_string(),
            timeframe: "1d".to_string(),
            timeframe_delta: Duration::days(1),
            start_date: start,
            end_date: start + Duration::days(30),
        }];
        let windows = vec![WindowConfig {
            window_size: 10,
            window_shift: 7,
        }];

        align_start_dates(&mut configs, &windows);
        assert_eq!(configs[0].start_date, start + Duration::days(6));
        assert_eq!(configs[0].end_date, start + Duration::days(30));
    }

    #[test]
    fn aligned_start_is_untouched() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut configs = vec![DataConfig {
            source: "yahoo".to_string(),
            asset: "AAPL".to_string(),
            timeframe: "1d".to_string(),
            timeframe_delta: Duration::days(1),
            start_date: start,
            end_date: start + Duration::days(24),
        }];
        let windows = vec![WindowConfig {
            window_size: 10,
            window_shift: 7,
        }];

        // last window start = day 14, two shifts of 7 reach exactly day 0.
        align_start_dates(&mut configs, &windows);
        assert_eq!(configs[0].start_date, start);
    }

    #[test]
    fn series_shorter_than_the_window_collapses_to_the_end() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut configs = vec![DataConfig {
            source: "yahoo".to_string(),
            asset: "AAPL".to_string(),
            timeframe: "1d".to_string(),
            timeframe_delta: Duration::days(1),
            start_date: start,
            end_date: start + Duration::days(5),
        }];
        let windows = vec![WindowConfig {
            window_size: 10,
            window_shift: 7,
        }];

        align_start_dates(&mut configs, &windows);
        assert_eq!(configs[0].start_date, configs[0].end_date);
    }
}
