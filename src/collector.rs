use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use log::{info, warn};
use reqwest::Client;
use serde::Deserialize;

use crate::config::DataConfig;
use crate::database::Database;
use crate::models::{MarketAction, MarketBar};

const YAHOO_CHART_BASE_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";

/// A provider of raw OHLCV bars and corporate actions for one asset range.
#[allow(async_fn_in_trait)]
pub trait BarSource {
    async fn download(
        &self,
        data_config: &DataConfig,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(Vec<MarketBar>, Vec<MarketAction>)>;
}

/// Ensures the store covers `[start_date - timeframe * max_warmup, end_date)`
/// for the series, downloading only the missing head and tail ranges, and
/// returns the timestamp-sorted bars for that padded range.
///
/// The warm-up padding means the first requested bar can already carry a
/// fully warmed indicator value.
pub async fn collect_data<S: BarSource>(
    db: &mut Database,
    source: &S,
    data_config: &DataConfig,
    max_warmup: usize,
) -> Result<Vec<MarketBar>> {
    let required_start = data_config.start_date - data_config.timeframe_delta * max_warmup as i32;
    let extent = db.fetch_bar_extent(data_config).await?;

    let mut bars = match extent {
        Some(_) => {
            db.fetch_bar_range(data_config, required_start, data_config.end_date)
                .await?
        }
        None => {
            warn!(
                "No data available for {} ({}), downloading full range",
                data_config.asset, data_config.timeframe
            );
            Vec::new()
        }
    };

    for (gap_start, gap_end) in missing_ranges(
        extent,
        required_start,
        data_config.end_date,
        data_config.timeframe_delta,
    ) {
        let downloaded = download_and_save(db, source, data_config, gap_start, gap_end).await?;
        bars.extend(downloaded);
    }

    bars.sort_by_key(|bar| bar.timestamp);
    Ok(bars)
}

/// Computes the head/tail date ranges not covered by the stored extent. With
/// no extent at all the whole range is missing.
fn missing_ranges(
    extent: Option<(DateTime<Utc>, DateTime<Utc>)>,
    required_start: DateTime<Utc>,
    end: DateTime<Utc>,
    timeframe_delta: Duration,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let Some((available_start, available_end)) = extent else {
        return vec![(required_start, end)];
    };

    let mut gaps = Vec::new();
    if available_start > required_start {
        gaps.push((required_start, available_start));
    }
    if available_end < end - timeframe_delta {
        gaps.push((available_end, end));
    }
    gaps
}

async fn download_and_save<S: BarSource>(
    db: &mut Database,
    source: &S,
    data_config: &DataConfig,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<MarketBar>> {
    info!(
        "Downloading data for {} ({}) from {} to {}",
        data_config.asset, data_config.timeframe, start, end
    );
    let (bars, actions) = source.download(data_config, start, end).await?;
    if bars.is_empty() {
        return Err(anyhow!(
            "no bars downloaded for {} ({}) from {} to {}",
            data_config.asset,
            data_config.timeframe,
            start,
            end
        ));
    }

    let inserted_bars = db.upsert_bars(&bars).await?;
    let inserted_actions = db.upsert_actions(&actions).await?;
    info!(
        "Stored {} new bars and {} new actions for {} ({})",
        inserted_bars, inserted_actions, data_config.asset, data_config.timeframe
    );
    Ok(bars)
}

/// Yahoo Finance chart API client. The chart endpoint serves OHLCV plus
/// dividend and split events in one response.
pub struct YahooChartClient {
    http: Client,
}

impl YahooChartClient {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

impl BarSource for YahooChartClient {
    async fn download(
        &self,
        data_config: &DataConfig,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(Vec<MarketBar>, Vec<MarketAction>)> {
        let url = format!("{}/{}", YAHOO_CHART_BASE_URL, data_config.asset);
        let period1 = start.timestamp().to_string();
        let period2 = end.timestamp().to_string();
        let response = self
            .http
            .get(&url)
            .query(&[
                ("period1", period1.as_str()),
                ("period2", period2.as_str()),
                ("interval", data_config.timeframe.as_str()),
                ("events", "div|split"),
            ])
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?
            .error_for_status()
            .with_context(|| format!("GET {} returned error", url))?;

        let payload: ChartResponse = response
            .json()
            .await
            .context("failed to parse Yahoo chart response")?;

        parse_chart_payload(payload, data_config)
    }
}

fn parse_chart_payload(
    payload: ChartResponse,
    data_config: &DataConfig,
) -> Result<(Vec<MarketBar>, Vec<MarketAction>)> {
    if let Some(error) = payload.chart.error {
        return Err(anyhow!(
            "Yahoo chart error for {}: {}",
            data_config.asset,
            error.description.unwrap_or(error.code)
        ));
    }
    let result = payload
        .chart
        .result
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("empty Yahoo chart result for {}", data_config.asset))?;

    let timestamps = result.timestamp.unwrap_or_default();
    let quote = result
        .indicators
        .quote
        .into_iter()
        .next()
        .unwrap_or_default();

    let mut bars = Vec::with_capacity(timestamps.len());
    for (i, &ts) in timestamps.iter().enumerate() {
        let timestamp = Utc
            .timestamp_opt(ts, 0)
            .single()
            .ok_or_else(|| anyhow!("bad timestamp {} in Yahoo chart response", ts))?;
        // Yahoo serves null slots for halted or missing bars; skip them.
        let (Some(open), Some(high), Some(low), Some(close)) = (
            value_at(&quote.open, i),
            value_at(&quote.high, i),
            value_at(&quote.low, i),
            value_at(&quote.close, i),
        ) else {
            continue;
        };
        bars.push(MarketBar {
            asset: data_config.asset.clone(),
            source: data_config.source.clone(),
            timeframe: data_config.timeframe.clone(),
            timestamp,
            open,
            high,
            low,
            close,
            volume: value_at(&quote.volume, i).unwrap_or(0.0),
        });
    }

    let mut actions = Vec::new();
    if let Some(events) = result.events {
        for dividend in events.dividends.unwrap_or_default().into_values() {
            actions.push(action_at(data_config, dividend.date, |action| {
                action.dividends = Some(dividend.amount);
            })?);
        }
        for split in events.splits.unwrap_or_default().into_values() {
            if split.denominator == 0.0 {
                continue;
            }
            actions.push(action_at(data_config, split.date, |action| {
                action.stock_splits = Some(split.numerator / split.denominator);
            })?);
        }
    }
    actions.sort_by_key(|action| action.timestamp);

    Ok((bars, actions))
}

fn value_at(series: &[Option<f64>], index: usize) -> Option<f64> {
    series.get(index).copied().flatten()
}

fn action_at(
    data_config: &DataConfig,
    epoch: i64,
    fill: impl FnOnce(&mut MarketAction),
) -> Result<MarketAction> {
    let timestamp = Utc
        .timestamp_opt(epoch, 0)
        .single()
        .ok_or_else(|| anyhow!("bad event timestamp {} in Yahoo chart response", epoch))?;
    let mut action = MarketAction {
        asset: data_config.asset.clone(),
        source: data_config.source.clone(),
        timeframe: data_config.timeframe.clone(),
        timestamp,
        dividends: None,
        stock_splits: None,
        capital_gains: None,
    };
    fill(&mut action);
    Ok(action)
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    #[serde(default)]
    result: Vec<ChartResult>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
    events: Option<ChartEvents>,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<Quote>,
}

#[derive(Debug, Default, Deserialize)]
struct Quote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct ChartEvents {
    dividends: Option<std::collections::HashMap<String, DividendEvent>>,
    splits: Option<std::collections::HashMap<String, SplitEvent>>,
}

#[derive(Debug, Deserialize)]
struct DividendEvent {
    amount: f64,
    date: i64,
}

#[derive(Debug, Deserialize)]
struct SplitEvent {
    numerator: f64,
    denominator: f64,
    date: i64,
}
