use std::collections::HashSet;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::error;
use tokio_postgres::{Client, NoTls, Row};

use crate::config::DataConfig;
use crate::metrics::EncodedMetrics;
use crate::models::{MarketAction, MarketBar, PositionSizing, RunKey, SimulationRun, TradeDirection};

const BAR_INSERT_CHUNK_SIZE: usize = 1_000;
const ACTION_INSERT_CHUNK_SIZE: usize = 2_000;
const RUN_INSERT_CHUNK_SIZE: usize = 1_000;

const RUN_KEY_COLUMNS: &str = "asset, timeframe, start_date, end_date, initial_cash, fee, \
     slippage, position_sizing, direction, random_seed, fast_period, slow_period, signal_period";

pub struct Database {
    client: Client,
}

impl Database {
    pub async fn new<S: AsRef<str>>(database_url: S) -> Result<Self> {
        let database_url = database_url.as_ref().to_string();
        let (client, connection) = tokio_postgres::connect(&database_url, NoTls)
            .await
            .with_context(|| format!("failed to connect to PostgreSQL at {}", database_url))?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!("PostgreSQL connection error: {}", err);
            }
        });

        Ok(Self { client })
    }

    /// Creates the tables and indexes if they do not exist yet. Safe to call
    /// on every startup.
    pub async fn init_schema(&self) -> Result<()> {
        self.client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS market_data (
                     asset TEXT NOT NULL,
                     source TEXT NOT NULL,
                     timeframe TEXT NOT NULL,
                     timestamp TIMESTAMPTZ NOT NULL,
                     open DOUBLE PRECISION NOT NULL,
                     high DOUBLE PRECISION NOT NULL,
                     low DOUBLE PRECISION NOT NULL,
                     close DOUBLE PRECISION NOT NULL,
                     volume DOUBLE PRECISION NOT NULL,
                     PRIMARY KEY (asset, source, timeframe, timestamp)
                 );
                 CREATE INDEX IF NOT EXISTS ix_market_data_asset_source_tf_ts
                     ON market_data (asset, source, timeframe, timestamp);
                 CREATE TABLE IF NOT EXISTS market_actions (
                     id BIGSERIAL PRIMARY KEY,
                     asset TEXT NOT NULL,
                     source TEXT NOT NULL,
                     timeframe TEXT NOT NULL,
                     timestamp TIMESTAMPTZ NOT NULL,
                     dividends DOUBLE PRECISION,
                     stock_splits DOUBLE PRECISION,
                     capital_gains DOUBLE PRECISION,
                     UNIQUE (asset, source, timeframe, timestamp)
                 );
                 CREATE TABLE IF NOT EXISTS macd_histogram_sign_flip_strategy (
                     asset TEXT NOT NULL,
                     timeframe TEXT NOT NULL,
                     start_date TIMESTAMPTZ NOT NULL,
                     end_date TIMESTAMPTZ NOT NULL,
                     initial_cash DOUBLE PRECISION NOT NULL,
                     fee DOUBLE PRECISION NOT NULL,
                     slippage DOUBLE PRECISION NOT NULL,
                     position_sizing TEXT NOT NULL,
                     direction TEXT NOT NULL,
                     random_seed BIGINT NOT NULL,
                     fast_period INTEGER NOT NULL,
                     slow_period INTEGER NOT NULL,
                     signal_period INTEGER NOT NULL,
                     run_timestamp TIMESTAMPTZ NOT NULL DEFAULT now(),
                     metrics JSONB NOT NULL,
                     PRIMARY KEY (asset, timeframe, start_date, end_date, initial_cash,
                                  fee, slippage, position_sizing, direction, random_seed,
                                  fast_period, slow_period, signal_period)
                 );",
            )
            .await
            .context("failed to initialize database schema")?;
        Ok(())
    }

    /// Returns the (min, max) stored bar timestamps for the series, or None
    /// when no bars exist yet.
    pub async fn fetch_bar_extent(
        &self,
        data_config: &DataConfig,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let row = self
            .client
            .query_one(
                "SELECT min(timestamp), max(timestamp) FROM market_data
                 WHERE asset = $1 AND source = $2 AND timeframe = $3",
                &[
                    &data_config.asset,
                    &data_config.source,
                    &data_config.timeframe,
                ],
            )
            .await?;
        let min: Option<DateTime<Utc>> = row.get(0);
        let max: Option<DateTime<Utc>> = row.get(1);
        Ok(min.zip(max))
    }

    /// Loads the stored bars for `[start, end)`, sorted by timestamp.
    pub async fn fetch_bar_range(
        &self,
        data_config: &DataConfig,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MarketBar>> {
        let rows = self
            .client
            .query(
                "SELECT asset, source, timeframe, timestamp, open, high, low, close, volume
                 FROM market_data
                 WHERE asset = $1 AND source = $2 AND timeframe = $3
                   AND timestamp >= $4 AND timestamp < $5
                 ORDER BY timestamp",
                &[
                    &data_config.asset,
                    &data_config.source,
                    &data_config.timeframe,
                    &start,
                    &end,
                ],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| MarketBar {
                asset: row.get(0),
                source: row.get(1),
                timeframe: row.get(2),
                timestamp: row.get(3),
                open: row.get(4),
                high: row.get(5),
                low: row.get(6),
                close: row.get(7),
                volume: row.get(8),
            })
            .collect())
    }

    pub async fn upsert_bars(&mut self, bars: &[MarketBar]) -> Result<usize> {
        if bars.is_empty() {
            return Ok(0);
        }

        let mut inserted = 0usize;
        for chunk in bars.chunks(BAR_INSERT_CHUNK_SIZE) {
            let tx = self.client.transaction().await?;
            let stmt = tx
                .prepare(
                    "INSERT INTO market_data
                         (asset, source, timeframe, timestamp, open, high, low, close, volume)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                     ON CONFLICT (asset, source, timeframe, timestamp) DO NOTHING",
                )
                .await?;
            for bar in chunk {
                let changed = tx
                    .execute(
                        &stmt,
                        &[
                            &bar.asset,
                            &bar.source,
                            &bar.timeframe,
                            &bar.timestamp,
                            &bar.open,
                            &bar.high,
                            &bar.low,
                            &bar.close,
                            &bar.volume,
                        ],
                    )
                    .await?;
                if changed > 0 {
                    inserted += 1;
                }
            }
            tx.commit().await?;
        }
        Ok(inserted)
    }

    pub async fn upsert_actions(&mut self, actions: &[MarketAction]) -> Result<usize> {
        if actions.is_empty() {
            return Ok(0);
        }

        let mut inserted = 0usize;
        for chunk in actions.chunks(ACTION_INSERT_CHUNK_SIZE) {
            let tx = self.client.transaction().await?;
            let stmt = tx
                .prepare(
                    "INSERT INTO market_actions
                         (asset, source, timeframe, timestamp, dividends, stock_splits, capital_gains)
                     VALUES ($1, $2, $3, $4, $5, $6, $7)
                     ON CONFLICT (asset, source, timeframe, timestamp) DO NOTHING",
                )
                .await?;
            for action in chunk {
                let changed = tx
                    .execute(
                        &stmt,
                        &[
                            &action.asset,
                            &action.source,
                            &action.timeframe,
                            &action.timestamp,
                            &action.dividends,
                            &action.stock_splits,
                            &action.capital_gains,
                        ],
                    )
                    .await?;
                if changed > 0 {
                    inserted += 1;
                }
            }
            tx.commit().await?;
        }
        Ok(inserted)
    }

    /// Returns the identity set of persisted runs for an asset/timeframe. The
    /// scope is applied server-side so the diff never pulls other series.
    pub async fn fetch_run_keys(&self, asset: &str, timeframe: &str) -> Result<HashSet<RunKey>> {
        let rows = self
            .client
            .query(
                &format!(
                    "SELECT {} FROM macd_histogram_sign_flip_strategy
                     WHERE asset = $1 AND timeframe = $2",
                    RUN_KEY_COLUMNS
                ),
                &[&asset, &timeframe],
            )
            .await?;

        let mut keys = HashSet::with_capacity(rows.len());
        for row in rows {
            keys.insert(map_run_key(&row)?);
        }
        Ok(keys)
    }

    /// Bulk insert-or-ignore of completed runs. Runs without metrics are a
    /// programming error upstream and are rejected.
    pub async fn insert_runs(&mut self, runs: &[SimulationRun]) -> Result<usize> {
        if runs.is_empty() {
            return Ok(0);
        }

        let mut inserted = 0usize;
        for chunk in runs.chunks(RUN_INSERT_CHUNK_SIZE) {
            let tx = self.client.transaction().await?;
            let stmt = tx
                .prepare(&format!(
                    "INSERT INTO macd_histogram_sign_flip_strategy ({}, metrics)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                     ON CONFLICT DO NOTHING",
                    RUN_KEY_COLUMNS
                ))
                .await?;
            for run in chunk {
                let metrics = run
                    .metrics
                    .as_ref()
                    .with_context(|| format!("run {} has no metrics to persist", run.key))?
                    .to_json();
                let key = &run.key;
                let changed = tx
                    .execute(
                        &stmt,
                        &[
                            &key.asset,
                            &key.timeframe,
                            &key.start_date,
                            &key.end_date,
                            &key.initial_cash,
                            &key.fee,
                            &key.slippage,
                            &key.position_sizing.as_str(),
                            &key.direction.as_str(),
                            &key.random_seed,
                            &(key.fast_period as i32),
                            &(key.slow_period as i32),
                            &(key.signal_period as i32),
                            &metrics,
                        ],
                    )
                    .await?;
                if changed > 0 {
                    inserted += 1;
                }
            }
            tx.commit().await?;
        }
        Ok(inserted)
    }

    /// Loads persisted runs with their encoded metrics for export, ordered so
    /// repeated exports produce identical files.
    pub async fn fetch_completed_runs(
        &self,
        asset: &str,
        timeframe: &str,
    ) -> Result<Vec<(RunKey, EncodedMetrics)>> {
        let rows = self
            .client
            .query(
                &format!(
                    "SELECT {}, metrics FROM macd_histogram_sign_flip_strategy
                     WHERE asset = $1 AND timeframe = $2
                     ORDER BY end_date, start_date, fast_period, slow_period, signal_period",
                    RUN_KEY_COLUMNS
                ),
                &[&asset, &timeframe],
            )
            .await?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in rows {
            let key = map_run_key(&row)?;
            let metrics_json: serde_json::Value = row.get(13);
            let metrics = EncodedMetrics::from_json(&metrics_json)
                .with_context(|| format!("corrupt metrics payload for run {}", key))?;
            runs.push((key, metrics));
        }
        Ok(runs)
    }
}

fn map_run_key(row: &Row) -> Result<RunKey> {
    let position_sizing_raw: String = row.get(7);
    let direction_raw: String = row.get(8);
    Ok(RunKey {
        asset: row.get(0),
        timeframe: row.get(1),
        start_date: row.get(2),
        end_date: row.get(3),
        initial_cash: row.get(4),
        fee: row.get(5),
        slippage: row.get(6),
        position_sizing: PositionSizing::from_str(&position_sizing_raw)?,
        direction: TradeDirection::from_str(&direction_raw)?,
        random_seed: row.get(9),
        fast_period: row.get::<_, i32>(10) as u32,
        slow_period: row.get::<_, i32>(11) as u32,
        signal_period: row.get::<_, i32>(12) as u32,
    })
}
