use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::{error, info, warn};
use tokio::sync::mpsc;

use crate::collector::{collect_data, YahooChartClient};
use crate::config::{align_start_dates, AnalysisSettings, DataConfig};
use crate::context::AppContext;
use crate::database::Database;
use crate::runner::{
    persist_results, run_missing_simulations, ConsumerMessage, ScheduleSummary,
};
use crate::tasks::{build_required_runs, missing_runs};

/// Runs the full parameter-sensitivity pipeline for every configured series:
/// complete the bar data, diff the required grid x window runs against the
/// store, execute the missing ones and persist their metrics.
///
/// Per-series failures are logged and skipped so one broken feed never stops
/// the rest; lost results (failed batches or failed flushes) surface as an
/// error at the end.
pub async fn run(app: &AppContext, settings: &AnalysisSettings) -> Result<()> {
    let mut data_configs = settings.data_configs.clone();
    align_start_dates(&mut data_configs, &settings.window_configs);

    let mut db = app.database().await?;
    db.init_schema().await?;

    // The consumer gets its own connection so bulk inserts never contend
    // with the collection queries on the main one.
    let consumer_db = app.database().await?;
    let (queue_tx, queue_rx) = mpsc::channel(settings.run_control.consumer_queue_size);
    let consumer = tokio::spawn(persist_results(
        queue_rx,
        consumer_db,
        settings.run_control.db_bulk_insert_size,
    ));

    let source = YahooChartClient::new(reqwest::Client::new());
    let mut total = ScheduleSummary::default();

    for data_config in &data_configs {
        match simulate_series(&mut db, &source, data_config, settings, &queue_tx).await {
            Ok(summary) => {
                total.completed += summary.completed;
                total.failed += summary.failed;
            }
            Err(err) => {
                error!(
                    "Error processing {} ({}): {}",
                    data_config.asset, data_config.timeframe, err
                );
                continue;
            }
        }
    }

    if queue_tx.send(ConsumerMessage::Shutdown).await.is_err() {
        warn!("Persistence consumer exited before shutdown");
    }
    drop(queue_tx);
    let flush = consumer
        .await
        .map_err(|err| anyhow!("persistence consumer panicked: {}", err))?;

    info!(
        "Simulation pass done: {} completed, {} failed, {} persisted",
        total.completed, total.failed, flush.flushed
    );

    if total.failed > 0 || flush.failed > 0 {
        return Err(anyhow!(
            "{} runs failed to execute and {} failed to persist",
            total.failed,
            flush.failed
        ));
    }
    Ok(())
}

async fn simulate_series(
    db: &mut Database,
    source: &YahooChartClient,
    data_config: &DataConfig,
    settings: &AnalysisSettings,
    queue_tx: &mpsc::Sender<ConsumerMessage>,
) -> Result<ScheduleSummary> {
    let max_warmup = settings.grid.max_warmup_period();
    let bars = collect_data(db, source, data_config, max_warmup).await?;
    let existing = db
        .fetch_run_keys(&data_config.asset, &data_config.timeframe)
        .await?;

    let required = build_required_runs(
        data_config,
        &settings.execution,
        &settings.grid,
        &settings.window_configs,
        &bars,
    )?;
    let missing = missing_runs(required, &existing);
    if missing.is_empty() {
        return Ok(ScheduleSummary::default());
    }

    let bars = Arc::new(bars);
    let timeframe_delta = data_config.timeframe_delta;
    let batch_size = settings.run_control.simulation_batch_size;
    let threads_to_use = settings.run_control.threads_to_use;
    let queue_tx = queue_tx.clone();

    // The scheduler blocks on worker threads and queue back-pressure.
    tokio::task::spawn_blocking(move || {
        run_missing_simulations(
            missing,
            bars,
            timeframe_delta,
            batch_size,
            threads_to_use,
            &queue_tx,
        )
    })
    .await
    .map_err(|err| anyhow!("simulation scheduler panicked: {}", err))?
}
