use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Result};
use chrono::Duration;
use crossbeam_channel::{bounded, Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::backtester::{run_backtest, ExecutionParams};
use crate::grid::warmup_period;
use crate::metrics::encode_metrics;
use crate::models::{MarketBar, SimulationRun};
use crate::signals::sign_flip_signals;

const RESULT_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(200);
const CONSUMER_POLL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);

/// Message protocol of the persistence queue. The explicit shutdown sentinel
/// lets the producer side close deterministically while senders still exist.
pub enum ConsumerMessage {
    Run(SimulationRun),
    Shutdown,
}

/// Durability outcome of one consumer lifetime. `failed` counts runs that
/// were received but could not be persisted; the caller decides whether that
/// constitutes a run failure.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushSummary {
    pub received: usize,
    pub flushed: usize,
    pub failed: usize,
}

/// Scheduling outcome of one asset/timeframe: how many runs completed and
/// how many were lost to batch failures.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScheduleSummary {
    pub completed: usize,
    pub failed: usize,
}

struct BatchTask {
    id: usize,
    runs: Vec<SimulationRun>,
}

struct BatchOutcome {
    completed: usize,
    failed: usize,
}

/// Executes one scheduled run against the shared bar series: slice the
/// window, generate sign-flip signals with the warm-up prefix trimmed, run
/// the backtest and encode its metrics.
pub fn execute_run(
    run: &SimulationRun,
    bars: &[MarketBar],
    timeframe_delta: Duration,
) -> Result<SimulationRun> {
    if run.end_idx > bars.len() || run.start_idx >= run.end_idx {
        return Err(anyhow!(
            "run {} has window [{}, {}) outside the {}-bar series",
            run.key,
            run.start_idx,
            run.end_idx,
            bars.len()
        ));
    }

    let params = run.key.params();
    let window = &bars[run.start_idx..run.end_idx];
    let frame = sign_flip_signals(window, &params, true);
    debug_assert_eq!(
        frame.len(),
        window.len() - warmup_period(&params).min(window.len())
    );

    let stats = run_backtest(
        &frame,
        ExecutionParams {
            initial_cash: run.key.initial_cash,
            fee: run.key.fee,
            slippage: run.key.slippage,
        },
        timeframe_delta,
    );

    Ok(SimulationRun {
        key: run.key.clone(),
        start_idx: run.start_idx,
        end_idx: run.end_idx,
        metrics: Some(encode_metrics(&stats)),
    })
}

fn run_batch(
    task: &BatchTask,
    bars: &[MarketBar],
    timeframe_delta: Duration,
) -> Result<Vec<SimulationRun>> {
    task.runs
        .iter()
        .map(|run| execute_run(run, bars, timeframe_delta))
        .collect()
}

/// Fans the missing runs out over a worker-thread pool in
/// `simulation_batch_size` batches and forwards every completed run into the
/// persistence queue, blocking on its back-pressure. Batches complete in
/// whatever order workers finish them. A failed batch is logged and counted,
/// and the remaining batches keep running.
///
/// Blocks the calling thread; run it under `spawn_blocking` when inside the
/// async runtime.
pub fn run_missing_simulations(
    missing: Vec<SimulationRun>,
    bars: Arc<Vec<MarketBar>>,
    timeframe_delta: Duration,
    batch_size: usize,
    threads_to_use: usize,
    queue_tx: &mpsc::Sender<ConsumerMessage>,
) -> Result<ScheduleSummary> {
    if missing.is_empty() {
        return Ok(ScheduleSummary::default());
    }

    let total_runs = missing.len();
    let batches: Vec<Vec<SimulationRun>> = missing
        .chunks(batch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect();
    let batch_count = batches.len();
    let num_workers = threads_to_use.max(1).min(batch_count);
    info!(
        "Running {} simulations in {} batches on {} worker threads",
        total_runs, batch_count, num_workers
    );

    let (task_tx, task_rx): (Sender<BatchTask>, Receiver<BatchTask>) = bounded(batch_count);
    let (result_tx, result_rx): (Sender<BatchOutcome>, Receiver<BatchOutcome>) =
        bounded(batch_count);

    let mut handles = Vec::new();
    for _ in 0..num_workers {
        let task_rx = task_rx.clone();
        let result_tx = result_tx.clone();
        let bars = Arc::clone(&bars);
        let queue_tx = queue_tx.clone();

        let handle = thread::spawn(move || {
            while let Ok(task) = task_rx.recv() {
                let batch_len = task.runs.len();
                let outcome = match run_batch(&task, bars.as_slice(), timeframe_delta) {
                    Ok(completed) => {
                        let mut forwarded = 0usize;
                        for run in completed {
                            if queue_tx.blocking_send(ConsumerMessage::Run(run)).is_err() {
                                warn!(
                                    "Persistence queue closed, dropping the rest of batch {}",
                                    task.id
                                );
                                break;
                            }
                            forwarded += 1;
                        }
                        // Runs already forwarded made it into the queue;
                        // only the remainder is lost.
                        BatchOutcome {
                            completed: forwarded,
                            failed: batch_len - forwarded,
                        }
                    }
                    Err(err) => {
                        error!("Batch {} failed: {}", task.id, err);
                        BatchOutcome {
                            completed: 0,
                            failed: batch_len,
                        }
                    }
                };
                if result_tx.send(outcome).is_err() {
                    break;
                }
            }
        });
        handles.push(handle);
    }

    for (id, runs) in batches.into_iter().enumerate() {
        task_tx.send(BatchTask { id, runs })?;
    }
    drop(task_tx);
    drop(result_tx);

    let pb = ProgressBar::new(total_runs as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap()
            .progress_chars("#>-"),
    );

    let mut summary = ScheduleSummary::default();
    let mut finished_batches = 0usize;
    while finished_batches < batch_count {
        match result_rx.recv_timeout(RESULT_POLL_INTERVAL) {
            Ok(outcome) => {
                finished_batches += 1;
                summary.completed += outcome.completed;
                summary.failed += outcome.failed;
                pb.set_position((summary.completed + summary.failed) as u64);
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                warn!("Batch result channel closed unexpectedly, some results may be lost");
                break;
            }
        }
    }

    if summary.failed > 0 {
        warn!("Simulations completed with {} failed runs", summary.failed);
        pb.finish_with_message("Simulations completed with errors");
    } else {
        pb.finish_with_message("Simulations completed");
    }

    for handle in handles {
        handle
            .join()
            .map_err(|_| anyhow!("simulation worker thread panicked"))?;
    }
    Ok(summary)
}

/// Destination of completed runs. Abstracted from the database so the
/// consumer loop is testable without a live server.
#[allow(async_fn_in_trait)]
pub trait ResultSink {
    async fn persist(&mut self, runs: &[SimulationRun]) -> Result<usize>;
}

impl ResultSink for crate::database::Database {
    async fn persist(&mut self, runs: &[SimulationRun]) -> Result<usize> {
        self.insert_runs(runs).await
    }
}

/// Drains the persistence queue, flushing a bulk insert whenever
/// `max_bulk_insert` runs are buffered and once more on shutdown. Polls with
/// a timeout so a stalled producer is visible in the logs. Flush errors are
/// logged and tallied, never swallowed: the caller receives the full
/// durability picture in the returned summary.
pub async fn persist_results<S: ResultSink>(
    mut queue_rx: mpsc::Receiver<ConsumerMessage>,
    mut sink: S,
    max_bulk_insert: usize,
) -> FlushSummary {
    let mut summary = FlushSummary::default();
    let mut buffer: Vec<SimulationRun> = Vec::with_capacity(max_bulk_insert);

    loop {
        match tokio::time::timeout(CONSUMER_POLL_TIMEOUT, queue_rx.recv()).await {
            Ok(Some(ConsumerMessage::Run(run))) => {
                summary.received += 1;
                buffer.push(run);
                if buffer.len() >= max_bulk_insert {
                    flush(&mut sink, &mut buffer, &mut summary).await;
                }
            }
            Ok(Some(ConsumerMessage::Shutdown)) => {
                flush(&mut sink, &mut buffer, &mut summary).await;
                break;
            }
            Ok(None) => {
                warn!("Persistence queue closed without a shutdown message");
                flush(&mut sink, &mut buffer, &mut summary).await;
                break;
            }
            Err(_) => {
                debug!("Persistence consumer idle, waiting for results");
            }
        }
    }

    info!(
        "Persistence consumer done: {} received, {} flushed, {} failed",
        summary.received, summary.flushed, summary.failed
    );
    summary
}

async fn flush<S: ResultSink>(
    sink: &mut S,
    buffer: &mut Vec<SimulationRun>,
    summary: &mut FlushSummary,
) {
    if buffer.is_empty() {
        return;
    }
    match sink.persist(buffer).await {
        Ok(inserted) => {
            debug!(
                "Flushed {} runs ({} newly inserted)",
                buffer.len(),
                inserted
            );
            summary.flushed += buffer.len();
        }
        Err(err) => {
            error!("Failed to flush {} runs: {}", buffer.len(), err);
            summary.failed += buffer.len();
        }
    }
    buffer.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::TRACKED_METRICS;
    use crate::models::{PositionSizing, RunKey, TradeDirection};
    use chrono::{TimeZone, Utc};

    fn synthetic_bars(count: usize) -> Vec<MarketBar> {
        let base = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        (0..count)
            .map(|i| {
                // An oscillating series so the histogram actually flips sign.
                let close = 100.0 + 10.0 * ((i as f64) * 0.35).sin();
                MarketBar {
                    asset: "TEST".to_string(),
                    source: "yahoo".to_string(),
                    timeframe: "1d".to_string(),
                    timestamp: base + Duration::days(i as i64),
                    open: close,
                    high: close + 1.0,
                    low: close - 1.0,
                    close,
                    volume: 1_000.0,
                }
            })
            .collect()
    }

    fn run_for_window(bars: &[MarketBar], start_idx: usize, end_idx: usize) -> SimulationRun {
        SimulationRun {
            key: RunKey {
                asset: "TEST".to_string(),
                timeframe: "1d".to_string(),
                start_date: bars[start_idx].timestamp,
                end_date: bars[end_idx - 1].timestamp + Duration::days(1),
                initial_cash: 10_000.0,
                fee: 0.001,
                slippage: 0.0,
                position_sizing: PositionSizing::Fixed,
                direction: TradeDirection::LongOnly,
                random_seed: 0,
                fast_period: 5,
                slow_period: 10,
                signal_period: 4,
            },
            start_idx,
            end_idx,
            metrics: None,
        }
    }

    #[test]
    fn execute_run_encodes_every_tracked_metric() {
        let bars = synthetic_bars(120);
        let run = run_for_window(&bars, 0, 100);
        let done = execute_run(&run, &bars, Duration::days(1)).unwrap();
        let metrics = done.metrics.unwrap();
        assert_eq!(metrics.len(), TRACKED_METRICS.len());
        for (_, alias) in TRACKED_METRICS {
            assert!(metrics.get(alias).is_some(), "missing alias {}", alias);
        }
    }

    #[test]
    fn execute_run_rejects_out_of_range_windows() {
        let bars = synthetic_bars(50);
        let run = run_for_window(&bars, 0, 40);
        let mut bad = run.clone();
        bad.end_idx = 60;
        assert!(execute_run(&bad, &bars, Duration::days(1)).is_err());
    }

    struct RecordingSink {
        persisted: Vec<SimulationRun>,
        flush_sizes: Vec<usize>,
        fail_next: bool,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                persisted: Vec::new(),
                flush_sizes: Vec::new(),
                fail_next: false,
            }
        }
    }

    impl ResultSink for &mut RecordingSink {
        async fn persist(&mut self, runs: &[SimulationRun]) -> Result<usize> {
            if self.fail_next {
                self.fail_next = false;
                return Err(anyhow!("sink unavailable"));
            }
            self.flush_sizes.push(runs.len());
            self.persisted.extend_from_slice(runs);
            Ok(runs.len())
        }
    }

    #[tokio::test]
    async fn consumer_flushes_at_bulk_size_and_on_shutdown() {
        let bars = synthetic_bars(60);
        let runs: Vec<SimulationRun> = (0..5)
            .map(|i| {
                let mut run = run_for_window(&bars, i, 50 + i);
                run.metrics = Some(crate::metrics::encode_metrics(&Default::default()));
                run
            })
            .collect();

        let (tx, rx) = mpsc::channel(8);
        for run in runs {
            tx.send(ConsumerMessage::Run(run)).await.unwrap();
        }
        tx.send(ConsumerMessage::Shutdown).await.unwrap();

        let mut sink = RecordingSink::new();
        let summary = persist_results(rx, &mut sink, 2).await;

        assert_eq!(summary.received, 5);
        assert_eq!(summary.flushed, 5);
        assert_eq!(summary.failed, 0);
        assert_eq!(sink.flush_sizes, vec![2, 2, 1]);
        assert_eq!(sink.persisted.len(), 5);
    }

    #[tokio::test]
    async fn consumer_counts_failed_flushes_instead_of_swallowing_them() {
        let bars = synthetic_bars(60);
        let (tx, rx) = mpsc::channel(8);
        for i in 0..4 {
            let mut run = run_for_window(&bars, i, 50 + i);
            run.metrics = Some(crate::metrics::encode_metrics(&Default::default()));
            tx.send(ConsumerMessage::Run(run)).await.unwrap();
        }
        tx.send(ConsumerMessage::Shutdown).await.unwrap();

        let mut sink = RecordingSink::new();
        sink.fail_next = true;
        let summary = persist_results(rx, &mut sink, 2).await;

        // First flush of two fails, second flush of two lands.
        assert_eq!(summary.received, 4);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.flushed, 2);
        assert_eq!(sink.persisted.len(), 2);
    }

    #[tokio::test]
    async fn scheduler_forwards_every_run_through_the_queue() {
        let bars = Arc::new(synthetic_bars(120));
        let missing: Vec<SimulationRun> = (0..6)
            .map(|i| run_for_window(&bars, i, 100 + i))
            .collect();

        let (tx, rx) = mpsc::channel(4);
        let scheduler_bars = Arc::clone(&bars);
        let scheduler = tokio::task::spawn_blocking(move || {
            run_missing_simulations(missing, scheduler_bars, Duration::days(1), 2, 2, &tx)
        });

        let mut sink = RecordingSink::new();
        let consumer = persist_results(rx, &mut sink, 4);

        let (schedule, summary) = tokio::join!(scheduler, consumer);
        let schedule = schedule.unwrap().unwrap();

        assert_eq!(schedule.completed, 6);
        assert_eq!(schedule.failed, 0);
        // The queue closes when the scheduler drops its sender clone.
        assert_eq!(summary.received, 6);
        assert_eq!(summary.flushed, 6);
        assert_eq!(sink.persisted.len(), 6);
        assert!(sink.persisted.iter().all(|run| run.metrics.is_some()));
    }

    #[tokio::test]
    async fn scheduler_counts_only_runs_lost_to_a_closed_queue() {
        let bars = Arc::new(synthetic_bars(120));
        let missing: Vec<SimulationRun> =
            (0..4).map(|i| run_for_window(&bars, i, 100 + i)).collect();

        let (tx, mut rx) = mpsc::channel(1);
        let scheduler_bars = Arc::clone(&bars);
        let scheduler = tokio::task::spawn_blocking(move || {
            run_missing_simulations(missing, scheduler_bars, Duration::days(1), 4, 1, &tx)
        });

        // Take two runs off the queue, then drop the receiver so the rest of
        // the batch cannot be forwarded.
        let receiver = tokio::spawn(async move {
            let mut taken = 0usize;
            while taken < 2 {
                match rx.recv().await {
                    Some(ConsumerMessage::Run(_)) => taken += 1,
                    _ => break,
                }
            }
            taken
        });

        let (schedule, taken) = tokio::join!(scheduler, receiver);
        let schedule = schedule.unwrap().unwrap();
        assert_eq!(taken.unwrap(), 2);

        // Every run is accounted for exactly once, the forwarded ones are
        // not written off with the batch.
        assert_eq!(schedule.completed + schedule.failed, 4);
        assert!(schedule.completed >= 2);
        assert!(schedule.failed >= 1);
    }
}
