use chrono::Duration;
use statrs::statistics::Statistics;

use crate::metrics::{RawStats, StatValue};
use crate::signals::SignalFrame;

const SECONDS_PER_YEAR: f64 = 365.25 * 24.0 * 60.0 * 60.0;

/// Execution-context parameters for one simulation, passed by value into the
/// worker so a simulation is a pure function of (bars, params, context).
#[derive(Debug, Clone, Copy)]
pub struct ExecutionParams {
    pub initial_cash: f64,
    pub fee: f64,
    pub slippage: f64,
}

#[derive(Debug, Clone, Copy)]
struct OpenPosition {
    quantity: f64,
    cash_before_entry: f64,
}

/// Runs a long-only signal-driven backtest over a warm-up-trimmed frame and
/// returns the raw statistics the metric codec normalizes for storage.
///
/// Orders fill at the signal bar's close adjusted for slippage; fees are a
/// fraction of order notional. Entries are ignored while a position is open,
/// exits while flat.
pub fn run_backtest(
    frame: &SignalFrame,
    params: ExecutionParams,
    timeframe_delta: Duration,
) -> RawStats {
    let mut stats = RawStats::new();
    if frame.is_empty() {
        return stats;
    }

    let mut cash = params.initial_cash;
    let mut position: Option<OpenPosition> = None;
    let mut equity = Vec::with_capacity(frame.len());

    let mut trade_pnls: Vec<f64> = Vec::new();
    let mut total_entries: i64 = 0;
    let mut total_fees = 0.0;

    for i in 0..frame.len() {
        let close = frame.closes[i];

        if position.is_none() && frame.entries[i] {
            let fill_price = close * (1.0 + params.slippage);
            let fee_paid = cash * params.fee;
            let quantity = (cash - fee_paid) / fill_price;
            if quantity > 0.0 {
                position = Some(OpenPosition {
                    quantity,
                    cash_before_entry: cash,
                });
                total_fees += fee_paid;
                total_entries += 1;
                cash = 0.0;
            }
        } else if let Some(open) = position {
            if frame.exits[i] {
                let fill_price = close * (1.0 - params.slippage);
                let gross = open.quantity * fill_price;
                let fee_paid = gross * params.fee;
                cash = gross - fee_paid;
                total_fees += fee_paid;
                trade_pnls.push(cash - open.cash_before_entry);
                position = None;
            }
        }

        let position_value = position.map_or(0.0, |open| open.quantity * close);
        equity.push(cash + position_value);
    }

    let initial = params.initial_cash;
    let final_equity = *equity.last().unwrap_or(&initial);

    stats.insert(
        "Total Return [%]".to_string(),
        StatValue::Float((final_equity / initial - 1.0) * 100.0),
    );

    let first_close = frame.closes[0];
    let last_close = frame.closes[frame.len() - 1];
    stats.insert(
        "Benchmark Return [%]".to_string(),
        StatValue::Float((last_close / first_close - 1.0) * 100.0),
    );

    let returns: Vec<f64> = equity
        .windows(2)
        .map(|pair| pair[1] / pair[0] - 1.0)
        .collect();
    let periods_per_year = SECONDS_PER_YEAR / timeframe_delta.num_seconds().max(1) as f64;

    stats.insert(
        "Sharpe Ratio".to_string(),
        StatValue::Float(sharpe_ratio(&returns, periods_per_year)),
    );
    stats.insert(
        "Sortino Ratio".to_string(),
        StatValue::Float(sortino_ratio(&returns, periods_per_year)),
    );
    stats.insert(
        "Omega Ratio".to_string(),
        StatValue::Float(omega_ratio(&returns)),
    );

    let (max_dd_pct, max_dd_bars) = max_drawdown(&equity);
    stats.insert(
        "Max Drawdown [%]".to_string(),
        StatValue::Float(max_dd_pct),
    );
    stats.insert(
        "Max Drawdown Duration".to_string(),
        StatValue::Duration(timeframe_delta * max_dd_bars as i32),
    );

    let years = frame.len() as f64 / periods_per_year;
    let annualized = if years > 0.0 && final_equity > 0.0 {
        (final_equity / initial).powf(1.0 / years) - 1.0
    } else {
        f64::NAN
    };
    let calmar = if max_dd_pct > 0.0 {
        annualized * 100.0 / max_dd_pct
    } else {
        f64::NAN
    };
    stats.insert("Calmar Ratio".to_string(), StatValue::Float(calmar));

    let closed = trade_pnls.len();
    let wins = trade_pnls.iter().filter(|&&pnl| pnl > 0.0).count();
    let win_rate = if closed > 0 {
        wins as f64 / closed as f64 * 100.0
    } else {
        f64::NAN
    };
    stats.insert("Win Rate [%]".to_string(), StatValue::Float(win_rate));

    let gross_profit: f64 = trade_pnls.iter().filter(|&&pnl| pnl > 0.0).sum();
    let gross_loss: f64 = -trade_pnls.iter().filter(|&&pnl| pnl < 0.0).sum::<f64>();
    let profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        f64::NAN
    };
    stats.insert(
        "Profit Factor".to_string(),
        StatValue::Float(profit_factor),
    );

    let expectancy = if closed > 0 {
        trade_pnls.iter().sum::<f64>() / closed as f64
    } else {
        f64::NAN
    };
    stats.insert("Expectancy".to_string(), StatValue::Float(expectancy));

    stats.insert("Total Trades".to_string(), StatValue::Int(total_entries));
    stats.insert(
        "Total Fees Paid".to_string(),
        StatValue::Float(total_fees),
    );

    stats
}

fn sharpe_ratio(returns: &[f64], periods_per_year: f64) -> f64 {
    if returns.len() < 2 {
        return f64::NAN;
    }
    let mean = returns.mean();
    let std_dev = returns.std_dev();
    if std_dev == 0.0 {
        return f64::NAN;
    }
    mean / std_dev * periods_per_year.sqrt()
}

fn sortino_ratio(returns: &[f64], periods_per_year: f64) -> f64 {
    if returns.len() < 2 {
        return f64::NAN;
    }
    let mean = returns.mean();
    let downside_sq: f64 = returns
        .iter()
        .map(|&r| if r < 0.0 { r * r } else { 0.0 })
        .sum();
    let downside = (downside_sq / (returns.len() - 1) as f64).sqrt();
    if downside == 0.0 {
        if mean > 0.0 {
            return f64::INFINITY;
        }
        return f64::NAN;
    }
    mean / downside * periods_per_year.sqrt()
}

fn omega_ratio(returns: &[f64]) -> f64 {
    let gains: f64 = returns.iter().filter(|&&r| r > 0.0).sum();
    let losses: f64 = -returns.iter().filter(|&&r| r < 0.0).sum::<f64>();
    if losses > 0.0 {
        gains / losses
    } else if gains > 0.0 {
        f64::INFINITY
    } else {
        f64::NAN
    }
}

/// Returns (max drawdown in percent, longest peak-to-recovery span in bars).
fn max_drawdown(equity: &[f64]) -> (f64, usize) {
    let mut peak = f64::NEG_INFINITY;
    let mut peak_idx = 0usize;
    let mut underwater = false;
    let mut max_dd = 0.0f64;
    let mut max_duration = 0usize;

    for (i, &value) in equity.iter().enumerate() {
        if value >= peak {
            // The recovery bar closes the underwater span and counts toward
            // its length.
            if underwater {
                max_duration = max_duration.max(i - peak_idx);
                underwater = false;
            }
            peak = value;
            peak_idx = i;
        } else {
            underwater = true;
            if peak > 0.0 {
                let dd = (peak - value) / peak * 100.0;
                if dd > max_dd {
                    max_dd = dd;
                }
            }
            // Still open, may grow until recovery or the end of the series.
            max_duration = max_duration.max(i - peak_idx);
        }
    }

    (max_dd, max_duration)
}
