use chrono::{DateTime, Utc};

use crate::grid::warmup_period;
use crate::models::{MacdParams, MarketBar};

/// Exponential moving average seeded with the first value, the recursive
/// `adjust=False` form: `ema[i] = price[i] * k + ema[i-1] * (1 - k)` with
/// `k = 2 / (span + 1)`.
pub fn calculate_ema(values: &[f64], span: usize) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }

    let multiplier = 2.0 / (span as f64 + 1.0);
    let mut ema_values = Vec::with_capacity(values.len());
    ema_values.push(values[0]);

    for i in 1..values.len() {
        let ema = values[i] * multiplier + ema_values[i - 1] * (1.0 - multiplier);
        ema_values.push(ema);
    }

    ema_values
}

/// MACD histogram: fast EMA minus slow EMA, less its own signal-period EMA.
pub fn macd_histogram(closes: &[f64], params: &MacdParams) -> Vec<f64> {
    let fast_ema = calculate_ema(closes, params.fast() as usize);
    let slow_ema = calculate_ema(closes, params.slow() as usize);

    let macd_line: Vec<f64> = fast_ema
        .iter()
        .zip(slow_ema.iter())
        .map(|(fast, slow)| fast - slow)
        .collect();

    let signal_line = calculate_ema(&macd_line, params.signal() as usize);

    macd_line
        .iter()
        .zip(signal_line.iter())
        .map(|(macd, signal)| macd - signal)
        .collect()
}

/// Per-bar entry/exit booleans aligned with the close series they were
/// derived from.
#[derive(Debug, Clone)]
pub struct SignalFrame {
    pub timestamps: Vec<DateTime<Utc>>,
    pub closes: Vec<f64>,
    pub entries: Vec<bool>,
    pub exits: Vec<bool>,
}

impl SignalFrame {
    pub fn len(&self) -> usize {
        self.closes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closes.is_empty()
    }
}

/// Go long when the MACD histogram flips from negative to non-negative, exit
/// when it flips from positive to non-positive.
///
/// Assumes `bars` is sorted by timestamp. When `cut_warmup` is set the
/// leading warm-up bars, which only exist to stabilize the EMAs, are dropped
/// from all series so the frame covers exactly the effective simulation
/// region.
pub fn sign_flip_signals(bars: &[MarketBar], params: &MacdParams, cut_warmup: bool) -> SignalFrame {
    let closes: Vec<f64> = bars.iter().map(|bar| bar.close).collect();
    let timestamps: Vec<DateTime<Utc>> = bars.iter().map(|bar| bar.timestamp).collect();
    let histogram = macd_histogram(&closes, params);

    let mut entries = vec![false; histogram.len()];
    let mut exits = vec![false; histogram.len()];
    for i in 1..histogram.len() {
        entries[i] = histogram[i - 1] < 0.0 && histogram[i] >= 0.0;
        exits[i] = histogram[i - 1] > 0.0 && histogram[i] <= 0.0;
    }

    let offset = if cut_warmup {
        warmup_period(params).min(closes.len())
    } else {
        0
    };

    SignalFrame {
        timestamps: timestamps[offset..].to_vec(),
        closes: closes[offset..].to_vec(),
        entries: entries[offset..].to_vec(),
        exits: exits[offset..].to_vec(),
    }
}
