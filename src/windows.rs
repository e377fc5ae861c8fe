use thiserror::Error;

/// Size of each simulation window in bars, and the backward step between
/// consecutive windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowConfig {
    pub window_size: usize,
    pub window_shift: usize,
}

/// Half-open index slice of the bar sequence handed to one simulation.
/// The leading `warmup` bars only stabilize the indicator; the effective
/// simulated region is `[start_idx + warmup, end_idx)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimWindow {
    pub start_idx: usize,
    pub end_idx: usize,
}

/// Signals a configuration/data mismatch: the available history cannot fit a
/// single window with the grid's largest warm-up. Fatal for the
/// asset/timeframe, never silently truncated.
#[derive(Debug, Error)]
#[error(
    "Not enough history for window_size={window_size} with warmup={warmup} \
     (max_warmup={max_warmup}, total_bars={total_bars})"
)]
pub struct InsufficientHistory {
    pub total_bars: usize,
    pub window_size: usize,
    pub warmup: usize,
    pub max_warmup: usize,
}

/// Plans right-anchored sliding windows, most recent first.
///
/// Walks backward from the last bar in steps of `window_shift`, emitting
/// `(end_idx - window_size - warmup, end_idx)` slices. The stop bound uses
/// the grid-wide `max_warmup` so that every parameter triple sees the same
/// `end_idx` sequence and therefore simulates the same effective
/// `[end_idx - window_size, end_idx)` spans, which is what the downstream
/// drift analysis groups on.
pub fn plan_windows(
    total_bars: usize,
    config: WindowConfig,
    warmup: usize,
    max_warmup: usize,
) -> Result<Vec<SimWindow>, InsufficientHistory> {
    debug_assert!(warmup <= max_warmup);
    debug_assert!(config.window_size > 0 && config.window_shift > 0);

    let insufficient = || InsufficientHistory {
        total_bars,
        window_size: config.window_size,
        warmup,
        max_warmup,
    };

    let mut windows = Vec::new();
    let mut end_idx = total_bars;
    let stop = max_warmup + config.window_size - 1;

    while end_idx > stop {
        let span = config.window_size + warmup;
        // Guarded by the stop bound; kept as a hard check because a negative
        // start would mean corrupted index arithmetic, not a planning miss.
        let start_idx = end_idx.checked_sub(span).ok_or_else(insufficient)?;
        windows.push(SimWindow { start_idx, end_idx });

        if end_idx < config.window_shift {
            break;
        }
        end_idx -= config.window_shift;
    }

    if windows.is_empty() {
        return Err(insufficient());
    }

    Ok(windows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_window_matches_hand_computation() {
        let config = WindowConfig {
            window_size: 50,
            window_shift: 10,
        };
        let windows = plan_windows(100, config, 34, 34).unwrap();
        assert_eq!(
            windows[0],
            SimWindow {
                start_idx: 16,
                end_idx: 100
            }
        );
        // 100 and 90 clear the stop bound of 83; 80 does not.
        assert_eq!(windows.len(), 2);
        assert_eq!(
            windows[1],
            SimWindow {
                start_idx: 6,
                end_idx: 90
            }
        );
    }

    #[test]
    fn windows_never_start_before_zero() {
        let config = WindowConfig {
            window_size: 30,
            window_shift: 7,
        };
        for total_bars in 65..200 {
            let windows = plan_windows(total_bars, config, 34, 34).unwrap();
            for window in &windows {
                assert!(window.end_idx <= total_bars);
                assert_eq!(window.end_idx - window.start_idx, 30 + 34);
            }
        }
    }

    #[test]
    fn insufficient_history_is_an_error() {
        let config = WindowConfig {
            window_size: 50,
            window_shift: 10,
        };
        let err = plan_windows(80, config, 34, 34).unwrap_err();
        assert_eq!(err.total_bars, 80);
        assert_eq!(err.window_size, 50);
    }

    #[test]
    fn smaller_warmup_keeps_end_indices_aligned_with_grid_maximum() {
        let config = WindowConfig {
            window_size: 40,
            window_shift: 5,
        };
        let short = plan_windows(120, config, 20, 34).unwrap();
        let long = plan_windows(120, config, 34, 34).unwrap();

        let short_ends: Vec<_> = short.iter().map(|w| w.end_idx).collect();
        let long_ends: Vec<_> = long.iter().map(|w| w.end_idx).collect();
        assert_eq!(short_ends, long_ends);

        for window in &short {
            assert_eq!(window.end_idx - window.start_idx, 40 + 20);
        }
    }
}
