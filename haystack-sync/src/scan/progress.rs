//! Rate limited progress reporting

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

/// Snapshot of scan progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanProgress {
    /// Height just scanned
    pub height: u64,
    /// Last height of the range
    pub end_height: u64,
    /// Share of the range scanned so far, 0 to 100
    pub percent: f64,
    /// Matches held by the index
    pub found: usize,
}

impl fmt::Display for ScanProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Scanning blockchain (height: {}/{}, progress: {:.2}%, found: {})",
            self.height, self.end_height, self.percent, self.found
        )
    }
}

/// Emits at most one [`ScanProgress`] per interval, plus one at the end height.
#[derive(Debug)]
pub(crate) struct ProgressReporter {
    start_height: u64,
    end_height: u64,
    interval: Duration,
    last_report: Instant,
}

impl ProgressReporter {
    pub(crate) fn new(start_height: u64, end_height: u64, interval: Duration) -> Self {
        Self {
            start_height,
            end_height,
            interval,
            last_report: Instant::now(),
        }
    }

    pub(crate) fn poll(&mut self, height: u64, found: usize) -> Option<ScanProgress> {
        let now = Instant::now();
        let force = height >= self.end_height;
        if !force && now < self.last_report + self.interval {
            return None;
        }
        self.last_report = now;

        Some(ScanProgress {
            height,
            end_height: self.end_height,
            percent: percent(self.start_height, self.end_height, height),
            found,
        })
    }
}

fn percent(start_height: u64, end_height: u64, height: u64) -> f64 {
    if end_height <= start_height {
        return 100.0;
    }
    let done = height.saturating_sub(start_height).min(end_height - start_height);

    done as f64 / (end_height - start_height) as f64 * 100.0
}
