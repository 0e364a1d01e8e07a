//! Transfer counters and speed meters
//!
//! The coordinator is the single writer of all counters, so these are plain
//! values, not atomics. Rates come from a rolling sample window.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Rolling-window byte rate meter.
#[derive(Debug)]
pub struct SpeedMeter {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    total: u64,
}

impl SpeedMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            total: 0,
        }
    }

    /// Record transferred bytes at the current instant.
    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    fn record_at(&mut self, now: Instant, bytes: u64) {
        self.samples.push_back((now, bytes));
        self.total += bytes;
        self.evict(now);
    }

    /// Current rate in bytes per second over the window.
    pub fn rate(&mut self) -> u64 {
        let now = Instant::now();
        self.evict(now);
        if self.samples.is_empty() {
            return 0;
        }
        let span = now
            .duration_since(self.samples.front().map(|(t, _)| *t).unwrap_or(now))
            .max(Duration::from_millis(100));
        (self.total as f64 / span.as_secs_f64()) as u64
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(t, bytes)) = self.samples.front() {
            if now.duration_since(t) <= self.window {
                break;
            }
            self.total -= bytes;
            self.samples.pop_front();
        }
    }
}

/// Byte totals the resume snapshot persists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferCounters {
    /// Bytes of verified pieces
    pub downloaded: u64,
    /// Bytes served to peers
    pub uploaded: u64,
    /// Bytes discarded: hash failures and duplicate blocks
    pub wasted: u64,
}
