//! Per-item throughput estimation
//!
//! Each [`TransferItem`](crate::item::TransferItem) owns at most one
//! [`SpeedTracker`], built lazily on the first progress report. The tracker
//! combines two helpers:
//!
//! - an activity tracker holding the time of the last observed progress, which
//!   arms stall detection once the done-unit count first moves off zero
//! - a throughput counter keeping a rolling window of `(time, done units)`
//!   samples from which blocks/minute, bytes/second and the ETA are derived
//!
//! All timestamps are milliseconds since the Unix epoch.

use std::collections::VecDeque;
use std::time::Duration;

/// Size of one backend block in bytes
pub const BLOCK_SIZE: u64 = 32 * 1024;

/// Minimum span of samples before a rate is reported
pub const MIN_MEASURE_SPAN_MS: u64 = 30_000;

/// Samples older than this are dropped from the rolling window
pub const RATE_WINDOW_MS: u64 = 10 * 60_000;

/// No progress for this long counts as a stall
pub const STALL_THRESHOLD_MS: u64 = 5 * 60_000;

/// Average block rate of a transfer
///
/// The two non-rate variants must be checked before the value is used as a
/// rate: `Measuring` means there is not enough history yet, `Idle` means the
/// transfer made no progress recently.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BlockRate {
    /// Not enough samples to compute a rate yet
    Measuring,
    /// No progress within the stall threshold
    Idle,
    /// Blocks per minute over the rolling window
    PerMinute(f64),
}

impl BlockRate {
    /// Blocks per minute, if a rate is available
    #[must_use]
    pub fn per_minute(self) -> Option<f64> {
        match self {
            BlockRate::PerMinute(rate) => Some(rate),
            BlockRate::Measuring | BlockRate::Idle => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ActivityTracker {
    last_units: u64,
    last_activity: Option<u64>,
}

impl ActivityTracker {
    fn record(&mut self, done_units: u64, now: u64) {
        if done_units != self.last_units && done_units > 0 {
            self.last_activity = Some(now);
        }
        self.last_units = done_units;
    }
}

#[derive(Debug, Clone, Default)]
struct ThroughputCounter {
    samples: VecDeque<(u64, u64)>,
}

impl ThroughputCounter {
    fn record(&mut self, done_units: u64, now: u64) {
        if let Some(&(_, last_units)) = self.samples.back() {
            // Counter went backwards (metadata phase finished), start over
            if done_units < last_units {
                self.samples.clear();
            }
        }
        self.samples.push_back((now, done_units));

        let cutoff = now.saturating_sub(RATE_WINDOW_MS);
        while self.samples.len() > 2 && self.samples[0].0 < cutoff {
            self.samples.pop_front();
        }
    }

    fn per_minute(&self) -> Option<f64> {
        let (&(first_at, first_units), &(last_at, last_units)) =
            (self.samples.front()?, self.samples.back()?);
        let span = last_at.saturating_sub(first_at);
        if span < MIN_MEASURE_SPAN_MS {
            return None;
        }
        let minutes = span as f64 / 60_000.0;
        Some(last_units.saturating_sub(first_units) as f64 / minutes)
    }
}

/// Rolling throughput estimator for one transfer
#[derive(Debug, Clone, Default)]
pub struct SpeedTracker {
    activity: ActivityTracker,
    throughput: ThroughputCounter,
}

impl SpeedTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current done-unit count
    ///
    /// The activity timestamp is updated before the throughput sample is
    /// taken.
    pub fn record(&mut self, done_units: u64, now: u64) {
        self.activity.record(done_units, now);
        self.throughput.record(done_units, now);
    }

    /// Forget all samples and the activity timestamp
    pub fn reset(&mut self) {
        self.activity = ActivityTracker::default();
        self.throughput = ThroughputCounter::default();
    }

    /// Time of the last observed progress, if any
    #[must_use]
    pub fn last_activity(&self) -> Option<u64> {
        self.activity.last_activity
    }

    /// Milliseconds since the last observed progress
    #[must_use]
    pub fn since_last_activity(&self, now: u64) -> Option<u64> {
        self.activity
            .last_activity
            .map(|at| now.saturating_sub(at))
    }

    /// True once progress was seen and then stopped for longer than the
    /// stall threshold
    #[must_use]
    pub fn is_stalled(&self, now: u64) -> bool {
        self.since_last_activity(now)
            .is_some_and(|idle| idle > STALL_THRESHOLD_MS)
    }

    /// Average blocks per minute
    #[must_use]
    pub fn block_rate(&self, now: u64) -> BlockRate {
        if self.is_stalled(now) {
            return BlockRate::Idle;
        }
        match self.throughput.per_minute() {
            Some(rate) => BlockRate::PerMinute(rate),
            None => BlockRate::Measuring,
        }
    }

    /// Average bytes per second, if a rate is available
    #[must_use]
    pub fn bytes_per_second(&self, now: u64) -> Option<f64> {
        self.block_rate(now)
            .per_minute()
            .map(|rate| rate * BLOCK_SIZE as f64 / 60.0)
    }

    /// Estimated time to transfer `remaining_units` more blocks
    #[must_use]
    pub fn eta(&self, remaining_units: u64, now: u64) -> Option<Duration> {
        let rate = self.block_rate(now).per_minute()?;
        if rate <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_units as f64 / rate * 60.0))
    }
}
