//! Running throughput statistics for a single transfer.
//!
//! Everything here is pure bookkeeping: the drivers feed byte counts in and
//! pull [`ProgressSample`]s out, no I/O happens in this module.

use serde::{Serialize, Serializer};
use std::time::Duration;
use tokio::time::Instant;

/// Elapsed time is never taken below this when computing a rate.
pub const MIN_ELAPSED_SECS: f64 = 0.001;

/// Minimum spacing between two progress events of one session.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Reported as `percent` when the planned total is not known.
pub const UNKNOWN_PERCENT: f64 = -1.0;

/// Average rate in megabits per second.
pub fn rate_mbps(bytes: u64, elapsed_secs: f64) -> f64 {
    // f64::max also maps NaN to the floor
    let secs = elapsed_secs.max(MIN_ELAPSED_SECS);
    (bytes as f64 * 8.0) / (secs * 1_000_000.0)
}

/// Completion percentage, or [`UNKNOWN_PERCENT`] without a positive total.
pub fn percent(bytes: u64, total: Option<u64>) -> f64 {
    match total {
        Some(total) if total > 0 => (bytes as f64 * 100.0) / total as f64,
        _ => UNKNOWN_PERCENT,
    }
}

fn round2<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64((value * 100.0).round() / 100.0)
}

/// Snapshot of a transfer at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSample {
    pub bytes: u64,
    #[serde(serialize_with = "round2")]
    pub seconds: f64,
    #[serde(serialize_with = "round2")]
    pub avg_mbps: f64,
    /// Rate over the bytes moved since the previous emitted sample.
    #[serde(serialize_with = "round2")]
    pub current_mbps: f64,
    #[serde(serialize_with = "round2")]
    pub percent: f64,
}

/// Final figures carried by a transfer's `done` event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSummary {
    pub total_bytes: u64,
    #[serde(serialize_with = "round2")]
    pub seconds: f64,
    #[serde(serialize_with = "round2")]
    pub avg_mbps: f64,
    #[serde(serialize_with = "round2")]
    pub percent: f64,
}

/// Mutable state of one running transfer. Owned by a single driver task.
#[derive(Debug)]
pub struct TransferState {
    bytes: u64,
    total: Option<u64>,
    started: Instant,
    last_emit: Option<Instant>,
    last_emit_bytes: u64,
    interval: Duration,
}

impl TransferState {
    pub fn new(total: Option<u64>) -> Self {
        Self {
            bytes: 0,
            total,
            started: Instant::now(),
            last_emit: None,
            last_emit_bytes: 0,
            interval: PROGRESS_INTERVAL,
        }
    }

    /// Overrides the minimum spacing between emitted samples.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn record(&mut self, n: u64) {
        self.bytes = self.bytes.saturating_add(n);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Returns a sample if the emit interval has passed since the last one.
    ///
    /// The first call always yields a sample so short transfers still report
    /// progress at least once.
    pub fn poll_progress(&mut self) -> Option<ProgressSample> {
        let now = Instant::now();
        if let Some(last) = self.last_emit {
            if now.saturating_duration_since(last) < self.interval {
                return None;
            }
        }

        let since = self.last_emit.unwrap_or(self.started);
        let window = now.saturating_duration_since(since).as_secs_f64();
        let seconds = now.saturating_duration_since(self.started).as_secs_f64();

        let sample = ProgressSample {
            bytes: self.bytes,
            seconds,
            avg_mbps: rate_mbps(self.bytes, seconds),
            current_mbps: rate_mbps(self.bytes - self.last_emit_bytes, window),
            percent: percent(self.bytes, self.total),
        };

        self.last_emit = Some(now);
        self.last_emit_bytes = self.bytes;
        Some(sample)
    }

    pub fn summary(&self) -> TransferSummary {
        let seconds = self.elapsed().as_secs_f64().max(MIN_ELAPSED_SECS);
        TransferSummary {
            total_bytes: self.bytes,
            seconds,
            avg_mbps: rate_mbps(self.bytes, seconds),
            percent: percent(self.bytes, self.total),
        }
    }
}
