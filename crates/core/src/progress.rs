//! Progress accounting
//!
//! Percentages are clamped to 99 until an operation is confirmed complete and
//! never move backwards. [`ProgressThrottle`] limits how often updates are
//! published.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Highest percentage reported before completion is confirmed
pub const MAX_IN_FLIGHT_PERCENT: u8 = 99;

/// Percentage of `done` over `total`, clamped to `[0, 99]`
///
/// A zero total yields 0; zero-byte transfers jump straight to 100 on completion.
pub fn in_flight_percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (done.min(total) as u128 * 100 / total as u128) as u8;
    pct.min(MAX_IN_FLIGHT_PERCENT)
}

/// One progress update of a single object transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub transferred: u64,
    pub total: u64,
    pub percent: u8,
}

impl TransferProgress {
    pub fn in_flight(transferred: u64, total: u64) -> Self {
        Self {
            transferred: transferred.min(total),
            total,
            percent: in_flight_percent(transferred, total),
        }
    }

    pub fn complete(total: u64) -> Self {
        Self {
            transferred: total,
            total,
            percent: 100,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.percent == 100
    }
}

/// Combined counters for a directory operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateProgress {
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub total_files: usize,
    pub completed_files: usize,
    pub failed_files: usize,
}

impl AggregateProgress {
    pub fn new(total_files: usize, total_bytes: u64) -> Self {
        Self {
            total_bytes,
            total_files,
            ..Default::default()
        }
    }

    /// Snapshot including the bytes of the file currently in flight
    pub fn with_current(&self, current_bytes: u64) -> Self {
        Self {
            transferred_bytes: (self.transferred_bytes + current_bytes).min(self.total_bytes),
            ..*self
        }
    }

    /// Record a finished file of `size` scanned bytes
    pub fn complete_file(&mut self, size: u64) {
        self.completed_files += 1;
        self.transferred_bytes = (self.transferred_bytes + size).min(self.total_bytes);
    }

    pub fn fail_file(&mut self) {
        self.failed_files += 1;
    }

    /// Percentage by bytes, falling back to file counts for byte-less trees
    pub fn percent(&self) -> u8 {
        if self.total_bytes > 0 {
            in_flight_percent(self.transferred_bytes, self.total_bytes)
        } else {
            in_flight_percent(self.completed_files as u64, self.total_files as u64)
        }
    }
}

/// Decides whether a progress update is worth publishing
///
/// An update passes when the percentage increased or when `interval` elapsed
/// since the last published update. Percentages never go backwards.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    started: Instant,
    last_emit: Option<Instant>,
    last_percent: u8,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            started: Instant::now(),
            last_emit: None,
            last_percent: 0,
        }
    }

    /// Returns the percentage to publish, or `None` to stay quiet
    pub fn admit(&mut self, percent: u8) -> Option<u8> {
        let now = Instant::now();
        let percent = percent.max(self.last_percent);
        let due = match self.last_emit {
            None => true,
            Some(last) => percent > self.last_percent || now.duration_since(last) >= self.interval,
        };
        if !due {
            return None;
        }
        self.last_emit = Some(now);
        self.last_percent = percent;
        Some(percent)
    }

    pub fn last_percent(&self) -> u8 {
        self.last_percent
    }

    /// Average throughput since the throttle was created
    pub fn throughput(&self, bytes: u64) -> u64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0;
        }
        (bytes as f64 / elapsed) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_percent_clamped() {
        assert_eq!(in_flight_percent(0, 100), 0);
        assert_eq!(in_flight_percent(50, 100), 50);
        assert_eq!(in_flight_percent(100, 100), 99);
        assert_eq!(in_flight_percent(150, 100), 99);
        assert_eq!(in_flight_percent(10, 0), 0);
    }

    #[test]
    fn test_in_flight_percent_large_values() {
        // Divisible by 200 so half is exactly 50%
        let total = u64::MAX / 200 * 200;
        assert_eq!(in_flight_percent(total / 2, total), 50);
        assert_eq!(in_flight_percent(total / 2 - 1, total), 49);
    }

    #[test]
    fn test_transfer_progress_completion() {
        let p = TransferProgress::in_flight(1024, 1024);
        assert_eq!(p.percent, 99);
        assert!(!p.is_complete());

        let done = TransferProgress::complete(1024);
        assert_eq!(done.percent, 100);
        assert_eq!(done.transferred, 1024);
    }

    #[test]
    fn test_aggregate_counts() {
        let mut agg = AggregateProgress::new(3, 300);
        agg.complete_file(100);
        assert_eq!(agg.with_current(50).transferred_bytes, 150);
        assert_eq!(agg.with_current(50).percent(), 50);

        agg.complete_file(100);
        agg.complete_file(100);
        assert_eq!(agg.completed_files, 3);
        assert_eq!(agg.transferred_bytes, agg.total_bytes);
        // Never reports 100 on its own
        assert_eq!(agg.percent(), 99);
    }

    #[test]
    fn test_aggregate_never_exceeds_total() {
        let mut agg = AggregateProgress::new(1, 10);
        agg.complete_file(25);
        assert_eq!(agg.transferred_bytes, 10);
        assert_eq!(agg.with_current(5).transferred_bytes, 10);
    }

    #[test]
    fn test_aggregate_byte_less_tree_uses_file_counts() {
        let mut agg = AggregateProgress::new(4, 0);
        agg.complete_file(0);
        agg.complete_file(0);
        assert_eq!(agg.percent(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_on_percentage_and_time() {
        let mut throttle = ProgressThrottle::new(Duration::from_millis(200));

        assert_eq!(throttle.admit(0), Some(0));
        // Same percentage, too soon
        assert_eq!(throttle.admit(0), None);
        // Percentage moved
        assert_eq!(throttle.admit(5), Some(5));

        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(throttle.admit(5), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_is_monotonic() {
        let mut throttle = ProgressThrottle::new(Duration::from_millis(200));
        assert_eq!(throttle.admit(40), Some(40));
        assert_eq!(throttle.admit(10), None);

        tokio::time::advance(Duration::from_millis(300)).await;
        // A regression is published as the previous high-water mark
        assert_eq!(throttle.admit(10), Some(40));
    }
}
