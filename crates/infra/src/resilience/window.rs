use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Bucket {
    index: u64,
    successes: u32,
    failures: u32,
}

/// Success/failure counts over the last `buckets × width` of time.
///
/// Buckets are addressed by their ordinal since `origin`; anything older than the window is
/// evicted on access.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    origin: Instant,
    width: Duration,
    capacity: u64,
    buckets: VecDeque<Bucket>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowTotals {
    pub successes: u32,
    pub failures: u32,
}

impl WindowTotals {
    pub fn samples(&self) -> u32 {
        self.successes + self.failures
    }

    /// Failure share in percent; 0 when empty.
    pub fn failure_percentage(&self) -> f64 {
        match self.samples() {
            0 => 0.0,
            n => f64::from(self.failures) * 100.0 / f64::from(n),
        }
    }
}

impl RollingWindow {
    pub fn new(window: Duration, buckets: u32) -> Self {
        let buckets = buckets.max(1);
        let width = (window / buckets).max(Duration::from_millis(1));
        Self {
            origin: Instant::now(),
            width,
            capacity: u64::from(buckets),
            buckets: VecDeque::with_capacity(buckets as usize),
        }
    }

    fn index_at(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin).as_nanos();
        u64::try_from(elapsed / self.width.as_nanos()).unwrap_or(u64::MAX)
    }

    fn evict(&mut self, current: u64) {
        while let Some(front) = self.buckets.front() {
            if front.index + self.capacity <= current {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn record(&mut self, now: Instant, success: bool) {
        let index = self.index_at(now);
        self.evict(index);
        if self.buckets.back().is_none_or(|b| b.index != index) {
            self.buckets.push_back(Bucket {
                index,
                ..Default::default()
            });
        }
        if let Some(bucket) = self.buckets.back_mut() {
            if success {
                bucket.successes += 1;
            } else {
                bucket.failures += 1;
            }
        }
    }

    pub fn totals(&mut self, now: Instant) -> WindowTotals {
        self.evict(self.index_at(now));
        self.buckets.iter().fold(WindowTotals::default(), |acc, b| WindowTotals {
            successes: acc.successes + b.successes,
            failures: acc.failures + b.failures,
        })
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}
