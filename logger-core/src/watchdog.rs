//! Liveness signalling for the offload worker

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A watchdog channel fed by a worker loop
pub trait Watchdog: Send + Sync + 'static {
    fn feed(&self);
}

/// Watchdog that ignores feeds
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWatchdog;

impl Watchdog for NoWatchdog {
    fn feed(&self) {}
}

/// Records when the worker last checked in
#[derive(Debug)]
pub struct LivenessWatchdog {
    last_feed: Mutex<Instant>,
    feeds: AtomicU64,
}

impl Default for LivenessWatchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessWatchdog {
    pub fn new() -> Self {
        Self {
            last_feed: Mutex::new(Instant::now()),
            feeds: AtomicU64::new(0),
        }
    }

    /// Total number of feeds
    pub fn feed_count(&self) -> u64 {
        self.feeds.load(Ordering::Relaxed)
    }

    /// Time since the last feed
    pub fn since_last_feed(&self) -> Duration {
        self.last_feed.lock().elapsed()
    }

    /// Worker has not fed the watchdog within `threshold`
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        self.since_last_feed() > threshold
    }
}

impl Watchdog for LivenessWatchdog {
    fn feed(&self) {
        *self.last_feed.lock() = Instant::now();
        self.feeds.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_resets_stall() {
        let watchdog = LivenessWatchdog::new();
        std::thread::sleep(Duration::from_millis(20));
        assert!(watchdog.is_stalled(Duration::from_millis(10)));

        watchdog.feed();
        assert!(!watchdog.is_stalled(Duration::from_secs(5)));
        assert_eq!(watchdog.feed_count(), 1);
    }
}
