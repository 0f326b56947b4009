//! Bucketed timer wheel
//!
//! Two of these run in the engine: a 100 ms wheel for handshake retries
//! and a 1 s wheel for tunnel maintenance. Items land in the bucket for
//! their deadline and are drained as the wheel advances past it; a
//! canceled item is simply ignored when it fires (the owner checks
//! whether the work is still relevant).

use std::time::{Duration, Instant};

pub struct TimerWheel<T> {
    buckets: Vec<Vec<T>>,
    resolution: Duration,
    current: usize,
    last_advance: Instant,
}

impl<T> TimerWheel<T> {
    /// Create a wheel covering `span` at `resolution` granularity
    pub fn new(resolution: Duration, span: Duration) -> Self {
        let count = (span.as_millis() / resolution.as_millis()).max(1) as usize + 2;
        let mut buckets = Vec::with_capacity(count);
        for _ in 0..count {
            buckets.push(Vec::new());
        }
        Self {
            buckets,
            resolution,
            current: 0,
            last_advance: Instant::now(),
        }
    }

    /// Schedule an item `delay` from now. Delays beyond the wheel span
    /// are clamped to the furthest bucket.
    pub fn add(&mut self, item: T, delay: Duration) {
        let ticks = (delay.as_millis() / self.resolution.as_millis()) as usize;
        let ticks = ticks.min(self.buckets.len() - 1).max(1);
        let slot = (self.current + ticks) % self.buckets.len();
        self.buckets[slot].push(item);
    }

    /// Advance to `now`, appending every expired item to `expired`
    pub fn advance(&mut self, now: Instant, expired: &mut Vec<T>) {
        let elapsed = now.saturating_duration_since(self.last_advance);
        let mut ticks = (elapsed.as_millis() / self.resolution.as_millis()) as usize;
        if ticks == 0 {
            return;
        }
        // A stall longer than one rotation still only drains each bucket once.
        if ticks > self.buckets.len() {
            ticks = self.buckets.len();
        }
        for _ in 0..ticks {
            self.current = (self.current + 1) % self.buckets.len();
            expired.append(&mut self.buckets[self.current]);
        }
        self.last_advance = now;
    }

    /// Number of scheduled items, for stats
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_items_fire_in_order() {
        let mut wheel: TimerWheel<u32> = TimerWheel::new(
            Duration::from_millis(100),
            Duration::from_secs(2),
        );
        let start = wheel.last_advance;
        wheel.add(1, Duration::from_millis(100));
        wheel.add(2, Duration::from_millis(500));

        let mut expired = Vec::new();
        wheel.advance(start + Duration::from_millis(250), &mut expired);
        assert_eq!(expired, vec![1]);

        expired.clear();
        wheel.advance(start + Duration::from_millis(700), &mut expired);
        assert_eq!(expired, vec![2]);
    }

    #[test]
    fn test_long_delay_clamped() {
        let mut wheel: TimerWheel<&str> = TimerWheel::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
        );
        let start = wheel.last_advance;
        wheel.add("late", Duration::from_secs(60));

        let mut expired = Vec::new();
        wheel.advance(start + Duration::from_secs(2), &mut expired);
        assert_eq!(expired, vec!["late"]);
    }

    #[test]
    fn test_stalled_wheel_drains_everything() {
        let mut wheel: TimerWheel<u32> = TimerWheel::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
        );
        let start = wheel.last_advance;
        for i in 0..10 {
            wheel.add(i, Duration::from_millis(100 * (i as u64 + 1)));
        }

        let mut expired = Vec::new();
        wheel.advance(start + Duration::from_secs(30), &mut expired);
        assert_eq!(expired.len(), 10);
        assert!(wheel.is_empty());
    }
}
