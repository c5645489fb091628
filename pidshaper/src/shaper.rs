//! Per-process token bucket shaping.
//!
//! Every throttled process gets its own bucket holding at most one second of
//! credit at the configured rate. All of a process's sockets draw from the same
//! bucket, so its connections compete with each other for the allowance.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Time source for the shaper. The real clock sleeps the calling thread.
pub trait Clock: Send {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Bytes that may be sent right now, in `[0, capacity]`
    pub tokens: f64,
    pub last_refill: Instant,
}

pub struct TokenBucketShaper<C: Clock = SystemClock> {
    clock: C,
    buckets: HashMap<i32, TokenBucket>,
    warned_zero_rate: bool,
}

impl TokenBucketShaper<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl<C: Clock> TokenBucketShaper<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            buckets: HashMap::new(),
            warned_zero_rate: false,
        }
    }

    /// Charge `packet_len` bytes to `pid`'s bucket, sleeping until the bucket can
    /// pay for them. Returns how long the caller was held back.
    ///
    /// Capacity follows `rate_bytes_per_sec` on every call, so raising the rate
    /// raises the ceiling without touching credit already accrued.
    pub fn admit(&mut self, pid: i32, packet_len: usize, rate_bytes_per_sec: u64) -> Duration {
        if rate_bytes_per_sec == 0 {
            if !self.warned_zero_rate {
                log::warn!("Shaping rate is 0 B/s, forwarding throttled packets unshaped");
                self.warned_zero_rate = true;
            }
            return Duration::ZERO;
        }
        self.warned_zero_rate = false;

        let rate = rate_bytes_per_sec as f64;
        let capacity = rate;
        let len = packet_len as f64;
        let now = self.clock.now();

        let bucket = self.buckets.entry(pid).or_insert_with(|| TokenBucket {
            tokens: capacity,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= len {
            bucket.tokens -= len;
            return Duration::ZERO;
        }

        let wait_secs = (len - bucket.tokens) / rate;
        let wait = Duration::from_secs_f64(wait_secs);
        log::trace!(
            "PID {} short {:.0} bytes, holding packet for {:?}",
            pid,
            len - bucket.tokens,
            wait
        );
        self.clock.sleep(wait);

        // The wait is paid for here, so the refill point moves past it
        bucket.tokens = (bucket.tokens + wait_secs * rate - len).max(0.0);
        bucket.last_refill += wait;

        wait
    }

    #[cfg(test)]
    pub fn bucket(&self, pid: i32) -> Option<&TokenBucket> {
        self.buckets.get(&pid)
    }

    #[cfg(test)]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Forget every bucket (full stop)
    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}

impl Default for TokenBucketShaper<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}
