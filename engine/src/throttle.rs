//! Resources shared by every worker: the global speed limit and the OS
//! buffer admission gate.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct Bucket {
    /// Bytes per second, 0 for unlimited
    rate: u64,
    /// Largest amount of credit that may accumulate
    burst: u64,
    /// Available credit; negative while callers are in debt
    tokens: f64,
    last: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.rate as f64).min(self.burst as f64);
    }
}

/// Token bucket shared by all workers.
///
/// Each block is paid for before it is written. A worker that overdraws the
/// bucket is told how long to wait, so the rate over any window stays within
/// one burst (one block) of the limit no matter how many workers draw on it.
#[derive(Debug)]
pub struct SpeedLimiter {
    bucket: Mutex<Bucket>,
}

impl SpeedLimiter {
    pub fn new(rate: u64, burst: u64) -> Self {
        SpeedLimiter {
            bucket: Mutex::new(Bucket {
                rate,
                burst: burst.max(1),
                tokens: 0.0,
                last: Instant::now(),
            }),
        }
    }

    /// Change the rate. Takes effect for the next block of every worker.
    pub fn set_rate(&self, rate: u64) {
        let mut bucket = lock(&self.bucket);
        let now = Instant::now();
        bucket.refill(now);
        bucket.rate = rate;
        if rate == 0 {
            bucket.tokens = 0.0;
        }
    }

    pub fn set_burst(&self, burst: u64) {
        let mut bucket = lock(&self.bucket);
        bucket.burst = burst.max(1);
        bucket.tokens = bucket.tokens.min(bucket.burst as f64);
    }

    /// Pay for `bytes` and return how long the caller must wait before
    /// using them.
    pub fn reserve(&self, bytes: u64) -> Duration {
        let mut bucket = lock(&self.bucket);
        if bucket.rate == 0 {
            return Duration::ZERO;
        }
        bucket.refill(Instant::now());
        bucket.tokens -= bytes as f64;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / bucket.rate as f64)
        }
    }
}

#[derive(Debug)]
struct GateState {
    capacity: Option<u64>,
    in_use: u64,
}

/// Counting admission gate bounding the bytes buffered by the OS across
/// workers. A block is admitted before it is written and released once it
/// has been flushed.
#[derive(Debug)]
pub struct BufferGate {
    state: Mutex<GateState>,
    freed: Condvar,
}

const GATE_POLL: Duration = Duration::from_millis(50);

impl BufferGate {
    pub fn new(capacity: Option<u64>) -> Self {
        BufferGate {
            state: Mutex::new(GateState { capacity, in_use: 0 }),
            freed: Condvar::new(),
        }
    }

    pub fn set_capacity(&self, capacity: Option<u64>) {
        lock(&self.state).capacity = capacity;
        self.freed.notify_all();
    }

    pub fn in_use(&self) -> u64 {
        lock(&self.state).in_use
    }

    /// Wait until `bytes` fit under the capacity.
    ///
    /// A block larger than the whole capacity is admitted alone. Returns
    /// `None` if `interrupted` reports true while waiting.
    pub fn acquire(&self, bytes: u64, interrupted: impl Fn() -> bool) -> Option<BufferPermit<'_>> {
        let mut state = lock(&self.state);
        loop {
            let fits = match state.capacity {
                None => true,
                Some(capacity) => state.in_use == 0 || state.in_use + bytes <= capacity,
            };
            if fits {
                state.in_use += bytes;
                return Some(BufferPermit { gate: self, bytes });
            }
            if interrupted() {
                return None;
            }
            state = self
                .freed
                .wait_timeout(state, GATE_POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn release(&self, bytes: u64) {
        let mut state = lock(&self.state);
        state.in_use = state.in_use.saturating_sub(bytes);
        drop(state);
        self.freed.notify_all();
    }
}

/// Admission of one block; released on drop.
#[derive(Debug)]
pub struct BufferPermit<'a> {
    gate: &'a BufferGate,
    bytes: u64,
}

impl Drop for BufferPermit<'_> {
    fn drop(&mut self) {
        self.gate.release(self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_unlimited_never_waits() {
        let limiter = SpeedLimiter::new(0, 1024);
        assert_eq!(limiter.reserve(10 * 1024 * 1024), Duration::ZERO);
    }

    #[test]
    fn test_reserve_accumulates_debt() {
        let limiter = SpeedLimiter::new(1000, 100);
        let first = limiter.reserve(500);
        let second = limiter.reserve(500);
        assert!(first >= Duration::from_millis(450), "first wait {:?}", first);
        assert!(second >= first + Duration::from_millis(450), "second wait {:?}", second);
    }

    #[test]
    fn test_set_rate_to_zero_lifts_the_limit() {
        let limiter = SpeedLimiter::new(10, 10);
        assert!(limiter.reserve(1000) > Duration::ZERO);
        limiter.set_rate(0);
        assert_eq!(limiter.reserve(1000), Duration::ZERO);
        assert_eq!(lock(&limiter.bucket).rate, 0);
    }

    #[test]
    fn test_gate_blocks_until_release() {
        let gate = Arc::new(BufferGate::new(Some(100)));
        let first = gate.acquire(80, || false).expect("fits");
        assert_eq!(gate.in_use(), 80);

        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let _permit = gate.acquire(50, || false).expect("admitted after release");
            })
        };
        thread::sleep(Duration::from_millis(100));
        assert!(!waiter.is_finished());
        drop(first);
        waiter.join().expect("waiter finishes");
        assert_eq!(gate.in_use(), 0);
    }

    #[test]
    fn test_gate_admits_oversized_block_alone() {
        let gate = BufferGate::new(Some(10));
        let permit = gate.acquire(64, || false).expect("admitted");
        assert_eq!(gate.in_use(), 64);
        drop(permit);
        assert_eq!(gate.in_use(), 0);
    }

    #[test]
    fn test_gate_wait_is_interruptible() {
        let gate = BufferGate::new(Some(10));
        let _held = gate.acquire(10, || false).expect("fits");
        let canceled = AtomicBool::new(false);
        canceled.store(true, Ordering::SeqCst);
        assert!(gate.acquire(5, || canceled.load(Ordering::SeqCst)).is_none());
    }
}
