//! Per-provider token bucket rate limiter
//!
//! Admits at most `rps` requests per second with a burst of one second of
//! tokens. Tokens are fractional and refill continuously from the wall
//! clock; refill and consumption are serialized by a single mutex so
//! interleaved waiters observe a consistent count. Waiters sleep outside
//! the lock and re-check, so they are not FIFO-ordered - fairness is the
//! scheduler queue's job, not the limiter's.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Snapshot of limiter state for diagnostics
#[derive(Debug, Clone)]
pub struct LimiterStatus {
    /// Tokens currently available (fractional)
    pub tokens: f64,
    /// Configured requests per second
    pub rps: f64,
    /// Fraction of the bucket currently spent, in [0, 1]
    pub utilization: f64,
    /// Callers currently blocked in `wait`
    pub waiting: usize,
    /// Tokens consumed over the limiter's lifetime
    pub total_consumed: u64,
    /// Number of waits that had to sleep at least once
    pub total_waited: u64,
    /// Time since the last recorded 429, if any
    pub since_last_429: Option<Duration>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    last_429: Option<Instant>,
}

/// Token bucket limiter, one per provider
pub struct RateLimiter {
    rps: f64,
    state: Mutex<BucketState>,
    waiting: AtomicUsize,
    total_consumed: AtomicU64,
    total_waited: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter admitting `rps` requests per second. The bucket
    /// starts full, so a burst of up to one second of tokens is allowed.
    pub fn new(rps: f64) -> Self {
        let rps = rps.max(0.001);
        Self {
            rps,
            state: Mutex::new(BucketState {
                tokens: rps,
                last_refill: Instant::now(),
                last_429: None,
            }),
            waiting: AtomicUsize::new(0),
            total_consumed: AtomicU64::new(0),
            total_waited: AtomicU64::new(0),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rps).min(self.rps);
        state.last_refill = now;
    }

    /// Block until a token is available, then consume it.
    ///
    /// Callers that need cancellation race this future in a `select!`;
    /// dropping it mid-wait consumes nothing.
    pub async fn wait(&self) {
        let mut slept = false;

        loop {
            let sleep_for = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    self.total_consumed.fetch_add(1, Ordering::Relaxed);
                    if slept {
                        self.total_waited.fetch_add(1, Ordering::Relaxed);
                    }
                    return;
                }

                Duration::from_secs_f64((1.0 - state.tokens) / self.rps)
            };

            if !slept {
                slept = true;
                debug!(sleep_ms = sleep_for.as_millis() as u64, "Rate limiter waiting for token");
            }

            self.waiting.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(sleep_for).await;
            self.waiting.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Consume a token if one is available right now
    pub async fn try_consume(&self) -> bool {
        let mut state = self.state.lock().await;
        self.refill(&mut state);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            self.total_consumed.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Record a 429 from the provider. A positive `retry_after` drains the
    /// bucket so no caller is admitted until it refills; the timestamp is
    /// recorded either way.
    pub async fn record_429(&self, retry_after: Option<Duration>) {
        let mut state = self.state.lock().await;
        state.last_429 = Some(Instant::now());

        if retry_after.is_some_and(|d| d > Duration::ZERO) {
            warn!(retry_after = ?retry_after, "Provider returned 429, draining token bucket");
            state.tokens = 0.0;
            state.last_refill = Instant::now();
        }
    }

    /// Configured requests per second
    pub fn rps(&self) -> f64 {
        self.rps
    }

    /// Current limiter state for diagnostics
    pub async fn status(&self) -> LimiterStatus {
        let mut state = self.state.lock().await;
        self.refill(&mut state);

        LimiterStatus {
            tokens: state.tokens,
            rps: self.rps,
            utilization: 1.0 - (state.tokens / self.rps),
            waiting: self.waiting.load(Ordering::Relaxed),
            total_consumed: self.total_consumed.load(Ordering::Relaxed),
            total_waited: self.total_waited.load(Ordering::Relaxed),
            since_last_429: state.last_429.map(|t| t.elapsed()),
        }
    }
}
