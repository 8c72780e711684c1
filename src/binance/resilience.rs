// =============================================================================
// Resilience Chain — rate limiter, retry with backoff, circuit breaker
// =============================================================================
//
// Every brokerage call is wrapped, outermost first: metric timer -> rate
// limiter (token bucket) -> retry (bounded attempts, exponential backoff) ->
// circuit breaker. The breaker is a three-state machine:
//
//   Closed --(failure rate >= trip threshold over the window)--> Open
//   Open --(open_duration elapsed)--> HalfOpen
//   HalfOpen --(k consecutive successes)--> Closed
//   HalfOpen --(any failure)--> Open
//
// A 429-class response is treated as both a rate-limit signal and a retry
// cause; a tripped breaker fails fast with `BrokerErrorKind::CircuitOpen`
// rather than attempting the call at all.
// =============================================================================

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::binance::broker::{BrokerError, BrokerErrorKind};

// ---------------------------------------------------------------------------
// Token-bucket rate limiter
// ---------------------------------------------------------------------------

/// Token-bucket limiter, default 200 requests/minute. Refills continuously
/// rather than in discrete ticks so bursts drain smoothly.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: Mutex<f64>,
    last_refill: Mutex<Instant>,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_min: u32) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec: refill_per_min as f64 / 60.0,
            tokens: Mutex::new(capacity as f64),
            last_refill: Mutex::new(Instant::now()),
        }
    }

    fn refill(&self) {
        let mut last = self.last_refill.lock();
        let elapsed = last.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let mut tokens = self.tokens.lock();
        *tokens = (*tokens + elapsed * self.refill_per_sec).min(self.capacity);
        *last = Instant::now();
    }

    fn try_take(&self) -> bool {
        let mut tokens = self.tokens.lock();
        if *tokens >= 1.0 {
            *tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Block (asynchronously) until a token is available or `timeout`
    /// elapses, whichever comes first.
    pub async fn acquire(&self, timeout: Duration) -> Result<(), BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.refill();
            if self.try_take() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!("rate limiter timed out waiting for a free token");
                return Err(BrokerError::new(
                    BrokerErrorKind::RateLimited,
                    "rate limiter timeout — no token available",
                ));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Sliding-window failure-rate circuit breaker.
pub struct CircuitBreaker {
    state: AtomicU8,
    window: Mutex<VecDeque<bool>>,
    window_size: usize,
    trip_threshold: f64,
    opened_at: Mutex<Option<Instant>>,
    open_duration: Duration,
    half_open_successes: AtomicU32,
    half_open_required: u32,
}

impl CircuitBreaker {
    pub fn new(window_size: usize, trip_threshold: f64, open_duration: Duration, half_open_required: u32) -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            window: Mutex::new(VecDeque::with_capacity(window_size)),
            window_size,
            trip_threshold,
            opened_at: Mutex::new(None),
            open_duration,
            half_open_successes: AtomicU32::new(0),
            half_open_required,
        }
    }

    /// Whether a call is currently permitted. `Open` transitions itself to
    /// `HalfOpen` once `open_duration` has elapsed, admitting a probe.
    pub fn allow_request(&self) -> bool {
        match self.state.load(Ordering::SeqCst) {
            STATE_CLOSED | STATE_HALF_OPEN => true,
            _ => {
                let elapsed = self
                    .opened_at
                    .lock()
                    .map(|t| t.elapsed())
                    .unwrap_or_default();
                if elapsed >= self.open_duration
                    && self
                        .state
                        .compare_exchange(STATE_OPEN, STATE_HALF_OPEN, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                {
                    self.half_open_successes.store(0, Ordering::SeqCst);
                    info!("circuit breaker entering half-open probe state");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        match self.state.load(Ordering::SeqCst) {
            STATE_HALF_OPEN => {
                let successes = self.half_open_successes.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.half_open_required
                    && self
                        .state
                        .compare_exchange(STATE_HALF_OPEN, STATE_CLOSED, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                {
                    self.window.lock().clear();
                    info!("circuit breaker closed after successful half-open probes");
                }
            }
            _ => self.push_outcome(true),
        }
    }

    pub fn record_failure(&self) {
        match self.state.load(Ordering::SeqCst) {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    *self.opened_at.lock() = Some(Instant::now());
                    warn!("circuit breaker re-opened — half-open probe failed");
                }
            }
            _ => self.push_outcome(false),
        }
    }

    fn push_outcome(&self, success: bool) {
        let failure_rate = {
            let mut window = self.window.lock();
            if window.len() >= self.window_size {
                window.pop_front();
            }
            window.push_back(success);
            let failures = window.iter().filter(|s| !**s).count() as f64;
            if window.len() < self.window_size {
                None
            } else {
                Some(failures / window.len() as f64)
            }
        };

        if let Some(rate) = failure_rate {
            if rate >= self.trip_threshold
                && self
                    .state
                    .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                *self.opened_at.lock() = Some(Instant::now());
                warn!(failure_rate = rate, threshold = self.trip_threshold, "circuit breaker tripped open");
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_OPEN
    }
}

// ---------------------------------------------------------------------------
// Retry with exponential backoff
// ---------------------------------------------------------------------------

/// Retry `op` up to `attempts` times with exponential backoff starting at
/// `base_delay`. Stops early on a non-retryable error kind.
pub async fn retry_with_backoff<F, Fut, T>(
    attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    let mut last_err: Option<BrokerError> = None;
    for attempt in 0..attempts.max(1) {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                let retryable = e.kind.is_retryable();
                debug!(attempt, retryable, kind = ?e.kind, "brokerage call attempt failed");
                if !retryable {
                    return Err(e);
                }
                last_err = Some(e);
                if attempt + 1 < attempts {
                    let backoff = base_delay * 2u32.saturating_pow(attempt);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| BrokerError::new(BrokerErrorKind::TransientNetwork, "retry exhausted")))
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

/// Composes the rate limiter, retry policy, and circuit breaker into a single
/// wrapper any brokerage operation can be routed through.
pub struct ResilienceChain {
    pub rate_limiter: TokenBucket,
    pub breaker: CircuitBreaker,
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub rate_limit_timeout: Duration,
}

impl ResilienceChain {
    /// Defaults: 200 req/min token bucket, 5 s acquire timeout, 3 retry
    /// attempts at 500 ms base exponential backoff, a 10-call sliding window
    /// tripping at 50% failures, 60 s open duration, 3 half-open probes.
    pub fn new() -> Self {
        Self {
            rate_limiter: TokenBucket::new(200, 200),
            breaker: CircuitBreaker::new(10, 0.5, Duration::from_secs(60), 3),
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            rate_limit_timeout: Duration::from_secs(5),
        }
    }

    /// Run `op` (an async closure producing a fresh future on each retry)
    /// through the full chain: rate limiter, retry, circuit breaker.
    pub async fn call<F, Fut, T>(&self, metric_name: &str, mut op: F) -> Result<T, BrokerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let started = Instant::now();

        if !self.breaker.allow_request() {
            warn!(metric_name, "circuit breaker open — failing fast");
            return Err(BrokerError::new(BrokerErrorKind::CircuitOpen, "circuit breaker is open"));
        }

        self.rate_limiter.acquire(self.rate_limit_timeout).await?;

        let result = retry_with_backoff(self.retry_attempts, self.retry_base_delay, &mut op).await;

        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(e) if e.kind.is_retryable() => self.breaker.record_failure(),
            Err(_) => {}
        }

        debug!(
            metric_name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "brokerage call completed"
        );

        result
    }
}

impl Default for ResilienceChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_breaker_trips_at_threshold() {
        let breaker = CircuitBreaker::new(4, 0.5, Duration::from_millis(50), 2);
        assert!(breaker.allow_request());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert!(breaker.is_open());
    }

    #[test]
    fn circuit_breaker_half_open_recovers_on_k_successes() {
        let breaker = CircuitBreaker::new(2, 0.5, Duration::from_millis(10), 2);
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_open());
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.allow_request());
        breaker.record_success();
        breaker.record_success();
        assert!(!breaker.is_open());
    }

    #[tokio::test]
    async fn retry_stops_on_non_retryable_error() {
        let mut calls = 0;
        let result: Result<(), BrokerError> = retry_with_backoff(3, Duration::from_millis(1), || {
            calls += 1;
            async { Err(BrokerError::new(BrokerErrorKind::VenueReject, "rejected")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn retry_exhausts_attempts_on_transient_errors() {
        let mut calls = 0;
        let result: Result<(), BrokerError> = retry_with_backoff(3, Duration::from_millis(1), || {
            calls += 1;
            async { Err(BrokerError::new(BrokerErrorKind::TransientNetwork, "timeout")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }
}
