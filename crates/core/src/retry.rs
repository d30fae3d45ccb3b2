//! Retry with Fibonacci backoff and jittered sleep.
//!
//! Retryable failures use Fibonacci backoff with up to 5 attempts and a
//! small random jitter (1-4x 20ms) to stagger contending commits. The RNG
//! used for sleep jitter is a dependency so tests can make it
//! deterministic — [`JitterSource`] is that dependency seam.

use crate::error::SopError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Base unit for jitter: a contending commit sleeps `1..=4` of these.
const JITTER_UNIT_MS: u64 = 20;

/// Supplies the random jitter added to each backoff sleep.
///
/// Swappable so tests can replace randomness with a fixed sequence and
/// assert exact sleep durations / retry counts.
pub trait JitterSource: Send + Sync {
    /// Returns a jitter multiplier in `1..=4`.
    fn next_multiplier(&self) -> u64;
}

/// Default jitter source: draws a uniform multiplier in `1..=4` from
/// [`rand`]'s thread-local RNG.
#[derive(Debug, Default)]
pub struct DefaultJitter;

impl JitterSource for DefaultJitter {
    fn next_multiplier(&self) -> u64 {
        rand::Rng::gen_range(&mut rand::thread_rng(), 1..=4)
    }
}

/// A fixed, cyclic sequence of jitter multipliers, for deterministic tests.
#[derive(Debug)]
pub struct FixedJitter {
    sequence: Vec<u64>,
    next: AtomicUsize,
}

impl FixedJitter {
    /// Build a jitter source that cycles through `sequence` forever.
    ///
    /// # Panics
    /// Panics if `sequence` is empty.
    pub fn new(sequence: Vec<u64>) -> Self {
        assert!(!sequence.is_empty(), "FixedJitter sequence must be non-empty");
        Self {
            sequence,
            next: AtomicUsize::new(0),
        }
    }
}

impl JitterSource for FixedJitter {
    fn next_multiplier(&self) -> u64 {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.sequence.len();
        self.sequence[idx]
    }
}

/// Fibonacci sequence starting `1, 1, 2, 3, 5, ...`, used as the base delay
/// (in units of [`JITTER_UNIT_MS`]) for retry attempt `n` (0-indexed).
fn fibonacci(n: usize) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 0..n {
        let next = a + b;
        a = b;
        b = next;
    }
    a
}

/// Retry policy: bounded attempts, Fibonacci backoff, jittered sleep.
///
/// Used by every backend crate's fallible operation (Blob Store, Registry,
/// L2 cache) to retry `SopError::BackendTransient` failures, and by the
/// transaction core's commit-conflict retry loop.
pub struct RetryPolicy {
    max_attempts: usize,
    jitter: Box<dyn JitterSource>,
}

impl RetryPolicy {
    /// Build a retry policy with a default of 5 attempts and
    /// [`DefaultJitter`].
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            jitter: Box::new(DefaultJitter),
        }
    }

    /// Build a retry policy with an explicit jitter source, for deterministic
    /// tests.
    pub fn with_jitter(max_attempts: usize, jitter: Box<dyn JitterSource>) -> Self {
        Self {
            max_attempts,
            jitter,
        }
    }

    /// Maximum number of attempts this policy allows.
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Delay before retry attempt `n` (0-indexed, the attempt that already
    /// failed), including jitter.
    pub fn delay(&self, attempt: usize) -> Duration {
        let base_ms = fibonacci(attempt) * JITTER_UNIT_MS;
        let jittered_ms = base_ms + self.jitter.next_multiplier() * JITTER_UNIT_MS;
        Duration::from_millis(jittered_ms)
    }

    /// Run `op`, retrying on `SopError::is_retryable` errors up to
    /// `max_attempts` total tries, sleeping [`RetryPolicy::delay`] between
    /// attempts. Non-retryable errors and the final retryable failure are
    /// returned immediately.
    pub fn run<T>(&self, op: impl FnMut() -> Result<T, SopError>) -> Result<T, SopError> {
        self.run_with_on_retry(op, || {})
    }

    /// As [`RetryPolicy::run`], also calling `on_retry` once per re-attempt,
    /// right before the backoff sleep. Callers that want to observe how many
    /// times an operation was retried (e.g. to feed a metrics counter) hook
    /// in here instead of wrapping `run` themselves.
    pub fn run_with_on_retry<T>(
        &self,
        mut op: impl FnMut() -> Result<T, SopError>,
        mut on_retry: impl FnMut(),
    ) -> Result<T, SopError> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt + 1 < self.max_attempts => {
                    on_retry();
                    std::thread::sleep(self.delay(attempt));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    /// 5 attempts.
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn fibonacci_sequence_matches_expected() {
        assert_eq!(fibonacci(0), 1);
        assert_eq!(fibonacci(1), 1);
        assert_eq!(fibonacci(2), 2);
        assert_eq!(fibonacci(3), 3);
        assert_eq!(fibonacci(4), 5);
        assert_eq!(fibonacci(5), 8);
    }

    #[test]
    fn fixed_jitter_cycles() {
        let j = FixedJitter::new(vec![1, 2, 3]);
        assert_eq!(j.next_multiplier(), 1);
        assert_eq!(j.next_multiplier(), 2);
        assert_eq!(j.next_multiplier(), 3);
        assert_eq!(j.next_multiplier(), 1);
    }

    #[test]
    fn retry_succeeds_after_transient_failures() {
        let policy = RetryPolicy::with_jitter(5, Box::new(FixedJitter::new(vec![1])));
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);
        let result = policy.run(move || {
            let n = attempts_clone.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(SopError::BackendTransient("blip".into()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retry_gives_up_after_max_attempts() {
        let policy = RetryPolicy::with_jitter(3, Box::new(FixedJitter::new(vec![1])));
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);
        let result: Result<(), SopError> = policy.run(move || {
            attempts_clone.fetch_add(1, Ordering::SeqCst);
            Err(SopError::BackendTransient("down".into()))
        });
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn run_with_on_retry_calls_hook_once_per_reattempt() {
        let policy = RetryPolicy::with_jitter(5, Box::new(FixedJitter::new(vec![1])));
        let attempts = Arc::new(AtomicU32::new(0));
        let hook_calls = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);
        let hook_clone = Arc::clone(&hook_calls);
        let result = policy.run_with_on_retry(
            move || {
                let n = attempts_clone.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(SopError::BackendTransient("blip".into()))
                } else {
                    Ok(())
                }
            },
            move || {
                hook_clone.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert!(result.is_ok());
        assert_eq!(hook_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn retry_does_not_retry_permanent_errors() {
        let policy = RetryPolicy::with_jitter(5, Box::new(FixedJitter::new(vec![1])));
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);
        let result: Result<(), SopError> = policy.run(move || {
            attempts_clone.fetch_add(1, Ordering::SeqCst);
            Err(SopError::BackendPermanent("no space left on device".into()))
        });
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
