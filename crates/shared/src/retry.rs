//! Bounded exponential-backoff retry driver.
//!
//! The driver owns attempt accounting and sleeping; callers supply the
//! operation and a classifier deciding which errors are worth another
//! attempt. Sleeps go through `tokio::time::sleep`, so dropping the future
//! (task cancellation, request deadline) aborts the loop immediately.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(50);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_JITTER: Duration = Duration::from_millis(25);

/// Tuning knobs for [`run`]. Zero fields fall back to the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryConfig {
    fn normalized(self) -> Self {
        let def = Self::default();
        Self {
            max_attempts: if self.max_attempts == 0 {
                def.max_attempts
            } else {
                self.max_attempts
            },
            base_delay: if self.base_delay.is_zero() {
                def.base_delay
            } else {
                self.base_delay
            },
            max_delay: if self.max_delay.is_zero() {
                def.max_delay
            } else {
                self.max_delay
            },
            jitter: self.jitter,
        }
    }
}

/// Run `op` until it succeeds, the classifier declares the error terminal,
/// or `max_attempts` is exhausted. The last error is returned verbatim.
pub async fn run<T, E, Op, Fut, Retryable>(
    cfg: RetryConfig,
    is_retryable: Retryable,
    mut op: Op,
) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Retryable: Fn(&E) -> bool,
{
    let cfg = cfg.normalized();

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= cfg.max_attempts || !is_retryable(&err) {
                    return Err(err);
                }
                tokio::time::sleep(apply_jitter(
                    backoff_delay(cfg.base_delay, cfg.max_delay, attempt),
                    cfg.jitter,
                ))
                .await;
            }
        }
    }
}

/// Backoff for attempt n is `base * 2^(n-1)`, capped at `max`.
fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    // Shifts past 2^16 are already far beyond any sane max_delay.
    let mul = 1u32 << (attempt - 1).min(16);
    let backoff = base.saturating_mul(mul);
    if backoff > max { max } else { backoff }
}

/// Add a uniform delta from `[-jitter, +jitter]`, clamped at zero.
fn apply_jitter(delay: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return delay;
    }
    let jitter_us = jitter.as_micros() as i64;
    let delta = rand::thread_rng().gen_range(-jitter_us..=jitter_us);
    let total = delay.as_micros() as i64 + delta;
    if total <= 0 {
        Duration::ZERO
    } else {
        Duration::from_micros(total as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_cfg() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: Duration::ZERO,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(50);
        let max = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, max, 1), Duration::from_millis(50));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, max, 4), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, max, 5), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, max, 40), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let delay = Duration::from_millis(100);
        let jitter = Duration::from_millis(25);
        for _ in 0..200 {
            let jittered = apply_jitter(delay, jitter);
            assert!(jittered >= Duration::from_millis(75), "{jittered:?}");
            assert!(jittered <= Duration::from_millis(125), "{jittered:?}");
        }
    }

    #[test]
    fn jitter_clamps_at_zero() {
        let jittered = apply_jitter(Duration::from_micros(1), Duration::from_millis(25));
        assert!(jittered <= Duration::from_millis(26));
    }

    #[test]
    fn zero_config_falls_back_to_defaults() {
        let cfg = RetryConfig {
            max_attempts: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
        .normalized();
        assert_eq!(cfg.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(cfg.base_delay, DEFAULT_BASE_DELAY);
        assert_eq!(cfg.max_delay, DEFAULT_MAX_DELAY);
        // A zero jitter is a valid request, not a missing value.
        assert_eq!(cfg.jitter, Duration::ZERO);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = run(fast_cfg(), |_| true, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("transient")
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_on_terminal_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = run(
            fast_cfg(),
            |e: &&str| *e != "terminal",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("terminal")
            },
        )
        .await;
        assert_eq!(result, Err("terminal"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = run(fast_cfg(), |_| true, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("transient")
        })
        .await;
        assert_eq!(result, Err("transient"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
