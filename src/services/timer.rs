//! Recurring timer with skew, deferral, and failure backoff.
//!
//! One timer drives each periodic subsystem: the registration check, every
//! configuration module, and the usher pipeline. Fires happen on a base
//! frequency plus a uniform skew re-rolled after each tick; handler failures
//! switch the timer onto an exponential retry schedule until the next
//! success.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Non-success outcomes of a timer handler.
#[derive(Debug)]
pub enum TimerError {
    /// Override the next fire interval without counting a failure
    /// (server-driven throttling lands here).
    Deferred(Duration),
    /// Handler failed; the timer applies exponential backoff.
    Failed(anyhow::Error),
}

impl From<anyhow::Error> for TimerError {
    fn from(err: anyhow::Error) -> Self {
        TimerError::Failed(err)
    }
}

/// Timer cadence settings.
#[derive(Debug, Clone, Copy)]
pub struct TimerConfig {
    /// Base period between fires.
    pub frequency: Duration,
    /// Total skew band; each fire draws uniformly from
    /// `[-skew/2, +skew/2]`.
    pub skew: Duration,
    /// First retry period after a failure.
    pub retry_frequency: Duration,
    /// Cap on the retry period.
    pub max_retry_frequency: Duration,
}

impl TimerConfig {
    pub fn new(frequency: Duration) -> Self {
        Self {
            frequency,
            skew: Duration::ZERO,
            retry_frequency: frequency,
            max_retry_frequency: frequency,
        }
    }

    pub fn with_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    pub fn with_retry(mut self, retry: Duration, max_retry: Duration) -> Self {
        self.retry_frequency = retry;
        self.max_retry_frequency = max_retry;
        self
    }
}

struct TimerShared {
    name: String,
    frequency: Mutex<Duration>,
    skew: Duration,
    retry_frequency: Duration,
    max_retry_frequency: Duration,
    consecutive_failures: AtomicU32,
    cancelled: AtomicBool,
    /// One-shot override for the next fire, set by `reset` or a deferral.
    next_override: Mutex<Option<Duration>>,
    wake: Notify,
}

/// Retry delay after `failures` consecutive failures:
/// `min(retry * 2^(failures-1), max_retry)`.
pub fn backoff_delay(failures: u32, retry: Duration, max_retry: Duration) -> Duration {
    if failures == 0 {
        return retry;
    }
    let factor = 2u32.saturating_pow(failures - 1);
    retry.saturating_mul(factor).min(max_retry)
}

/// Uniform draw from `[-skew/2, +skew/2]`, applied to `base` and clamped at
/// zero.
pub fn apply_skew(base: Duration, skew: Duration) -> Duration {
    let half = (skew.as_millis() / 2) as i128;
    if half == 0 {
        return base;
    }
    let roll: i128 = rand::thread_rng().gen_range(-half..=half);
    let millis = base.as_millis() as i128 + roll;
    Duration::from_millis(millis.max(0) as u64)
}

/// A cancellable periodic task.
///
/// The handler runs on every fire; its result drives the next interval. Both
/// `reset` and `cancel` are race-free against an imminent fire.
pub struct RecurringTimer {
    shared: Arc<TimerShared>,
    handle: Option<JoinHandle<()>>,
}

impl RecurringTimer {
    /// Spawn the timer task. The first fire happens one interval from now;
    /// call `reset(Duration::ZERO)` to fire immediately.
    pub fn spawn<F, Fut>(name: impl Into<String>, config: TimerConfig, mut handler: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TimerError>> + Send,
    {
        let shared = Arc::new(TimerShared {
            name: name.into(),
            frequency: Mutex::new(config.frequency),
            skew: config.skew,
            retry_frequency: config.retry_frequency,
            max_retry_frequency: config.max_retry_frequency,
            consecutive_failures: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            next_override: Mutex::new(None),
            wake: Notify::new(),
        });

        let task_shared = Arc::clone(&shared);
        let handle = tokio::spawn(async move {
            loop {
                let delay = task_shared.next_delay().await;
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = task_shared.wake.notified() => {
                        // Woken for a reset or cancel; recompute the delay.
                        if task_shared.cancelled.load(Ordering::SeqCst) {
                            break;
                        }
                        continue;
                    }
                }
                if task_shared.cancelled.load(Ordering::SeqCst) {
                    break;
                }

                match handler().await {
                    Ok(()) => {
                        task_shared.consecutive_failures.store(0, Ordering::SeqCst);
                    }
                    Err(TimerError::Deferred(next)) => {
                        debug!(timer = %task_shared.name, ?next, "handler deferred next fire");
                        *task_shared.next_override.lock().await = Some(next);
                    }
                    Err(TimerError::Failed(err)) => {
                        let failures = task_shared
                            .consecutive_failures
                            .fetch_add(1, Ordering::SeqCst)
                            + 1;
                        error!(
                            timer = %task_shared.name,
                            failures,
                            error = %err,
                            "timer handler failed, backing off"
                        );
                    }
                }
            }
            debug!(timer = %task_shared.name, "timer finished");
        });

        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Force the next fire to happen after `delay`, replacing whatever was
    /// scheduled.
    pub async fn reset(&self, delay: Duration) {
        *self.shared.next_override.lock().await = Some(delay);
        self.shared.wake.notify_one();
    }

    /// Change the base frequency for subsequent fires.
    pub async fn set_frequency(&self, frequency: Duration) {
        *self.shared.frequency.lock().await = frequency;
    }

    /// Stop the timer. Safe to call repeatedly and from any task.
    pub fn cancel(&self) {
        if !self.shared.cancelled.swap(true, Ordering::SeqCst) {
            self.shared.wake.notify_one();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.shared.consecutive_failures.load(Ordering::SeqCst)
    }
}

impl Drop for RecurringTimer {
    fn drop(&mut self) {
        self.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl TimerShared {
    async fn next_delay(&self) -> Duration {
        if let Some(overridden) = self.next_override.lock().await.take() {
            return overridden;
        }
        let failures = self.consecutive_failures.load(Ordering::SeqCst);
        if failures > 0 {
            let delay = backoff_delay(failures, self.retry_frequency, self.max_retry_frequency);
            warn!(timer = %self.name, failures, ?delay, "retrying after failure");
            return delay;
        }
        let base = *self.frequency.lock().await;
        apply_skew(base, self.skew)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let retry = Duration::from_secs(30);
        let max = Duration::from_secs(3600);

        assert_eq!(backoff_delay(1, retry, max), Duration::from_secs(30));
        assert_eq!(backoff_delay(2, retry, max), Duration::from_secs(60));
        assert_eq!(backoff_delay(3, retry, max), Duration::from_secs(120));
        assert_eq!(backoff_delay(8, retry, max), Duration::from_secs(3600));
        assert_eq!(backoff_delay(30, retry, max), Duration::from_secs(3600));
    }

    #[test]
    fn test_zero_skew_is_exactly_periodic() {
        let base = Duration::from_secs(60);
        for _ in 0..100 {
            assert_eq!(apply_skew(base, Duration::ZERO), base);
        }
    }

    #[test]
    fn test_skew_stays_in_band() {
        let base = Duration::from_secs(600);
        let skew = Duration::from_secs(120);
        for _ in 0..1000 {
            let skewed = apply_skew(base, skew);
            assert!(skewed >= Duration::from_secs(540));
            assert!(skewed <= Duration::from_secs(660));
        }
    }

    #[tokio::test]
    async fn test_timer_fires_and_resets() {
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);

        let timer = RecurringTimer::spawn(
            "test",
            TimerConfig::new(Duration::from_secs(3600)),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        // An hour-scale timer fires now when reset to zero.
        timer.reset(Duration::ZERO).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        timer.cancel();
    }

    #[tokio::test]
    async fn test_failures_drive_backoff_counter() {
        let timer = RecurringTimer::spawn(
            "failing",
            TimerConfig::new(Duration::from_secs(3600))
                .with_retry(Duration::from_secs(3600), Duration::from_secs(3600)),
            move || async move { Err(TimerError::Failed(anyhow::anyhow!("boom"))) },
        );

        timer.reset(Duration::ZERO).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(timer.consecutive_failures(), 1);

        timer.cancel();
    }

    #[tokio::test]
    async fn test_deferred_overrides_without_failure() {
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);

        let timer = RecurringTimer::spawn(
            "deferred",
            TimerConfig::new(Duration::from_secs(3600)),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        Err(TimerError::Deferred(Duration::from_millis(20)))
                    } else {
                        Ok(())
                    }
                }
            },
        );

        timer.reset(Duration::ZERO).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        // Second fire came from the deferral, not the hour-long frequency.
        assert!(fired.load(Ordering::SeqCst) >= 2);
        assert_eq!(timer.consecutive_failures(), 0);

        timer.cancel();
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let timer = RecurringTimer::spawn(
            "cancelled",
            TimerConfig::new(Duration::from_secs(3600)),
            move || async move { Ok(()) },
        );
        timer.cancel();
        timer.cancel();
        assert!(timer.is_cancelled());
    }

    proptest! {
        #[test]
        fn prop_skew_bounds(base_secs in 1u64..10_000, skew_secs in 0u64..5_000) {
            let base = Duration::from_secs(base_secs);
            let skew = Duration::from_secs(skew_secs);
            let skewed = apply_skew(base, skew);
            let half = Duration::from_millis(skew.as_millis() as u64 / 2);
            prop_assert!(skewed + half >= base);
            prop_assert!(skewed <= base + half);
        }

        #[test]
        fn prop_backoff_never_exceeds_cap(failures in 1u32..64, retry_secs in 1u64..600) {
            let retry = Duration::from_secs(retry_secs);
            let max = Duration::from_secs(3600);
            let delay = backoff_delay(failures, retry, max);
            prop_assert!(delay <= max);
            prop_assert!(delay >= retry.min(max));
        }
    }
}
