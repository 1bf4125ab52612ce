//! Recurring timer behavior: backoff schedule, recovery, deferral.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use acme_agent::services::timer::{backoff_delay, RecurringTimer, TimerConfig, TimerError};

#[test]
fn test_registration_backoff_schedule() {
    // Three consecutive failures with retry=30s, max=1h fire at +30s, +60s,
    // +120s after each failure.
    let retry = Duration::from_secs(30);
    let max = Duration::from_secs(3600);
    assert_eq!(backoff_delay(1, retry, max), Duration::from_secs(30));
    assert_eq!(backoff_delay(2, retry, max), Duration::from_secs(60));
    assert_eq!(backoff_delay(3, retry, max), Duration::from_secs(120));
    // Far along, the cap holds.
    assert_eq!(backoff_delay(20, retry, max), max);
}

#[tokio::test]
async fn test_timer_recovers_after_failures() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);

    let timer = RecurringTimer::spawn(
        "flaky",
        TimerConfig::new(Duration::from_secs(3600))
            .with_retry(Duration::from_millis(30), Duration::from_millis(120)),
        move || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(TimerError::Failed(anyhow::anyhow!("transient")))
                } else {
                    Ok(())
                }
            }
        },
    );

    timer.reset(Duration::ZERO).await;
    // Two failures ride the retry schedule, then the third attempt succeeds
    // and clears the failure count.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(attempts.load(Ordering::SeqCst) >= 3);
    assert_eq!(timer.consecutive_failures(), 0);

    timer.cancel();
}

#[tokio::test]
async fn test_reset_preempts_long_interval() {
    let fired = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&fired);

    let timer = RecurringTimer::spawn(
        "slow",
        TimerConfig::new(Duration::from_secs(86_400)),
        move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        },
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    timer.reset(Duration::from_millis(10)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    timer.cancel();
    assert!(timer.is_cancelled());
}
