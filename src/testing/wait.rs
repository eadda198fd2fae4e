use std::time::{Duration, Instant};

use tokio::time::sleep;

const WAIT_FOR_SECS: u64 = 5; // The default time to wait in `wait_for`
const WAIT_FOR_MIN_MILLIS: u64 = 5; // The minimum time to pause before retrying
const WAIT_FOR_MAX_MILLIS: u64 = 200; // The maximum time to pause before retrying

// Wait for the condition to hold, or the duration to elapse(will panic)
pub async fn wait_for_duration<F>(mut f: F, duration: Duration)
where
    F: FnMut() -> bool,
{
    let started = Instant::now();
    let mut delay = WAIT_FOR_MIN_MILLIS;

    while !f() {
        sleep(Duration::from_millis(delay)).await;

        if started.elapsed() > duration {
            panic!("Timed out while waiting");
        }

        delay = (2 * delay).min(WAIT_FOR_MAX_MILLIS);
    }
}

// Wait for 5s
pub async fn wait_for<F>(f: F)
where
    F: FnMut() -> bool,
{
    wait_for_duration(f, Duration::from_secs(WAIT_FOR_SECS)).await
}
