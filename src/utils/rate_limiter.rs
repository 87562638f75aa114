use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep_until};

const MIN_RATE_PER_SECOND: f64 = 0.1;

/// RateLimiter enforces a minimum interval between consecutive remote calls.
/// Shared by every request path of a client, so concurrent callers queue up
/// behind each other instead of bursting.
pub struct RateLimiter {
    // Minimum spacing between two calls
    interval: Duration,

    // Earliest instant the next call may start
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(rate_per_second: f64) -> Self {
        let rate = if rate_per_second.is_finite() {
            rate_per_second.max(MIN_RATE_PER_SECOND)
        } else {
            MIN_RATE_PER_SECOND
        };

        RateLimiter {
            interval: Duration::from_secs_f64(1.0 / rate),
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until this caller's slot comes up
    pub async fn acquire(&self) {
        let slot = {
            let mut next_slot = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = (*next_slot).max(now);
            *next_slot = slot + self.interval;
            slot
        };

        sleep_until(slot).await;
    }
}
