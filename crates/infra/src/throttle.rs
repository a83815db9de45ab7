//! Global minimum spacing between outbound calls.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Enforces at least `interval` between the starts of consecutive calls,
/// independent of how many workers are issuing them.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_call: Mutex::new(None),
        }
    }

    /// A throttle that never waits.
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until the next call is allowed, then claim the slot.
    pub async fn wait(&self) {
        if self.interval.is_zero() {
            return;
        }

        // Holding the lock across the sleep queues callers in FIFO order.
        let mut last = self.last_call.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.interval;
            let now = Instant::now();
            if ready_at > now {
                debug!(
                    wait_ms = (ready_at - now).as_millis() as u64,
                    interval_ms = self.interval.as_millis() as u64,
                    "throttling outbound call"
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}
