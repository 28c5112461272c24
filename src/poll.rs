//! Polling support for the control loops
//!
//! Dispatcher and scheduler loops block on bounded-interval store
//! polling. When the store is unavailable they back off exponentially
//! and retry; no task state is assumed until the store confirms it.

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;

/// Exponential backoff used on store unavailability
pub(crate) struct StoreBackoff {
    inner: ExponentialBackoff,
}

impl StoreBackoff {
    /// Build a backoff capped at `max_interval`
    pub fn new(max_interval: Duration) -> Self {
        Self {
            inner: ExponentialBackoff {
                initial_interval: Duration::from_millis(50),
                max_interval,
                max_elapsed_time: None,
                ..Default::default()
            },
        }
    }

    /// Forget accumulated delay after a successful store round-trip
    pub fn reset(&mut self) {
        self.inner.reset();
    }

    /// Sleep for the next backoff interval
    pub async fn sleep(&mut self) {
        let delay = self.inner.next_backoff().unwrap_or(self.inner.max_interval);
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = StoreBackoff::new(Duration::from_millis(200));
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            let next = backoff
                .inner
                .next_backoff()
                .unwrap_or(backoff.inner.max_interval);
            assert!(next <= Duration::from_millis(300)); // cap plus jitter headroom
            last = next;
        }
        assert!(last > Duration::ZERO);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = StoreBackoff::new(Duration::from_millis(200));
        for _ in 0..5 {
            let _ = backoff.inner.next_backoff();
        }
        backoff.reset();
        let first = backoff.inner.next_backoff().unwrap();
        // Back to the initial interval region after reset
        assert!(first <= Duration::from_millis(100));
    }
}
