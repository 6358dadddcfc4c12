//! Exponential backoff for readiness polling.

use std::future::Future;
use std::time::{Duration, Instant};

/// Exponential backoff with configurable min/max.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    max: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    /// Creates a new backoff starting at `initial`, capping at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            max,
            current: initial,
        }
    }

    /// Returns the current backoff duration.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Advances to the next backoff interval (doubles, capped at max).
    pub fn next(&mut self) {
        self.current = (self.current * 2).min(self.max);
    }

    /// Calls `check` until it returns true or `deadline` passes, sleeping
    /// between calls. Returns whether the check ever succeeded.
    ///
    /// The last sleep is clipped so the final check happens at the deadline.
    pub async fn poll_until<F, Fut>(&mut self, deadline: Instant, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        loop {
            if check().await {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let wait = self.current.min(deadline - now);
            tokio::time::sleep(wait).await;
            self.next();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(300));
        assert_eq!(backoff.current(), Duration::from_millis(100));
        backoff.next();
        assert_eq!(backoff.current(), Duration::from_millis(200));
        backoff.next();
        assert_eq!(backoff.current(), Duration::from_millis(300));
        backoff.next();
        assert_eq!(backoff.current(), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn poll_until_returns_once_check_succeeds() {
        let calls = AtomicU32::new(0);
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(4));
        let deadline = Instant::now() + Duration::from_secs(5);

        let ready = backoff
            .poll_until(deadline, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { n >= 2 }
            })
            .await;

        assert!(ready);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn poll_until_gives_up_at_deadline() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(5), Duration::from_millis(10));
        let deadline = Instant::now() + Duration::from_millis(30);

        let ready = backoff.poll_until(deadline, || async { false }).await;

        assert!(!ready);
        assert!(Instant::now() >= deadline);
    }
}
