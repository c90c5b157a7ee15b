// Optimistic concurrency control for registry read-modify-write sequences
//
// A sequence that ends in a conditional write is re-run from the start when the
// write loses a version race, with a short jittered back-off between attempts.

use crate::errors::RegistryError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Default number of re-runs after a version conflict
pub const DEFAULT_CONFLICT_RETRIES: u32 = 3;

/// Retry strategy trait for calculating retry delays
pub trait RetryStrategy: Send + Sync {
    /// Delay before re-running after the given failed attempt (0-based).
    /// Returns None once retries are exhausted.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// Linear back-off with random jitter for conflicting writers
#[derive(Debug, Clone)]
pub struct ConflictBackoff {
    max_retries: u32,
    base_delay: Duration,
    /// Jitter factor (0.0 to 1.0)
    jitter_factor: f64,
}

impl Default for ConflictBackoff {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_CONFLICT_RETRIES,
            base_delay: Duration::from_millis(50),
            jitter_factor: 0.5,
        }
    }
}

impl ConflictBackoff {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn with_config(max_retries: u32, base_delay: Duration, jitter_factor: f64) -> Self {
        Self {
            max_retries,
            base_delay,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn add_jitter(&self, delay: Duration) -> Duration {
        if self.jitter_factor == 0.0 {
            return delay;
        }

        let delay_ms = delay.as_millis() as u64;
        let jitter_range_ms = (delay_ms as f64 * self.jitter_factor) as u64;
        let jitter_ms = if jitter_range_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_range_ms)
        } else {
            0
        };

        Duration::from_millis(delay_ms + jitter_ms)
    }
}

impl RetryStrategy for ConflictBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        Some(self.add_jitter(self.base_delay * (attempt + 1)))
    }
}

/// Run `operation`, re-running it whenever it fails with `RegistryError::Conflict`.
///
/// Any other outcome is returned as is. When retries are exhausted the last
/// conflict is returned.
pub async fn with_concurrency_control<S, T, F, Fut>(
    strategy: &S,
    mut operation: F,
) -> Result<T, RegistryError>
where
    S: RetryStrategy + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RegistryError>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Err(err) if err.is_conflict() => match strategy.next_delay(attempt) {
                Some(delay) => {
                    debug!(
                        attempt = attempt + 1,
                        retry_delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Conflicting registry write, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                None => {
                    warn!(attempts = attempt + 1, error = %err, "Giving up after conflicting registry writes");
                    return Err(err);
                }
            },
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn conflict() -> RegistryError {
        RegistryError::Conflict {
            connector_id: "c1".to_string(),
            expected: 1,
        }
    }

    #[test]
    fn test_backoff_without_jitter_is_linear() {
        let strategy = ConflictBackoff::with_config(3, Duration::from_millis(10), 0.0);
        assert_eq!(strategy.next_delay(0), Some(Duration::from_millis(10)));
        assert_eq!(strategy.next_delay(1), Some(Duration::from_millis(20)));
        assert_eq!(strategy.next_delay(2), Some(Duration::from_millis(30)));
        assert_eq!(strategy.next_delay(3), None);
    }

    #[test]
    fn test_jitter_stays_within_range() {
        let strategy = ConflictBackoff::with_config(5, Duration::from_millis(100), 0.5);
        for attempt in 0..5 {
            let delay = strategy.next_delay(attempt).unwrap();
            let base = 100 * (attempt as u64 + 1);
            assert!(delay.as_millis() as u64 >= base);
            assert!(delay.as_millis() as u64 <= base + base / 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_conflicts_until_success() {
        let strategy = ConflictBackoff::new(3);
        let calls = AtomicU32::new(0);

        let result = with_concurrency_control(&strategy, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(conflict())
            } else {
                Ok(true)
            }
        })
        .await;

        assert_eq!(result, Ok(true));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let strategy = ConflictBackoff::new(2);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_concurrency_control(&strategy, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(conflict())
        })
        .await;

        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let strategy = ConflictBackoff::new(3);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_concurrency_control(&strategy, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RegistryError::Closed)
        })
        .await;

        assert_eq!(result, Err(RegistryError::Closed));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
