// Bounded pool of concurrently running tasks
//
// Slots are semaphore permits taken without waiting; a full pool rejects the
// submission instead of queueing it.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Runs submitted futures with at most `max_concurrency` of them in flight
pub struct ConcurrentTasks {
    max_concurrency: Option<usize>,
    semaphore: Option<Arc<Semaphore>>,
    tasks: Mutex<JoinSet<()>>,
    running: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

/// Decrements the running counter however the task ends, including abort
struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrentTasks {
    /// `None` or `Some(0)` means unbounded
    pub fn new(max_concurrency: Option<usize>) -> Self {
        let max_concurrency = max_concurrency.filter(|max| *max > 0);

        Self {
            max_concurrency,
            semaphore: max_concurrency.map(|max| Arc::new(Semaphore::new(max))),
            tasks: Mutex::new(JoinSet::new()),
            running: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn max_concurrency(&self) -> Option<usize> {
        self.max_concurrency
    }

    /// Number of tasks currently in flight
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Start `task` if a slot is free. Never waits for one.
    ///
    /// Returns `false` when the pool is full or has been cancelled.
    pub fn try_put<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return false;
        }

        let permit = match &self.semaphore {
            Some(semaphore) => match semaphore.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => return false,
            },
            None => None,
        };

        self.running.fetch_add(1, Ordering::SeqCst);
        let guard = RunningGuard(self.running.clone());
        let cancel = self.cancel.clone();

        self.lock_tasks().spawn(async move {
            let _permit = permit;
            let _guard = guard;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => debug!("Task cancelled"),
                _ = task => {}
            }
        });

        true
    }

    /// Wait for every task submitted so far to finish
    pub async fn join(&self) {
        loop {
            let mut tasks = std::mem::take(&mut *self.lock_tasks());
            if tasks.is_empty() {
                return;
            }

            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    if e.is_panic() {
                        error!(error = %e, "Task panicked");
                    } else {
                        debug!("Task aborted");
                    }
                }
            }
        }
    }

    /// Cancel all running tasks and reject further submissions
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.lock_tasks().abort_all();
    }

    fn lock_tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ConcurrentTasks {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn test_unbounded_pool_accepts_everything() {
        let pool = ConcurrentTasks::new(Some(0));
        assert_eq!(pool.max_concurrency(), None);

        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let done = done.clone();
            assert!(pool.try_put(async move {
                sleep(Duration::from_millis(5)).await;
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }

        pool.join().await;
        assert_eq!(done.load(Ordering::SeqCst), 50);
        assert_eq!(pool.running(), 0);
    }

    #[tokio::test]
    async fn test_full_pool_rejects_without_blocking() {
        let pool = ConcurrentTasks::new(Some(2));
        let gate = Arc::new(Semaphore::new(0));

        for _ in 0..2 {
            let gate = gate.clone();
            assert!(pool.try_put(async move {
                let _ = gate.acquire().await;
            }));
        }

        assert!(!pool.try_put(async {}));
        assert_eq!(pool.running(), 2);

        gate.add_permits(2);
        pool.join().await;
        assert_eq!(pool.running(), 0);
        assert!(pool.try_put(async {}));
        pool.join().await;
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_affect_others() {
        let pool = ConcurrentTasks::new(Some(4));
        let done = Arc::new(AtomicUsize::new(0));

        assert!(pool.try_put(async {
            panic!("boom");
        }));
        for _ in 0..3 {
            let done = done.clone();
            assert!(pool.try_put(async move {
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }

        pool.join().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(pool.running(), 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_running_tasks() {
        let pool = ConcurrentTasks::new(None);
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let finished = finished.clone();
            assert!(pool.try_put(async move {
                sleep(Duration::from_secs(3600)).await;
                finished.fetch_add(1, Ordering::SeqCst);
            }));
        }

        pool.cancel();
        timeout(Duration::from_secs(5), pool.join())
            .await
            .expect("join should return after cancel");

        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert_eq!(pool.running(), 0);
        assert!(!pool.try_put(async {}));
    }
}
