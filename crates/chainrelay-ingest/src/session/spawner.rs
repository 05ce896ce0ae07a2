//! Semaphore-gated decode task spawner.
//!
//! Every concurrent decode holds a permit; when the pool is exhausted the
//! read loop stops receiving until a task finishes. This is the session's
//! backpressure gate and its single "current load" gauge.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Clone)]
pub struct TaskSpawner {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl TaskSpawner {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Number of tasks currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.limit - self.permits.available_permits()
    }

    /// Whether a spawn would proceed without waiting.
    pub fn has_capacity(&self) -> bool {
        self.permits.available_permits() > 0
    }

    /// Run a task on the pool, waiting for a permit if none is free.
    pub async fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // the semaphore is never closed, but avoid a panic path anyway
        let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return;
        };
        metrics::gauge!("session_in_flight").increment(1.0);
        tokio::spawn(async move {
            task.await;
            drop(permit);
            metrics::gauge!("session_in_flight").decrement(1.0);
        });
    }

    /// Wait for all in-flight tasks to finish, up to `timeout`.
    ///
    /// Returns `false` when tasks were still running at the deadline.
    pub async fn drain(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.permits.acquire_many(self.limit as u32))
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocked_task(release: &Arc<Semaphore>) -> impl Future<Output = ()> + Send + 'static {
        let release = Arc::clone(release);
        async move {
            let _ = release.acquire().await;
        }
    }

    #[tokio::test]
    async fn tracks_in_flight_and_capacity() {
        let spawner = TaskSpawner::new(2);
        assert!(spawner.has_capacity());
        assert_eq!(spawner.in_flight(), 0);

        let release = Arc::new(Semaphore::new(0));
        for _ in 0..2 {
            spawner.spawn(blocked_task(&release)).await;
        }
        assert_eq!(spawner.in_flight(), 2);
        assert!(!spawner.has_capacity());

        release.add_permits(2);
        assert!(spawner.drain(Duration::from_secs(5)).await);
        assert_eq!(spawner.in_flight(), 0);
    }

    #[tokio::test]
    async fn drain_times_out_while_tasks_run() {
        let spawner = TaskSpawner::new(1);
        let release = Arc::new(Semaphore::new(0));
        spawner.spawn(blocked_task(&release)).await;
        assert!(!spawner.drain(Duration::from_millis(50)).await);
        release.add_permits(1);
        assert!(spawner.drain(Duration::from_secs(5)).await);
    }
}
