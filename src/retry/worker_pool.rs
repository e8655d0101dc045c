/// Bounded pool for blocking actions
///
/// Blocking closures run on tokio's blocking threads, but no more than
/// `size` of them at a time; callers beyond that wait for a permit.
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
    active: Arc<AtomicUsize>,
    completed: Arc<AtomicU64>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
            active: Arc::new(AtomicUsize::new(0)),
            completed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// One worker per CPU
    pub fn with_cpu_count() -> Self {
        Self::new(num_cpus::get())
    }

    /// Run `job` on a blocking thread once a worker is free
    pub async fn run<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .context("worker pool is shut down")?;

        let active = Arc::clone(&self.active);
        let completed = Arc::clone(&self.completed);
        active.fetch_add(1, Ordering::SeqCst);

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let _active = ActiveJob(active);
            let result = job();
            completed.fetch_add(1, Ordering::Relaxed);
            result
        });

        handle.await.context("blocking job panicked")?
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers not currently busy
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Jobs currently running
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Stop handing out workers; queued and future jobs fail
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}

/// Decrements the active count even if the job panics
struct ActiveJob(Arc<AtomicUsize>);

impl Drop for ActiveJob {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::with_cpu_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_runs_blocking_job() {
        let pool = WorkerPool::new(2);
        let value = pool.run(|| Ok(21 * 2)).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(pool.completed(), 1);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_job_error_is_returned() {
        let pool = WorkerPool::new(1);
        let result: Result<()> = pool.run(|| anyhow::bail!("disk busy")).await;
        assert!(result.unwrap_err().to_string().contains("disk busy"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrency_is_bounded() {
        let pool = Arc::new(WorkerPool::new(2));
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let jobs: Vec<_> = (0..6)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let peak = Arc::clone(&peak);
                let current = Arc::clone(&current);
                tokio::spawn(async move {
                    pool.run(move || {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
                })
            })
            .collect();

        for job in jobs {
            job.await.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.completed(), 6);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_jobs() {
        let pool = WorkerPool::new(1);
        pool.close();
        assert!(pool.is_closed());
        assert!(pool.run(|| Ok(())).await.is_err());
    }

    #[tokio::test]
    async fn test_panicking_job() {
        let pool = WorkerPool::new(1);
        let result: Result<()> = pool.run(|| panic!("boom")).await;
        assert!(result.is_err());
        // Permit is released even when the job panics
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.active(), 0);
    }
}
