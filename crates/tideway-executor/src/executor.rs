//! Executor for blocking driver calls
//!
//! Offloads blocking closures to Tokio's blocking pool while bounding how many
//! run concurrently.

use std::any::Any;
use std::sync::Arc;

use tideway_common::{Result, TidewayError};
use tokio::sync::Semaphore;

// ============================================================================
// Executor Types
// ============================================================================

/// Thread pool executor for blocking tasks
#[derive(Debug)]
pub struct ThreadPoolExecutor {
    /// Maximum concurrent tasks
    max_workers: usize,
    /// Semaphore for limiting concurrency
    semaphore: Arc<Semaphore>,
}

impl ThreadPoolExecutor {
    /// Create a new thread pool executor
    ///
    /// # Arguments
    /// * `max_workers` - Maximum number of concurrent tasks (None = CPU count)
    pub fn new(max_workers: Option<usize>) -> Self {
        let max_workers = max_workers.unwrap_or_else(num_cpus::get).max(1);
        Self {
            max_workers,
            semaphore: Arc::new(Semaphore::new(max_workers)),
        }
    }

    /// Get the maximum number of workers
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Get the current number of available permits
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Whether `shutdown` has been called
    pub fn is_shutdown(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Stop accepting work. Tasks already running finish normally.
    pub fn shutdown(&self) {
        self.semaphore.close();
    }

    /// Run a blocking function in the thread pool
    ///
    /// A panic inside `func` is captured and returned as
    /// `TidewayError::Internal`, never resumed on the caller's task.
    pub async fn run<F, R>(&self, func: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        run_with_permit(Arc::clone(&self.semaphore), func).await
    }
}

impl Default for ThreadPoolExecutor {
    fn default() -> Self {
        Self::new(None)
    }
}

async fn run_with_permit<F, R>(semaphore: Arc<Semaphore>, func: F) -> Result<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let permit = semaphore
        .acquire_owned()
        .await
        .map_err(|_| TidewayError::Runtime("executor shut down".to_string()))?;

    let joined = tokio::task::spawn_blocking(move || {
        let result = func();
        drop(permit); // Release permit after task completes
        result
    })
    .await;

    match joined {
        Ok(value) => Ok(value),
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic());
            tracing::warn!(panic = %message, "blocking task panicked");
            Err(TidewayError::Internal(format!(
                "blocking task panicked: {}",
                message
            )))
        }
        Err(e) => Err(TidewayError::Internal(format!(
            "blocking task failed: {}",
            e
        ))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_thread_pool_executor_basic() {
        let executor = ThreadPoolExecutor::new(Some(2));
        assert_eq!(executor.max_workers(), 2);

        let result = executor.run(|| 42).await.unwrap();
        assert_eq!(result, 42);
    }

    #[test]
    fn test_zero_workers_clamped() {
        let executor = ThreadPoolExecutor::new(Some(0));
        assert_eq!(executor.max_workers(), 1);
    }

    #[tokio::test]
    async fn test_thread_pool_executor_concurrency() {
        let executor = Arc::new(ThreadPoolExecutor::new(Some(2)));
        let counter = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let executor = Arc::clone(&executor);
            let counter = Arc::clone(&counter);
            let peak = Arc::clone(&peak);
            let running = Arc::clone(&running);

            let handle = tokio::spawn(async move {
                executor
                    .run(move || {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        counter.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(10));
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            });
            handles.push(handle);
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(executor.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let executor = ThreadPoolExecutor::new(Some(1));
        let result: Result<()> = executor.run(|| panic!("boom")).await;

        match result {
            Err(TidewayError::Internal(msg)) => assert!(msg.contains("boom")),
            other => panic!("expected internal error, got {:?}", other),
        }
        // Permit was released even though the task panicked
        assert_eq!(executor.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_run_waits_for_a_free_worker() {
        let executor = Arc::new(ThreadPoolExecutor::new(Some(1)));
        let (release, hold) = std::sync::mpsc::channel::<()>();

        let busy = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move { executor.run(move || hold.recv().is_ok()).await })
        };
        while executor.available_permits() > 0 {
            tokio::task::yield_now().await;
        }

        let mut waiting = tokio_test::task::spawn(executor.run(|| 2));
        tokio_test::assert_pending!(waiting.poll());

        release.send(()).unwrap();
        assert!(busy.await.unwrap().unwrap());
        assert_eq!(waiting.await.unwrap(), 2);
    }

    #[test]
    fn test_run_on_current_thread_runtime() {
        let executor = ThreadPoolExecutor::new(Some(1));
        let value = tokio_test::block_on(executor.run(|| "done")).unwrap();
        assert_eq!(value, "done");
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let executor = ThreadPoolExecutor::new(Some(1));
        executor.shutdown();
        assert!(executor.is_shutdown());

        let result = executor.run(|| 1).await;
        assert!(matches!(result, Err(TidewayError::Runtime(_))));
    }
}
