//! Bounded worker pool for proof generation
//!
//! Jobs are CPU-bound, so each one runs on the blocking thread pool once it
//! holds one of `workers` semaphore permits. Every accepted job is counted as
//! in flight from `spawn` until it finishes or is dropped. Shutdown waits for
//! that count to reach zero up to a deadline, then closes the semaphore so
//! anything still queued is discarded.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};

/// Accepted-but-unfinished job counter
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

/// Marks one job in flight for as long as it lives
struct InFlightGuard(Arc<InFlight>);

impl InFlightGuard {
    fn new(in_flight: &Arc<InFlight>) -> Self {
        in_flight.count.fetch_add(1, Ordering::AcqRel);
        Self(in_flight.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

pub struct ProofWorkerPool {
    semaphore: Arc<Semaphore>,
    workers: usize,
    in_flight: Arc<InFlight>,
    closed: AtomicBool,
}

impl ProofWorkerPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(workers)),
            workers,
            in_flight: Arc::new(InFlight::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Jobs currently holding a worker slot
    pub fn busy(&self) -> usize {
        self.workers.saturating_sub(self.semaphore.available_permits())
    }

    /// Jobs accepted and not yet finished, queued or running
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue `job`. Fails with a concurrency error once shutdown has started.
    pub fn spawn<T, F>(&self, job: F) -> Result<ProofHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        if self.is_closed() {
            return Err(PipelineError::concurrency("proof worker pool is shut down"));
        }

        let guard = InFlightGuard::new(&self.in_flight);
        let semaphore = self.semaphore.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return Err(PipelineError::concurrency(
                        "proof worker pool closed before job started",
                    ))
                }
            };

            match tokio::task::spawn_blocking(job).await {
                Ok(result) => result,
                Err(e) => Err(PipelineError::concurrency(format!("proof job aborted: {}", e))),
            }
        });

        Ok(ProofHandle { task })
    }

    /// Stop accepting jobs and wait up to `timeout` for every accepted job
    /// to finish. Returns `false` if the deadline passed first, in which
    /// case jobs still waiting for a worker are discarded.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("Proof worker pool already shut down");
            return true;
        }

        let in_flight = self.in_flight.clone();
        let drain = async move {
            loop {
                // Registered before the check so a wakeup in between is not lost
                let idle = in_flight.idle.notified();
                if in_flight.count.load(Ordering::Acquire) == 0 {
                    return;
                }
                idle.await;
            }
        };
        let drained = tokio::time::timeout(timeout, drain).await.is_ok();
        self.semaphore.close();

        if drained {
            info!(workers = self.workers, "Proof worker pool drained");
        } else {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                remaining = self.in_flight(),
                "Proof worker pool did not drain in time; queued jobs discarded"
            );
        }
        drained
    }
}

/// Handle to one queued proof job. Dropping it abandons the result but
/// lets the job run to completion.
pub struct ProofHandle<T> {
    task: JoinHandle<Result<T>>,
}

impl<T> ProofHandle<T> {
    pub async fn join(self) -> Result<T> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(PipelineError::concurrency("proof job cancelled")),
            Err(e) => Err(PipelineError::concurrency(format!("proof job failed: {}", e))),
        }
    }

    /// Cancel the job if it has not started on a worker yet.
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_jobs_run_and_return() {
        let pool = ProofWorkerPool::new(2);
        let handles: Vec<_> = (0..5)
            .map(|i| pool.spawn(move || Ok(i * 2)).unwrap())
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.join().await.unwrap());
        }
        assert_eq!(results, vec![0, 2, 4, 6, 8]);
    }

    #[tokio::test]
    async fn test_job_error_is_returned() {
        let pool = ProofWorkerPool::new(1);
        let handle = pool
            .spawn(|| -> Result<()> { Err(PipelineError::proof_generation("act_1", "backend down")) })
            .unwrap();
        assert!(matches!(
            handle.join().await,
            Err(PipelineError::ProofGeneration { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_rejects() {
        let pool = ProofWorkerPool::new(2);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let done = done.clone();
            pool.spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }

        assert!(pool.shutdown(Duration::from_secs(5)).await);
        assert_eq!(done.load(Ordering::SeqCst), 4);
        assert_eq!(pool.in_flight(), 0);
        assert!(matches!(
            pool.spawn(|| Ok(())),
            Err(PipelineError::Concurrency(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_times_out() {
        let pool = ProofWorkerPool::new(1);
        let handle = pool
            .spawn(|| {
                std::thread::sleep(Duration::from_millis(300));
                Ok(())
            })
            .unwrap();

        assert!(!pool.shutdown(Duration::from_millis(10)).await);
        // The running job still completes
        assert!(handle.join().await.is_ok());
    }

    #[tokio::test]
    async fn test_job_spawned_right_before_shutdown_runs() {
        let pool = ProofWorkerPool::new(1);
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let handle = pool
            .spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .unwrap();

        assert!(pool.shutdown(Duration::from_secs(5)).await);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(handle.join().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_aborted_job_does_not_block_shutdown() {
        let pool = ProofWorkerPool::new(1);
        let blocker = pool
            .spawn(|| {
                std::thread::sleep(Duration::from_millis(50));
                Ok(())
            })
            .unwrap();
        let queued = pool.spawn(|| Ok(())).unwrap();
        queued.abort();

        assert!(pool.shutdown(Duration::from_secs(5)).await);
        assert!(blocker.join().await.is_ok());
        assert_eq!(pool.in_flight(), 0);
    }
}
