use crate::config::WorkerConfig;
use crate::error::AppError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Bounded pool of tokio workers pulling jobs off one shared queue.
///
/// Engine calls and retry backoff happen on the worker that picked the job,
/// so `pool_size` caps concurrent engine processes.
#[derive(Clone)]
pub struct WorkerPool {
    job_tx: mpsc::Sender<Job>,
    size: usize,
}

struct Worker {
    id: usize,
    job_rx: Arc<Mutex<mpsc::Receiver<Job>>>,
}

impl Worker {
    fn new(id: usize, job_rx: Arc<Mutex<mpsc::Receiver<Job>>>) -> Self {
        Self { id, job_rx }
    }

    /// Cancellation only interrupts the wait for work; a running job finishes.
    async fn run(self, cancel_token: CancellationToken) {
        debug!("Worker {} started", self.id);
        loop {
            let job = tokio::select! {
                _ = cancel_token.cancelled() => break,
                job = async { self.job_rx.lock().await.recv().await } => job,
            };
            match job {
                Some(job) => job.await,
                None => break,
            }
        }
        debug!("Worker {} stopped", self.id);
    }
}

impl WorkerPool {
    pub fn start(
        config: &WorkerConfig,
        cancel_token: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let size = config.pool_size.max(1);
        let (job_tx, job_rx) = mpsc::channel::<Job>(config.queue_capacity.max(1));
        let job_rx = Arc::new(Mutex::new(job_rx));

        let handles = (0..size)
            .map(|id| {
                let worker = Worker::new(id, Arc::clone(&job_rx));
                tokio::spawn(worker.run(cancel_token.clone()))
            })
            .collect();

        info!(
            "Worker pool started with {} workers, queue capacity {}",
            size, config.queue_capacity
        );
        (Self { job_tx, size }, handles)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Free queue slots right now.
    pub fn available_capacity(&self) -> usize {
        self.job_tx.capacity()
    }

    /// Queues a job without waiting. Fails fast when the queue is full.
    pub fn try_submit<F>(&self, job: F) -> Result<(), AppError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.job_tx.try_send(Box::pin(job)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => AppError::WorkerPoolSaturated,
            mpsc::error::TrySendError::Closed(_) => AppError::WorkerPoolClosed,
        })
    }

    /// Queues a job, waiting for queue capacity.
    pub async fn submit<F>(&self, job: F) -> Result<(), AppError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.job_tx
            .send(Box::pin(job))
            .await
            .map_err(|_| AppError::WorkerPoolClosed)
    }

    /// Runs `task` on a worker and hands back its output.
    pub async fn run<T, F>(&self, task: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        self.submit(async move {
            let _ = result_tx.send(task.await);
        })
        .await?;
        result_rx.await.map_err(|_| AppError::WorkerPoolClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(pool_size: usize, queue_capacity: usize) -> WorkerConfig {
        WorkerConfig {
            pool_size,
            queue_capacity,
        }
    }

    #[tokio::test]
    async fn run_returns_job_output() {
        let (pool, _handles) = WorkerPool::start(&config(2, 4), CancellationToken::new());
        let value = pool.run(async { 21 * 2 }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn jobs_run_on_all_workers() {
        let (pool, _handles) = WorkerPool::start(&config(3, 10), CancellationToken::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let mut results = Vec::new();
        for _ in 0..9 {
            let counter = Arc::clone(&counter);
            results.push(pool.run(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for result in futures::future::join_all(results).await {
            result.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 9);
    }

    #[tokio::test]
    async fn full_queue_saturates_non_blocking_submission() {
        let (pool, _handles) = WorkerPool::start(&config(1, 1), CancellationToken::new());
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        pool.try_submit(async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
        })
        .unwrap();
        started_rx.await.unwrap();

        // The only worker is busy, one slot left in the queue.
        assert_eq!(pool.available_capacity(), 1);
        pool.try_submit(async {}).unwrap();
        assert_eq!(pool.available_capacity(), 0);
        assert!(matches!(
            pool.try_submit(async {}),
            Err(AppError::WorkerPoolSaturated)
        ));

        release_tx.send(()).unwrap();
        assert_eq!(pool.run(async { "drained" }).await.unwrap(), "drained");
    }

    #[tokio::test]
    async fn cancelled_pool_rejects_work() {
        let cancel_token = CancellationToken::new();
        let (pool, handles) = WorkerPool::start(&config(2, 2), cancel_token.clone());
        cancel_token.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(matches!(
            pool.submit(async {}).await,
            Err(AppError::WorkerPoolClosed)
        ));
    }
}
