//! Per-backend worker pool
//!
//! A buffered FIFO queue of task ids fronting `concurrency` workers. The
//! queue holds `2 × concurrency` entries; submission applies backpressure
//! beyond that. Dropping the pool lets in-flight and queued work finish,
//! then the workers exit.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

/// Executes one claimed task id to completion
pub type TaskRunner = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct WorkerPool {
    concurrency: usize,
    tx: mpsc::Sender<String>,
    _workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(concurrency: usize, runner: TaskRunner) -> Self {
        let concurrency = concurrency.max(1);
        let (tx, rx) = mpsc::channel::<String>(2 * concurrency);
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..concurrency)
            .map(|worker| {
                let rx = rx.clone();
                let runner = runner.clone();
                tokio::spawn(async move {
                    loop {
                        // One receiver shared by all workers keeps dequeue
                        // order FIFO; the lock is held only across recv
                        let next = { rx.lock().await.recv().await };
                        match next {
                            Some(uuid) => {
                                debug!(worker, task = %uuid, "worker picked up task");
                                runner(uuid).await;
                            }
                            None => break,
                        }
                    }
                })
            })
            .collect();

        Self {
            concurrency,
            tx,
            _workers: workers,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// False once the pool has been torn down
    pub async fn submit(&self, uuid: String) -> bool {
        self.tx.send(uuid).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn recording_runner(
        log: Arc<StdMutex<Vec<String>>>,
        delay: Duration,
    ) -> TaskRunner {
        Arc::new(move |uuid| {
            let log = log.clone();
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                log.lock().unwrap().push(uuid);
            })
        })
    }

    #[tokio::test]
    async fn serial_pool_runs_fifo() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let pool = WorkerPool::new(1, recording_runner(log.clone(), Duration::from_millis(20)));

        for uuid in ["a", "b", "c"] {
            assert!(pool.submit(uuid.to_string()).await);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn serial_pool_never_overlaps() {
        // Each run records start and end; with one worker they must nest
        let events = Arc::new(StdMutex::new(Vec::new()));
        let runner: TaskRunner = {
            let events = events.clone();
            Arc::new(move |uuid| {
                let events = events.clone();
                Box::pin(async move {
                    events.lock().unwrap().push(format!("start:{}", uuid));
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    events.lock().unwrap().push(format!("end:{}", uuid));
                })
            })
        };
        let pool = WorkerPool::new(1, runner);
        pool.submit("t1".into()).await;
        pool.submit("t2".into()).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let events = events.lock().unwrap().clone();
        assert_eq!(events, vec!["start:t1", "end:t1", "start:t2", "end:t2"]);
    }

    #[tokio::test]
    async fn concurrent_pool_overlaps() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let pool = WorkerPool::new(4, recording_runner(log.clone(), Duration::from_millis(50)));
        let started = std::time::Instant::now();
        for uuid in ["a", "b", "c", "d"] {
            pool.submit(uuid.to_string()).await;
        }
        while log.lock().unwrap().len() < 4 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Four 50 ms tasks on four workers finish well under 4 × 50 ms
        assert!(started.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn minimum_concurrency_is_one() {
        let pool = WorkerPool::new(0, recording_runner(Default::default(), Duration::ZERO));
        assert_eq!(pool.concurrency(), 1);
    }
}
