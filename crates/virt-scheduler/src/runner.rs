//! Shared scheduler lifecycle
//!
//! Every periodic job gets the same shape: sleep an initial delay, run once,
//! then tick on an interval. The loop honours both the process-wide shutdown
//! signal and the scheduler's own stop channel, and each run executes inside
//! its own task so a panicking body is logged and the loop continues.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::Result;

#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn run(&self) -> Result<()>;
}

pub struct Scheduler {
    name: &'static str,
    stop: watch::Sender<bool>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn start(
        job: Arc<dyn Job>,
        initial_delay: Duration,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        let name = job.name();
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(initial_delay) => {}
                _ = stop_rx.changed() => return,
                _ = shutdown.changed() => return,
            }

            let mut ticker = tokio::time::interval(interval);
            loop {
                run_guarded(&job).await;
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => break,
                    _ = shutdown.changed() => break,
                }
            }
            debug!(scheduler = name, "scheduler loop exited");
        });

        Self {
            name,
            stop: stop_tx,
            handle: std::sync::Mutex::new(Some(handle)),
        }
    }

    pub async fn stop(&self) {
        let _ = self.stop.send(true);
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        debug!(scheduler = self.name, "scheduler stopped");
    }
}

async fn run_guarded(job: &Arc<dyn Job>) {
    let name = job.name();
    let job = job.clone();
    match tokio::spawn(async move { job.run().await }).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(scheduler = name, error = %e, "scheduler run failed"),
        Err(join_error) if join_error.is_panic() => {
            let payload = join_error.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(scheduler = name, panic = %message, "scheduler body panicked, continuing");
        }
        Err(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingJob {
        runs: AtomicU32,
        panic_on_first: bool,
    }

    #[async_trait]
    impl Job for CountingJob {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run(&self) -> Result<()> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if self.panic_on_first && run == 0 {
                panic!("first run blows up");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn runs_after_initial_delay_then_ticks() {
        let job = Arc::new(CountingJob {
            runs: AtomicU32::new(0),
            panic_on_first: false,
        });
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = Scheduler::start(
            job.clone(),
            Duration::from_millis(10),
            Duration::from_millis(30),
            shutdown_rx,
        );
        tokio::time::sleep(Duration::from_millis(120)).await;
        scheduler.stop().await;
        assert!(job.runs.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn panic_in_body_does_not_kill_the_loop() {
        let job = Arc::new(CountingJob {
            runs: AtomicU32::new(0),
            panic_on_first: true,
        });
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = Scheduler::start(
            job.clone(),
            Duration::from_millis(5),
            Duration::from_millis(20),
            shutdown_rx,
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop().await;
        // The panicking first run was followed by more
        assert!(job.runs.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn shutdown_signal_stops_the_loop() {
        let job = Arc::new(CountingJob {
            runs: AtomicU32::new(0),
            panic_on_first: false,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let _scheduler = Scheduler::start(
            job.clone(),
            Duration::from_millis(5),
            Duration::from_millis(10),
            shutdown_rx,
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let count = job.runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), count);
    }
}
