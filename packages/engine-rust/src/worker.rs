//! Background worker for periodic and on-demand housekeeping.
//!
//! A `BackgroundWorker<R>` owns a tokio task that feeds commands from an mpsc
//! channel to a `BackgroundRunnable` and calls its tick hook on a fixed
//! interval. Correlation aggregators use it to sweep timed-out groups.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Command handler executed by [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    async fn run(&mut self, task: Self::Task);

    /// Called on every tick of the worker's interval.
    async fn on_tick(&mut self) {}

    /// Called once when the worker stops.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Handle to a running background task.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker on the current runtime. The first tick fires one
    /// full `tick` after start, not immediately.
    pub fn start(mut runnable: R, tick: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(CHANNEL_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => {
                        match task {
                            Some(task) => runnable.run(task).await,
                            None => break,
                        }
                    }
                    _ = interval.tick() => {
                        runnable.on_tick().await;
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// # Errors
    ///
    /// Returns an error if the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker channel closed")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Stops the worker and waits for its shutdown hook to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Default, Clone)]
    struct Counters {
        runs: Arc<AtomicU32>,
        ticks: Arc<AtomicU32>,
        shutdowns: Arc<AtomicU32>,
    }

    struct Counting(Counters);

    #[async_trait]
    impl BackgroundRunnable for Counting {
        type Task = u32;

        async fn run(&mut self, _task: u32) {
            self.0.runs.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.0.ticks.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.0.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_tasks_and_shuts_down_once() {
        let counters = Counters::default();
        let mut worker = BackgroundWorker::start(Counting(counters.clone()), Duration::from_secs(60));

        for task in 0..3 {
            worker.submit(task).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(counters.runs.load(Ordering::SeqCst), 3);
        assert!(worker.is_running());

        worker.stop().await;
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
        assert!(!worker.is_running());
        assert!(worker.submit(9).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_skip_startup() {
        let counters = Counters::default();
        let mut worker = BackgroundWorker::start(Counting(counters.clone()), Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.stop().await;
        assert!(counters.ticks.load(Ordering::SeqCst) >= 4);
    }
}
