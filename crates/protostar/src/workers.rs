//! Worker pool executing queued work items.
//!
//! A fixed-size group of tokio tasks drains one shared unbounded queue and
//! invokes a single `do_work` callback per item. `submit` never blocks the
//! caller; ordering across workers is not preserved, which is fine because
//! every work item is independent.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::Work;

/// Callback invoked by a worker for each submitted work item. Errors must be
/// handled (logged) inside the callback; nothing escapes the worker loop.
pub type DoWork = Arc<dyn Fn(Work) -> BoxFuture<'static, ()> + Send + Sync>;

/// Fixed-size pool of workers sharing one submission queue.
pub struct WorkerPool {
    tx: mpsc::UnboundedSender<Work>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `workers` tasks (minimum 1) invoking `do_work` per item.
    pub fn new(workers: usize, do_work: DoWork) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let do_work = do_work.clone();
                tokio::spawn(async move {
                    loop {
                        let work = { rx.lock().await.recv().await };
                        match work {
                            Some(work) => do_work(work).await,
                            None => break,
                        }
                    }
                    debug!(worker, "job worker stopped");
                })
            })
            .collect();

        Self { tx, handles }
    }

    /// Enqueues a work item and returns immediately.
    pub fn submit(&self, work: Work) {
        if self.tx.send(work).is_err() {
            warn!("worker pool is shut down, dropping submitted work");
        }
    }

    /// Closes the queue and waits for the workers to drain it.
    pub async fn shutdown(self) {
        drop(self.tx);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
