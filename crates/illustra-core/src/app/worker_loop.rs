//! Worker loop - admits tasks from the scheduler and runs them.
//!
//! One supervisor task waits on `Scheduler::admit` (which enforces the
//! concurrency limit) and spawns each admitted execution into a `JoinSet`.
//! Shutdown stops admission; executions already running are awaited, not
//! aborted.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

use super::executor::Executor;
use crate::queue::Scheduler;

/// Handle to the running worker loop.
/// - `request_shutdown` stops admitting new tasks
/// - `shutdown_and_join` additionally waits for in-flight executions
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn spawn(scheduler: Arc<Scheduler>, executor: Arc<Executor>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(worker_loop(scheduler, executor, shutdown_rx));
        Self { shutdown_tx, join }
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(err) = self.join.await {
            error!(error = %err, "worker loop terminated abnormally");
        }
    }
}

async fn worker_loop(
    scheduler: Arc<Scheduler>,
    executor: Arc<Executor>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(concurrency = scheduler.concurrency_limit(), "worker loop started");
    let mut running = JoinSet::new();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let admission = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(err) = joined {
                    error!(error = %err, "task execution panicked");
                }
                continue;
            }
            admission = scheduler.admit() => admission,
        };

        let Some(admission) = admission else {
            break;
        };
        let executor = Arc::clone(&executor);
        running.spawn(async move {
            let task_id = admission.task().id;
            let outcome = executor.execute(admission).await;
            debug!(%task_id, ?outcome, "execution finished");
        });
    }

    debug!(in_flight = running.len(), "worker loop draining");
    while let Some(joined) = running.join_next().await {
        if let Err(err) = joined {
            error!(error = %err, "task execution panicked");
        }
    }
    info!("worker loop stopped");
}
