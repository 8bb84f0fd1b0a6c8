//! Worker pool — claims due queued runs and executes them.
//!
//! Workers coordinate only through the database: the pool can run with any
//! number of tasks (or alongside other processes sharing the store) and the
//! claim protocol keeps each run exactly-once. The kick signal is a latency
//! optimisation; the poll tick is the correctness backstop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::Scheduler;

pub struct WorkerPool {
    scheduler: Arc<Scheduler>,
}

impl WorkerPool {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }

    /// Run the pool until `shutdown` broadcasts `true`.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let workers = self.scheduler.config.workers.max(1);
        info!(workers, "worker pool started");

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let scheduler = Arc::clone(&self.scheduler);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(worker_loop(scheduler, shutdown, worker_id)));
        }
        for handle in handles {
            let _ = handle.await;
        }
        info!("worker pool stopped");
    }
}

async fn worker_loop(scheduler: Arc<Scheduler>, mut shutdown: watch::Receiver<bool>, worker_id: usize) {
    let poll = Duration::from_millis(scheduler.config.poll_interval_ms.max(100));
    loop {
        tokio::select! {
            _ = scheduler.kicked() => {}
            _ = tokio::time::sleep(poll) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!(worker_id, "worker shutting down");
                    break;
                }
            }
        }
        drain_due(&scheduler, worker_id).await;
    }
}

/// Claim-and-execute the currently-due runs, one pass. Lost claims (another
/// worker, or a run blocked behind a healthy running generation) are silent;
/// real errors are logged and the loop moves on — one poisoned conversation
/// must not stall the rest. Follow-up work re-arms via kick.
async fn drain_due(scheduler: &Arc<Scheduler>, worker_id: usize) {
    let due = match scheduler.runs.due_queued(Utc::now(), 8) {
        Ok(runs) => runs,
        Err(e) => {
            error!(worker_id, error = %e, "due-run query failed");
            return;
        }
    };
    for run in due {
        if let Err(e) = scheduler.execute_run(&run.id).await {
            error!(worker_id, run = %run.id, error = %e, "run execution failed");
        }
    }
}
