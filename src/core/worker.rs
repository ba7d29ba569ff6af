//! Bounded pool of workers executing queued runs.
//!
//! Run ids arrive on an mpsc channel; each is handed to the [`JobRunner`]
//! on its own task, with a semaphore capping how many run at once.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::job::JobRunner;

/// Totals after a pool drains its queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub completed: usize,
    pub failed: usize,
}

impl PoolReport {
    pub fn total(&self) -> usize {
        self.completed + self.failed
    }
}

/// Executes queued runs with bounded concurrency
pub struct WorkerPool {
    runner: JobRunner,
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(runner: JobRunner, concurrency: usize) -> Self {
        Self {
            runner,
            concurrency: concurrency.max(1),
        }
    }

    /// Queue with room for `capacity` pending ids
    pub fn queue(capacity: usize) -> (mpsc::Sender<Uuid>, mpsc::Receiver<Uuid>) {
        mpsc::channel(capacity.max(1))
    }

    /// Consume run ids until the channel closes, then wait for in-flight
    /// jobs to finish.
    pub async fn run(&self, mut queue: mpsc::Receiver<Uuid>) -> PoolReport {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut jobs = JoinSet::new();
        let mut report = PoolReport::default();

        info!(concurrency = self.concurrency, "Worker pool started");

        while let Some(run_id) = queue.recv().await {
            let permit = match permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let runner = self.runner.clone();

            debug!(workflow_run_id = %run_id, "Dispatching run");
            jobs.spawn(async move {
                let result = runner.run(run_id).await;
                drop(permit);
                result.is_ok()
            });

            // Reap whatever already finished so the set does not grow unbounded
            while let Some(done) = jobs.try_join_next() {
                tally(&mut report, done);
            }
        }

        while let Some(done) = jobs.join_next().await {
            tally(&mut report, done);
        }

        info!(
            completed = report.completed,
            failed = report.failed,
            "Worker pool drained"
        );
        report
    }
}

fn tally(report: &mut PoolReport, done: Result<bool, tokio::task::JoinError>) {
    match done {
        Ok(true) => report.completed += 1,
        Ok(false) => report.failed += 1,
        Err(e) => {
            error!(error = %e, "Worker task panicked");
            report.failed += 1;
        }
    }
}
