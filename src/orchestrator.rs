//! Batch execution of jobs, sequentially or over a bounded worker pool.
//!
//! The orchestrator owns the shared per-run state, drains a queue of
//! ready jobs and turns every job into exactly one report record: a full
//! analysis when the tool ran, or a minimal error record when it could
//! not. A panicking or erroring job never takes the batch down with it.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::backend::ToolPresenceCache;
use crate::cancel::CancellationToken;
use crate::error::ConfigError;
use crate::job::Job;
use crate::report::{ProgramRecord, Report};

/// Shared per-run state handed to every job: the id counter feeding
/// unique container names and the per-image tool-presence cache. Owned
/// by a run so separate runs in one process never interfere.
#[derive(Debug, Default)]
pub struct RunContext {
    next_job_id: AtomicU64,
    tool_presence: ToolPresenceCache,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_job_id(&self) -> u64 {
        self.next_job_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn tool_presence(&self) -> ToolPresenceCache {
        Arc::clone(&self.tool_presence)
    }
}

/// Lifecycle state of a batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Cancelled,
}

/// A finished batch: the final state plus the collected report.
#[derive(Debug)]
pub struct BatchRun {
    pub state: RunState,
    pub report: Report,
}

impl BatchRun {
    /// Process exit status for batch drivers: 0 when every job produced
    /// a result, 1 when any job errored unexpectedly, 2 when the run was
    /// cancelled.
    pub fn exit_code(&self) -> i32 {
        if self.state == RunState::Cancelled {
            2
        } else if self.report.error_count() > 0 {
            1
        } else {
            0
        }
    }
}

pub struct Orchestrator {
    jobs: Vec<Job>,
    parallelism: usize,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// `cancel` must be the same token the jobs were built with, so one
    /// trigger both stops the queue and kills in-flight backends.
    pub fn new(
        jobs: Vec<Job>,
        parallelism: usize,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigError> {
        if parallelism == 0 {
            return Err(ConfigError::InvalidParallelism);
        }
        Ok(Self {
            jobs,
            parallelism,
            cancel,
        })
    }

    /// Token that cancels this run: unstarted jobs never begin,
    /// in-flight backends are killed, finished records are kept.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drains every job and assembles the report. Consumes the
    /// orchestrator; a batch runs once.
    pub async fn run(mut self) -> BatchRun {
        let total = self.jobs.len();
        info!(total, parallelism = self.parallelism, "starting batch");

        let records = if self.parallelism == 1 {
            self.run_sequential().await
        } else {
            self.run_parallel().await
        };

        let state = if self.cancel.is_cancelled() {
            RunState::Cancelled
        } else {
            RunState::Completed
        };
        info!(?state, collected = records.len(), total, "batch finished");
        BatchRun {
            state,
            report: Report::new(records),
        }
    }

    async fn run_sequential(&mut self) -> Vec<ProgramRecord> {
        let jobs = std::mem::take(&mut self.jobs);
        let total = jobs.len();
        let mut records = Vec::with_capacity(total);
        for job in jobs {
            if self.cancel.is_cancelled() {
                warn!(
                    remaining = total - records.len(),
                    "run cancelled, skipping remaining jobs"
                );
                break;
            }
            records.push(execute_job(job).await);
            info!(completed = records.len(), total, "batch progress");
        }
        records
    }

    async fn run_parallel(&mut self) -> Vec<ProgramRecord> {
        let total = self.jobs.len();
        let queue: Arc<Mutex<VecDeque<Job>>> =
            Arc::new(Mutex::new(self.jobs.drain(..).collect()));
        let records = Arc::new(Mutex::new(Vec::with_capacity(total)));

        let mut workers = Vec::with_capacity(self.parallelism);
        for worker_id in 0..self.parallelism {
            let queue = Arc::clone(&queue);
            let records = Arc::clone(&records);
            let cancel = self.cancel.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let job = queue.lock().await.pop_front();
                    let Some(job) = job else { break };
                    let record = execute_job(job).await;
                    let mut records = records.lock().await;
                    records.push(record);
                    info!(worker = worker_id, completed = records.len(), total, "batch progress");
                }
            }));
        }
        for worker in workers {
            if let Err(err) = worker.await {
                error!(error = %err, "worker task failed");
            }
        }

        match Arc::try_unwrap(records) {
            Ok(records) => records.into_inner(),
            // a failed worker may still hold a clone; fall back to copying
            Err(records) => records.lock().await.clone(),
        }
    }
}

/// Runs one job, converting errors and panics into an error record keyed
/// by program path so the rest of the batch keeps going.
async fn execute_job(job: Job) -> ProgramRecord {
    let program = job.program().to_path_buf();
    match std::panic::AssertUnwindSafe(job.run()).catch_unwind().await {
        Ok(Ok(result)) => ProgramRecord::completed(result),
        Ok(Err(err)) if err.is_cancellation() => {
            warn!(program = %program.display(), "job cancelled mid-run");
            ProgramRecord::error(program, "cancelled")
        }
        Ok(Err(err)) => {
            error!(program = %program.display(), error = %err, "job failed unexpectedly");
            ProgramRecord::error(program, err.to_string())
        }
        Err(panic) => {
            let message = panic_message(panic);
            error!(program = %program.display(), panic = %message, "job panicked");
            ProgramRecord::error(program, format!("panic: {message}"))
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
