//! Long-running worker that executes queued jobs.
//!
//! The runner polls the queue for ready jobs, dispatches them through
//! the [`JobRegistry`], and maps each [`AttemptOutcome`] onto a queue
//! state transition. While a job runs, a heartbeat task extends its
//! lease, and the job's future is raced against its hard time limit
//! and a per-job cancellation token. Losing either race drops the
//! attempt future, which releases any held resources (slot guards
//! included) through their destructors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::ErrorKind;
use super::outcome::AttemptOutcome;
use super::queue::{ClaimedJob, JobQueue};
use super::registry::JobRegistry;

/// Configuration for the job runner.
#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    /// Worker ID for this instance
    pub worker_id: String,
    /// Maximum number of jobs to claim at once.
    ///
    /// Runs at 1 in production so that slot waiting in one job never
    /// starves the worker loop.
    pub batch_size: i64,
    /// How long to wait when no jobs are available
    pub poll_interval: Duration,
    /// How often to extend the lease of running jobs
    pub heartbeat_interval: Duration,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            batch_size: 1,
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Worker loop driving job execution.
pub struct JobRunner {
    queue: Arc<dyn JobQueue>,
    registry: Arc<JobRegistry>,
    config: JobRunnerConfig,
    /// Track running jobs for revocation
    running_jobs: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
}

/// Clone-able handle for revoking jobs while the runner owns the loop.
#[derive(Clone)]
pub struct RunnerHandle {
    queue: Arc<dyn JobQueue>,
    running_jobs: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
}

impl RunnerHandle {
    /// Revoke a job.
    ///
    /// Pending jobs are cancelled in the queue. Running jobs are only
    /// interrupted when `terminate` is set; their attempt future is
    /// dropped at the next await point.
    pub async fn revoke(&self, job_id: Uuid, terminate: bool) -> Result<bool> {
        if self.queue.cancel(job_id).await? {
            info!(job_id = %job_id, "pending job cancelled");
            return Ok(true);
        }

        if terminate {
            if let Some(token) = self.running_jobs.read().await.get(&job_id) {
                token.cancel();
                info!(job_id = %job_id, "running job terminated");
                return Ok(true);
            }
        }

        Ok(false)
    }
}

impl JobRunner {
    pub fn new(queue: Arc<dyn JobQueue>, registry: Arc<JobRegistry>) -> Self {
        Self::with_config(queue, registry, JobRunnerConfig::default())
    }

    pub fn with_config(
        queue: Arc<dyn JobQueue>,
        registry: Arc<JobRegistry>,
        config: JobRunnerConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            config,
            running_jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Handle for revoking jobs from outside the worker loop.
    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            queue: Arc::clone(&self.queue),
            running_jobs: Arc::clone(&self.running_jobs),
        }
    }

    /// Run the worker loop until the token is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            worker_id = %self.config.worker_id,
            batch_size = self.config.batch_size,
            "job runner starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let jobs = match self
                .queue
                .claim(&self.config.worker_id, self.config.batch_size)
                .await
            {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(error = %e, "failed to claim jobs");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            debug!(count = jobs.len(), "claimed jobs");

            // Jobs run sequentially. With batch_size 1 this is the whole
            // concurrency story; a bigger batch would still serialize on
            // the provider slot.
            for job in jobs {
                self.process_job(job, &shutdown).await;
            }
        }

        info!(worker_id = %self.config.worker_id, "job runner stopped");
    }

    /// Run until ctrl-c, then drain.
    pub async fn run_until_shutdown(&self) -> Result<()> {
        let shutdown = CancellationToken::new();

        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                signal_token.cancel();
            }
        });

        self.run(shutdown).await;
        Ok(())
    }

    /// Process a single claimed job.
    async fn process_job(&self, claimed: ClaimedJob, shutdown: &CancellationToken) {
        let job_id = claimed.id;
        let job_type = claimed.command_type().to_string();
        let hard_limit = Duration::from_millis(claimed.job.timeout_ms.max(0) as u64);

        // Create cancellation token for this job
        let job_cancel = shutdown.child_token();
        {
            let mut running = self.running_jobs.write().await;
            running.insert(job_id, job_cancel.clone());
        }

        // Spawn heartbeat task
        let heartbeat_cancel = job_cancel.clone();
        let heartbeat_queue = Arc::clone(&self.queue);
        let heartbeat_interval = self.config.heartbeat_interval;
        let heartbeat_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = heartbeat_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = heartbeat_queue.heartbeat(job_id).await {
                            warn!(job_id = %job_id, error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        });

        enum RunResult {
            Outcome(Result<AttemptOutcome>),
            HardTimeout,
            Revoked,
        }

        // The attempt future is dropped when either alternate arm wins,
        // so a revoked or overrunning job cannot keep its slot.
        let run_result = tokio::select! {
            outcome = self.registry.execute(&claimed) => RunResult::Outcome(outcome),
            _ = tokio::time::sleep(hard_limit) => RunResult::HardTimeout,
            _ = job_cancel.cancelled() => RunResult::Revoked,
        };

        // Stop heartbeat
        job_cancel.cancel();
        let _ = heartbeat_handle.await;

        match run_result {
            RunResult::Outcome(Ok(AttemptOutcome::Completed)) => {
                debug!(job_id = %job_id, job_type = %job_type, "job succeeded");
                if let Err(e) = self.queue.mark_succeeded(job_id).await {
                    error!(job_id = %job_id, error = %e, "failed to mark job as succeeded");
                }
            }
            RunResult::Outcome(Ok(AttemptOutcome::Retry(decision))) => {
                warn!(
                    job_id = %job_id,
                    job_type = %job_type,
                    reason = %decision.reason,
                    delay_secs = decision.delay.as_secs(),
                    "job requested retry"
                );
                if let Err(e) = self
                    .queue
                    .mark_failed(
                        job_id,
                        &decision.reason,
                        ErrorKind::Retryable,
                        Some(decision.delay),
                    )
                    .await
                {
                    error!(job_id = %job_id, error = %e, "failed to mark job as failed");
                }
            }
            RunResult::Outcome(Ok(AttemptOutcome::Failed { error })) => {
                warn!(job_id = %job_id, job_type = %job_type, error = %error, "job failed permanently");
                if let Err(e) = self
                    .queue
                    .mark_failed(job_id, &error, ErrorKind::NonRetryable, None)
                    .await
                {
                    error!(job_id = %job_id, error = %e, "failed to mark job as failed");
                }
            }
            RunResult::Outcome(Err(e)) => {
                let kind = if shutdown.is_cancelled() {
                    ErrorKind::Shutdown
                } else {
                    ErrorKind::Retryable
                };
                warn!(job_id = %job_id, job_type = %job_type, error = %e, "job attempt errored");
                if let Err(e) = self
                    .queue
                    .mark_failed(job_id, &e.to_string(), kind, None)
                    .await
                {
                    error!(job_id = %job_id, error = %e, "failed to mark job as failed");
                }
            }
            RunResult::HardTimeout => {
                error!(
                    job_id = %job_id,
                    job_type = %job_type,
                    limit_secs = hard_limit.as_secs(),
                    "job exceeded hard time limit, aborted"
                );
                if let Err(e) = self
                    .queue
                    .mark_failed(
                        job_id,
                        "hard time limit exceeded",
                        ErrorKind::Retryable,
                        None,
                    )
                    .await
                {
                    error!(job_id = %job_id, error = %e, "failed to mark job as failed");
                }
            }
            RunResult::Revoked => {
                if shutdown.is_cancelled() {
                    // Graceful shutdown mid-attempt. Requeue rather than
                    // record a cancellation the operator never asked for.
                    warn!(job_id = %job_id, job_type = %job_type, "job interrupted by shutdown");
                    if let Err(e) = self
                        .queue
                        .mark_failed(job_id, "interrupted by shutdown", ErrorKind::Shutdown, None)
                        .await
                    {
                        error!(job_id = %job_id, error = %e, "failed to mark job as failed");
                    }
                } else {
                    info!(job_id = %job_id, job_type = %job_type, "job revoked");
                    if let Err(e) = self.queue.mark_cancelled(job_id).await {
                        error!(job_id = %job_id, error = %e, "failed to mark job as cancelled");
                    }
                }
            }
        }

        // Cleanup
        self.running_jobs.write().await.remove(&job_id);
    }
}
