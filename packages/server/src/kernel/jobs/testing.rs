//! In-memory job queue for tests.
//!
//! Mirrors the PostgreSQL queue semantics (claim ordering, retry rows,
//! dead-lettering) without a database, so orchestration tests run
//! against the same [`JobQueue`] trait the production wiring uses.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::job::{ErrorKind, Job, JobStatus};
use super::queue::{ClaimedJob, EnqueueResult, EnqueueSpec, FailureDisposition, JobQueue};

/// In-memory [`JobQueue`] implementation for tests.
pub struct InMemoryJobQueue {
    jobs: Mutex<HashMap<Uuid, Job>>,
    default_lease_ms: i64,
    default_retry_delay: Duration,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            default_lease_ms: 60_000,
            default_retry_delay: Duration::from_secs(60),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// All job rows, including terminal and retry rows.
    pub fn jobs(&self) -> Vec<Job> {
        self.lock().values().cloned().collect()
    }

    /// Snapshot a single job row.
    pub fn snapshot(&self, job_id: Uuid) -> Option<Job> {
        self.lock().get(&job_id).cloned()
    }

    /// Clear scheduling delays so retry rows become claimable now.
    pub fn make_all_ready(&self) {
        let mut jobs = self.lock();
        for job in jobs.values_mut() {
            if job.status == JobStatus::Pending {
                job.next_run_at = None;
            }
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue_raw(
        &self,
        job_type: &str,
        args: serde_json::Value,
        spec: EnqueueSpec,
    ) -> Result<EnqueueResult> {
        let mut jobs = self.lock();

        if let Some(key) = &spec.idempotency_key {
            let existing = jobs.values().find(|j| {
                j.idempotency_key.as_deref() == Some(key.as_str())
                    && matches!(j.status, JobStatus::Pending | JobStatus::Running)
            });
            if let Some(existing) = existing {
                return Ok(EnqueueResult::Duplicate(existing.id));
            }
        }

        let job = Job::for_command(
            job_type,
            args,
            spec.run_at,
            spec.idempotency_key,
            spec.priority,
            spec.max_retries,
            spec.timeout_ms,
            self.default_lease_ms,
        );

        let id = job.id;
        jobs.insert(id, job);
        Ok(EnqueueResult::Created(id))
    }

    async fn claim(&self, worker_id: &str, limit: i64) -> Result<Vec<ClaimedJob>> {
        let mut jobs = self.lock();
        let now = Utc::now();

        let mut ready: Vec<Uuid> = jobs
            .values()
            .filter(|j| {
                j.is_ready()
                    || (j.status == JobStatus::Running
                        && j.lease_expires_at.is_some_and(|t| t < now))
            })
            .map(|j| j.id)
            .collect();

        ready.sort_by_key(|id| {
            let j = &jobs[id];
            (j.priority, j.next_run_at.unwrap_or(j.created_at))
        });
        ready.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(ready.len());
        for id in ready {
            if let Some(job) = jobs.get_mut(&id) {
                job.status = JobStatus::Running;
                job.last_run_at = job.last_run_at.or(Some(now));
                job.lease_expires_at =
                    Some(now + chrono::Duration::milliseconds(job.lease_duration_ms));
                job.worker_id = Some(worker_id.to_string());
                job.updated_at = now;
                claimed.push(ClaimedJob {
                    id,
                    job: job.clone(),
                });
            }
        }

        Ok(claimed)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.lock().get(&job_id).cloned())
    }

    async fn mark_succeeded(&self, job_id: Uuid) -> Result<()> {
        let mut jobs = self.lock();
        if let Some(job) = jobs.get_mut(&job_id) {
            job.status = JobStatus::Succeeded;
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        error: &str,
        kind: ErrorKind,
        retry_delay: Option<Duration>,
    ) -> Result<FailureDisposition> {
        let mut jobs = self.lock();
        let job = jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| anyhow!("job {} not found", job_id))?;

        if kind.should_retry() && job.retry_count < job.max_retries {
            let delay = retry_delay.unwrap_or(self.default_retry_delay);
            let retry_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(60));
            let retry_job = job.create_retry(retry_at);
            let retry_id = retry_job.id;
            jobs.insert(retry_id, retry_job);

            if let Some(job) = jobs.get_mut(&job_id) {
                job.status = JobStatus::Failed;
                job.error_message = Some(error.to_string());
                job.error_kind = Some(kind);
                job.updated_at = Utc::now();
            }

            Ok(FailureDisposition::RetryScheduled {
                retry_job_id: retry_id,
                run_at: retry_at,
            })
        } else {
            if let Some(job) = jobs.get_mut(&job_id) {
                job.status = JobStatus::DeadLetter;
                job.error_message = Some(error.to_string());
                job.error_kind = Some(kind);
                job.dead_lettered_at = Some(Utc::now());
                job.dead_letter_reason = Some(
                    if kind.should_retry() {
                        "max retries exceeded"
                    } else {
                        "non-retryable error"
                    }
                    .to_string(),
                );
                job.updated_at = Utc::now();
            }

            Ok(FailureDisposition::DeadLettered)
        }
    }

    async fn mark_cancelled(&self, job_id: Uuid) -> Result<()> {
        let mut jobs = self.lock();
        if let Some(job) = jobs.get_mut(&job_id) {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Cancelled;
                job.error_kind = Some(ErrorKind::Cancelled);
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn update_progress(&self, job_id: Uuid, progress: serde_json::Value) -> Result<()> {
        let mut jobs = self.lock();
        if let Some(job) = jobs.get_mut(&job_id) {
            if job.status == JobStatus::Running {
                job.progress = Some(progress);
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let mut jobs = self.lock();
        if let Some(job) = jobs.get_mut(&job_id) {
            if job.status == JobStatus::Pending {
                job.status = JobStatus::Cancelled;
                job.error_kind = Some(ErrorKind::Cancelled);
                job.updated_at = Utc::now();
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn forget(&self, job_id: Uuid) -> Result<()> {
        self.lock().remove(&job_id);
        Ok(())
    }

    async fn heartbeat(&self, job_id: Uuid) -> Result<()> {
        let mut jobs = self.lock();
        if let Some(job) = jobs.get_mut(&job_id) {
            if job.status == JobStatus::Running {
                job.lease_expires_at =
                    Some(Utc::now() + chrono::Duration::milliseconds(self.default_lease_ms));
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }
}
