//! PostgreSQL-backed job queue implementation.
//!
//! This module provides the core job queue functionality for storing
//! and retrieving jobs from PostgreSQL.

use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use super::job::{ErrorKind, Job, JobPriority};

const JOB_COLUMNS: &str = r#"
    id, job_type, args, status, priority, max_retries, retry_count, attempt,
    timeout_ms, next_run_at, last_run_at, lease_duration_ms, lease_expires_at,
    worker_id, progress, error_message, error_kind, dead_lettered_at,
    dead_letter_reason, root_job_id, idempotency_key, created_at, updated_at
"#;

/// Result type for enqueue operations that handles idempotency.
#[derive(Debug, Clone)]
pub enum EnqueueResult {
    /// Command was enqueued, returns new job ID
    Created(Uuid),
    /// Command already exists (idempotency hit), returns existing job ID
    Duplicate(Uuid),
}

impl EnqueueResult {
    /// Get the job ID regardless of whether it was created or duplicate
    pub fn job_id(&self) -> Uuid {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => *id,
        }
    }

    /// Returns true if this was a newly created job
    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// What `mark_failed` decided to do with the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    /// A retry row was created, scheduled for the given time.
    RetryScheduled { retry_job_id: Uuid, run_at: DateTime<Utc> },
    /// Retry budget exhausted or error non-retryable. Job is terminal.
    DeadLettered,
}

/// A claimed job ready for execution.
#[derive(Debug)]
pub struct ClaimedJob {
    /// The job ID
    pub id: Uuid,
    /// The raw job record
    pub job: Job,
}

impl ClaimedJob {
    /// Deserialize the command payload.
    pub fn deserialize<C: DeserializeOwned>(&self) -> Result<C> {
        let args = self
            .job
            .args
            .as_ref()
            .ok_or_else(|| anyhow!("job {} has no args", self.id))?;
        serde_json::from_value(args.clone())
            .map_err(|e| anyhow!("failed to deserialize command: {}", e))
    }

    /// Get the command type (job_type)
    pub fn command_type(&self) -> &str {
        &self.job.job_type
    }

    /// Execution context handed to the handler.
    pub fn context(&self) -> JobContext {
        JobContext {
            job_id: self.id,
            attempt: self.job.attempt,
            attempts_remaining: self.job.attempts_remaining(),
        }
    }
}

/// Per-attempt execution context passed to handlers.
#[derive(Debug, Clone, Copy)]
pub struct JobContext {
    pub job_id: Uuid,
    /// 1-based attempt number across the retry chain.
    pub attempt: i32,
    /// Attempts the queue will still grant after this one.
    pub attempts_remaining: i32,
}

/// Metadata for command serialization.
///
/// Commands should implement this trait to provide type information
/// and optional idempotency keys.
pub trait CommandMeta {
    /// The command type name (used as job_type).
    fn command_type(&self) -> &'static str;

    /// Optional idempotency key.
    ///
    /// If provided, ensures only one pending/running job exists with this key.
    fn idempotency_key(&self) -> Option<String> {
        None
    }

    /// Optional priority override.
    fn priority(&self) -> JobPriority {
        JobPriority::Normal
    }

    /// Maximum retries for this command.
    fn max_retries(&self) -> i32 {
        3
    }

    /// Hard execution time limit for this command.
    fn timeout_ms(&self) -> i64 {
        1_800_000
    }
}

/// Trait for job queue operations.
///
/// Implementations provide the storage and retrieval of serialized
/// commands for background execution. The trait is object-safe so the
/// orchestration layer can hold an `Arc<dyn JobQueue>`; typed enqueue
/// lives on [`JobQueueExt`].
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a serialized command payload.
    ///
    /// If `idempotency_key` matches a pending/running job, returns
    /// `EnqueueResult::Duplicate` with the existing job ID.
    async fn enqueue_raw(
        &self,
        job_type: &str,
        args: serde_json::Value,
        spec: EnqueueSpec,
    ) -> Result<EnqueueResult>;

    /// Claim up to `limit` jobs for processing.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` for concurrent-safe claiming and
    /// also recovers running jobs whose lease expired.
    async fn claim(&self, worker_id: &str, limit: i64) -> Result<Vec<ClaimedJob>>;

    /// Fetch a job by ID.
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// Mark a job as successfully completed.
    async fn mark_succeeded(&self, job_id: Uuid) -> Result<()>;

    /// Mark a job as failed with an error.
    ///
    /// If the error kind is retryable and retries remain, a retry row is
    /// created, scheduled `retry_delay` from now (default 60s).
    /// Otherwise the job is dead-lettered.
    async fn mark_failed(
        &self,
        job_id: Uuid,
        error: &str,
        kind: ErrorKind,
        retry_delay: Option<Duration>,
    ) -> Result<FailureDisposition>;

    /// Mark a running job as cancelled (revoked mid-flight).
    async fn mark_cancelled(&self, job_id: Uuid) -> Result<()>;

    /// Record progress metadata on a running job.
    async fn update_progress(&self, job_id: Uuid, progress: serde_json::Value) -> Result<()>;

    /// Cancel a pending job.
    ///
    /// Only cancels jobs in pending status. Running jobs should be
    /// cancelled via cooperative cancellation token.
    async fn cancel(&self, job_id: Uuid) -> Result<bool>;

    /// Delete a job's queue record entirely (post-success cleanup).
    async fn forget(&self, job_id: Uuid) -> Result<()>;

    /// Extend the lease for a running job (heartbeat).
    async fn heartbeat(&self, job_id: Uuid) -> Result<()>;
}

/// Non-default options for [`JobQueue::enqueue_raw`].
#[derive(Debug, Clone)]
pub struct EnqueueSpec {
    pub idempotency_key: Option<String>,
    pub priority: JobPriority,
    pub max_retries: i32,
    pub timeout_ms: i64,
    pub run_at: Option<DateTime<Utc>>,
}

impl Default for EnqueueSpec {
    fn default() -> Self {
        Self {
            idempotency_key: None,
            priority: JobPriority::Normal,
            max_retries: 3,
            timeout_ms: 1_800_000,
            run_at: None,
        }
    }
}

impl EnqueueSpec {
    /// Build a spec from a command's metadata.
    pub fn for_command<C: CommandMeta>(command: &C) -> Self {
        Self {
            idempotency_key: command.idempotency_key(),
            priority: command.priority(),
            max_retries: command.max_retries(),
            timeout_ms: command.timeout_ms(),
            run_at: None,
        }
    }
}

/// Typed enqueue helpers over any [`JobQueue`].
#[async_trait]
pub trait JobQueueExt: JobQueue {
    /// Enqueue a command for immediate execution.
    async fn enqueue<C>(&self, command: C) -> Result<EnqueueResult>
    where
        C: Serialize + Send + Sync + CommandMeta,
    {
        let spec = EnqueueSpec::for_command(&command);
        let args = serde_json::to_value(&command)?;
        self.enqueue_raw(command.command_type(), args, spec).await
    }

    /// Schedule a command for future execution.
    async fn schedule<C>(&self, command: C, run_at: DateTime<Utc>) -> Result<EnqueueResult>
    where
        C: Serialize + Send + Sync + CommandMeta,
    {
        let mut spec = EnqueueSpec::for_command(&command);
        spec.run_at = Some(run_at);
        let args = serde_json::to_value(&command)?;
        self.enqueue_raw(command.command_type(), args, spec).await
    }
}

impl<Q: JobQueue + ?Sized> JobQueueExt for Q {}

/// PostgreSQL-backed job queue implementation.
pub struct PostgresJobQueue {
    pool: PgPool,
    default_lease_ms: i64,
    default_retry_delay: Duration,
}

impl PostgresJobQueue {
    /// Create a new PostgreSQL job queue.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            default_lease_ms: 60_000, // 1 minute
            default_retry_delay: Duration::from_secs(60),
        }
    }

    /// Override the delay applied when `mark_failed` gets no explicit one.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.default_retry_delay = delay;
        self
    }

    /// Check if a job with the given idempotency key already exists.
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE idempotency_key = $1
              AND status IN ('pending', 'running')
            LIMIT 1
            "#
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn insert(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, job_type, args, status, priority, max_retries, retry_count,
                attempt, timeout_ms, next_run_at, last_run_at, lease_duration_ms,
                lease_expires_at, worker_id, progress, error_message, error_kind,
                dead_lettered_at, dead_letter_reason, root_job_id, idempotency_key,
                created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23
            )
            "#,
        )
        .bind(job.id)
        .bind(&job.job_type)
        .bind(&job.args)
        .bind(job.status)
        .bind(job.priority)
        .bind(job.max_retries)
        .bind(job.retry_count)
        .bind(job.attempt)
        .bind(job.timeout_ms)
        .bind(job.next_run_at)
        .bind(job.last_run_at)
        .bind(job.lease_duration_ms)
        .bind(job.lease_expires_at)
        .bind(&job.worker_id)
        .bind(&job.progress)
        .bind(&job.error_message)
        .bind(job.error_kind)
        .bind(job.dead_lettered_at)
        .bind(&job.dead_letter_reason)
        .bind(job.root_job_id)
        .bind(&job.idempotency_key)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, job_id: Uuid) -> Result<Job> {
        sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE id = $1
            "#
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| anyhow!("job {} not found", job_id))
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn enqueue_raw(
        &self,
        job_type: &str,
        args: serde_json::Value,
        spec: EnqueueSpec,
    ) -> Result<EnqueueResult> {
        // Check idempotency first
        if let Some(key) = &spec.idempotency_key {
            if let Some(existing) = self.find_by_idempotency_key(key).await? {
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

        self.insert(&job).await?;

        info!(job_id = %job.id, job_type, "job enqueued");
        Ok(EnqueueResult::Created(job.id))
    }

    async fn claim(&self, worker_id: &str, limit: i64) -> Result<Vec<ClaimedJob>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            WITH next_jobs AS (
                SELECT id
                FROM jobs
                WHERE
                    (status = 'pending' AND (next_run_at IS NULL OR next_run_at <= NOW()))
                    OR (status = 'running' AND lease_expires_at < NOW())
                ORDER BY priority, COALESCE(next_run_at, created_at)
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET
                status = 'running',
                last_run_at = COALESCE(last_run_at, NOW()),
                lease_expires_at = NOW() + ($2 || ' milliseconds')::INTERVAL,
                worker_id = $3,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_jobs)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(limit)
        .bind(self.default_lease_ms.to_string())
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs
            .into_iter()
            .map(|job| ClaimedJob { id: job.id, job })
            .collect())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE id = $1
            "#
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn mark_succeeded(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'succeeded',
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        error: &str,
        kind: ErrorKind,
        retry_delay: Option<Duration>,
    ) -> Result<FailureDisposition> {
        // Fetch current job state
        let job = self.find_by_id(job_id).await?;

        if kind.should_retry() && job.retry_count < job.max_retries {
            let delay = retry_delay.unwrap_or(self.default_retry_delay);
            let retry_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(60));

            let retry_job = job.create_retry(retry_at);
            self.insert(&retry_job).await?;

            // Mark original as failed
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'failed',
                    error_message = $1,
                    error_kind = $2,
                    updated_at = NOW()
                WHERE id = $3
                "#,
            )
            .bind(error)
            .bind(kind)
            .bind(job_id)
            .execute(&self.pool)
            .await?;

            info!(
                job_id = %job_id,
                retry_job_id = %retry_job.id,
                retry_at = %retry_at,
                attempt = retry_job.attempt,
                "job failed, retry scheduled"
            );

            Ok(FailureDisposition::RetryScheduled {
                retry_job_id: retry_job.id,
                run_at: retry_at,
            })
        } else {
            // No retries left - dead letter
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'dead_letter',
                    error_message = $1,
                    error_kind = $2,
                    dead_lettered_at = NOW(),
                    dead_letter_reason = $4,
                    updated_at = NOW()
                WHERE id = $3
                "#,
            )
            .bind(error)
            .bind(kind)
            .bind(job_id)
            .bind(if kind.should_retry() {
                "max retries exceeded"
            } else {
                "non-retryable error"
            })
            .execute(&self.pool)
            .await?;

            Ok(FailureDisposition::DeadLettered)
        }
    }

    async fn mark_cancelled(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled',
                error_kind = 'cancelled',
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_progress(&self, job_id: Uuid, progress: serde_json::Value) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET progress = $1,
                updated_at = NOW()
            WHERE id = $2 AND status = 'running'
            "#,
        )
        .bind(progress)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled',
                error_kind = 'cancelled',
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn forget(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn heartbeat(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = NOW() + ($1 || ' milliseconds')::INTERVAL,
                updated_at = NOW()
            WHERE id = $2 AND status = 'running'
            "#,
        )
        .bind(self.default_lease_ms.to_string())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
