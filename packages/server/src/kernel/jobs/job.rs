//! Job model for background task execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    DeadLetter,
    Cancelled,
}

impl JobStatus {
    /// Whether the queue will never run this job again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::DeadLetter | JobStatus::Cancelled
        )
    }
}

/// Declaration order doubles as claim order, matching the database
/// enum ordering used by `ORDER BY priority`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type, Default,
)]
#[sqlx(type_name = "job_priority", rename_all = "snake_case")]
pub enum JobPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "error_kind", rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient error - will retry if attempts remain
    #[default]
    Retryable,
    /// Permanent error - will not retry
    NonRetryable,
    /// Job was cancelled by user/system
    Cancelled,
    /// Job was interrupted by graceful shutdown - will retry
    Shutdown,
}

impl ErrorKind {
    /// Whether this error kind should trigger a retry
    pub fn should_retry(&self) -> bool {
        matches!(self, ErrorKind::Retryable | ErrorKind::Shutdown)
    }
}

// ============================================================================
// Job Model
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    pub job_type: String,

    // Payload
    #[builder(default, setter(strip_option))]
    pub args: Option<serde_json::Value>,

    // State
    #[builder(default)]
    pub status: JobStatus,
    #[builder(default)]
    pub priority: JobPriority,

    // Execution settings
    #[builder(default = 3)]
    pub max_retries: i32,
    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default = 1)]
    pub attempt: i32,
    #[builder(default = 1_800_000)] // 30 minutes
    pub timeout_ms: i64,

    // Scheduling
    #[builder(default, setter(strip_option))]
    pub next_run_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_run_at: Option<DateTime<Utc>>,

    // Lease management
    #[builder(default = 60_000)] // 1 minute
    pub lease_duration_ms: i64,
    #[builder(default, setter(strip_option))]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,

    // Progress metadata, read by the status endpoint while running
    #[builder(default, setter(strip_option))]
    pub progress: Option<serde_json::Value>,

    // Error tracking
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,
    #[builder(default, setter(strip_option))]
    pub error_kind: Option<ErrorKind>,

    // Dead letter workflow
    #[builder(default, setter(strip_option))]
    pub dead_lettered_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub dead_letter_reason: Option<String>,

    // Retry chain tracing
    #[builder(default, setter(strip_option))]
    pub root_job_id: Option<Uuid>,

    // Idempotency
    #[builder(default, setter(strip_option))]
    pub idempotency_key: Option<String>,

    // Timestamps
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a job for a serialized command.
    pub fn for_command(
        job_type: &str,
        args: serde_json::Value,
        run_at: Option<DateTime<Utc>>,
        idempotency_key: Option<String>,
        priority: JobPriority,
        max_retries: i32,
        timeout_ms: i64,
        lease_duration_ms: i64,
    ) -> Self {
        Self::builder()
            .job_type(job_type.to_string())
            .args(args)
            .priority(priority)
            .max_retries(max_retries)
            .timeout_ms(timeout_ms)
            .lease_duration_ms(lease_duration_ms)
            .build()
            .with_run_at(run_at)
            .with_idempotency_key(idempotency_key)
    }

    fn with_run_at(mut self, run_at: Option<DateTime<Utc>>) -> Self {
        self.next_run_at = run_at;
        self
    }

    fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    /// Check if the job is ready to run
    pub fn is_ready(&self) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }

        match self.next_run_at {
            None => true,
            Some(next_run) => next_run <= Utc::now(),
        }
    }

    /// How many more attempts the queue will grant after this one.
    pub fn attempts_remaining(&self) -> i32 {
        (self.max_retries - self.retry_count).max(0)
    }

    /// Create a retry job from a failed job
    pub fn create_retry(&self, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: self.job_type.clone(),
            args: self.args.clone(),
            status: JobStatus::Pending,
            priority: self.priority,
            max_retries: self.max_retries,
            retry_count: self.retry_count + 1,
            attempt: self.attempt + 1,
            timeout_ms: self.timeout_ms,
            next_run_at: Some(scheduled_for),
            last_run_at: None,
            lease_duration_ms: self.lease_duration_ms,
            lease_expires_at: None,
            worker_id: None,
            progress: self.progress.clone(),
            error_message: None,
            error_kind: None,
            dead_lettered_at: None,
            dead_letter_reason: None,
            root_job_id: self.root_job_id.or(Some(self.id)),
            idempotency_key: self.idempotency_key.clone(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
