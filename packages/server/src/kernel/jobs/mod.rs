//! Durable background job execution.
//!
//! Jobs are rows in PostgreSQL. Producers enqueue serialized commands
//! through [`JobQueue`], the [`JobRunner`] claims ready rows with
//! `FOR UPDATE SKIP LOCKED`, and the [`JobRegistry`] dispatches each
//! one to its handler. Handlers return an [`AttemptOutcome`] that the
//! runner maps onto retry rows or dead-lettering.

pub mod job;
pub mod outcome;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod testing;

pub use job::{ErrorKind, Job, JobPriority, JobStatus};
pub use outcome::{AttemptOutcome, RetryDecision};
pub use queue::{
    ClaimedJob, CommandMeta, EnqueueResult, EnqueueSpec, FailureDisposition, JobContext, JobQueue,
    JobQueueExt, PostgresJobQueue,
};
pub use registry::JobRegistry;
pub use runner::{JobRunner, JobRunnerConfig, RunnerHandle};
