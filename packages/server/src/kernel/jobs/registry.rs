//! Registry mapping job types to handler functions.
//!
//! Handlers are async closures that capture their dependencies
//! (clients, stores, slot manager) and receive the deserialized
//! command plus a [`JobContext`]. The registry owns deserialization,
//! so an unknown job type or a malformed payload becomes a permanent
//! failure before any handler runs.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use serde::de::DeserializeOwned;
use tracing::error;

use super::outcome::AttemptOutcome;
use super::queue::{ClaimedJob, JobContext};

type BoxedHandler = Box<
    dyn Fn(JobContext, serde_json::Value) -> Pin<Box<dyn Future<Output = Result<AttemptOutcome>> + Send>>
        + Send
        + Sync,
>;

/// Maps job types to their handlers.
#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<&'static str, BoxedHandler>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job type.
    ///
    /// The handler receives the execution context and the command
    /// deserialized from the job's args.
    pub fn register<C, F, Fut>(&mut self, job_type: &'static str, handler: F)
    where
        C: DeserializeOwned + Send + 'static,
        F: Fn(JobContext, C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<AttemptOutcome>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.handlers.insert(
            job_type,
            Box::new(move |ctx, args| {
                let handler = Arc::clone(&handler);
                Box::pin(async move {
                    let command: C = serde_json::from_value(args)?;
                    handler(ctx, command).await
                })
            }),
        );
    }

    /// Whether a handler is registered for the given job type.
    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Execute the handler for a claimed job.
    ///
    /// Unknown job types and missing/invalid payloads are reported as
    /// permanent failures, never as retryable errors.
    pub async fn execute(&self, claimed: &ClaimedJob) -> Result<AttemptOutcome> {
        let job_type = claimed.command_type();

        let Some(handler) = self.handlers.get(job_type) else {
            error!(job_id = %claimed.id, job_type, "no handler registered for job type");
            return Ok(AttemptOutcome::failed(format!(
                "unknown job type: {job_type}"
            )));
        };

        let Some(args) = claimed.job.args.clone() else {
            return Ok(AttemptOutcome::failed("job has no args"));
        };

        match handler(claimed.context(), args).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // Deserialization errors surface here as serde_json errors;
                // a payload that does not parse will never parse on retry.
                if e.downcast_ref::<serde_json::Error>().is_some() {
                    return Ok(AttemptOutcome::failed(format!("invalid payload: {e}")));
                }
                Err(e)
            }
        }
    }
}
