//! Generation attempt orchestration.
//!
//! One attempt walks a fixed sequence: wait for a provider slot, submit
//! the request, poll until the provider finishes, persist the result.
//! Every step classifies its failures into one of two buckets. Quota
//! exhaustion, provider-side rejection, malformed responses and an
//! exhausted poll budget are permanent; everything else (slot
//! contention, rate limiting, upstream hiccups, network faults) asks
//! the queue for another attempt.
//!
//! The slot is held through a [`SlotGuard`], so an attempt that gets
//! aborted by the hard time limit or revoked mid-poll still frees the
//! slot when its future is dropped.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use mureka_client::{
    GenerationClient, MurekaError, PollIntervals, ProviderStatus, RateLimitKind,
    adaptive_poll_interval, classify_rate_limit, clean_response,
};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::kernel::SlotManager;
use crate::kernel::jobs::{AttemptOutcome, JobContext, JobQueue};

use super::model::SongStatus;
use super::store::SongStore;

/// Tuning knobs for one orchestrator instance.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// How long an attempt may wait for a provider slot.
    pub slot_max_wait: Duration,
    /// Delay before a retry attempt when the provider pushes back.
    pub retry_delay: Duration,
    /// Poll budget per attempt.
    pub max_poll_attempts: u32,
    /// Adaptive status-poll intervals.
    pub poll_intervals: PollIntervals,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            slot_max_wait: Duration::from_secs(3600),
            retry_delay: Duration::from_secs(60),
            max_poll_attempts: 240,
            poll_intervals: PollIntervals::default(),
        }
    }
}

/// How a failed provider call affects the attempt.
///
/// The recoverable variants carry the provider's `Retry-After` hint
/// when one was sent; it takes precedence over configured delays.
enum FailureAction {
    /// Unrecoverable. The song fails now, regardless of retry budget.
    Terminal(String),
    /// Recoverable by a fresh attempt later.
    NextAttempt {
        reason: String,
        retry_after: Option<Duration>,
    },
    /// Recoverable within this attempt by waiting longer than usual.
    Backoff {
        reason: String,
        retry_after: Option<Duration>,
    },
}

fn classify_provider_error(err: &MurekaError) -> FailureAction {
    match err {
        MurekaError::Api {
            body, retry_after, ..
        } if err.is_too_many_requests() => match classify_rate_limit(body) {
            RateLimitKind::Quota => {
                FailureAction::Terminal(format!("API quota exhausted: {body}"))
            }
            RateLimitKind::RateLimit => FailureAction::Backoff {
                reason: format!("rate limited: {body}"),
                retry_after: retry_after.map(Duration::from_secs),
            },
        },
        MurekaError::Api { retry_after, .. } if err.is_transient_infra() => {
            FailureAction::Backoff {
                reason: format!("upstream unavailable: {err}"),
                retry_after: retry_after.map(Duration::from_secs),
            }
        }
        MurekaError::Api { .. } => FailureAction::Terminal(err.to_string()),
        MurekaError::Network(_) => FailureAction::NextAttempt {
            reason: err.to_string(),
            retry_after: None,
        },
        MurekaError::Config(_) | MurekaError::Parse(_) => FailureAction::Terminal(err.to_string()),
    }
}

/// Drives a single generation job kind (song or instrumental) through
/// its full lifecycle. The job kind is entirely determined by the
/// injected client; the orchestration logic is identical for both.
pub struct GenerationOrchestrator {
    client: Arc<dyn GenerationClient>,
    store: Arc<dyn SongStore>,
    slots: Arc<SlotManager>,
    queue: Arc<dyn JobQueue>,
    settings: OrchestratorSettings,
}

impl GenerationOrchestrator {
    pub fn new(
        client: Arc<dyn GenerationClient>,
        store: Arc<dyn SongStore>,
        slots: Arc<SlotManager>,
        queue: Arc<dyn JobQueue>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            client,
            store,
            slots,
            queue,
            settings,
        }
    }

    /// Run one generation attempt end to end.
    ///
    /// Returns the outcome the job runner should apply. All song-row
    /// writes happen here; the runner only touches queue state.
    pub async fn run_attempt(
        &self,
        ctx: JobContext,
        task_id: Uuid,
        payload: &Value,
    ) -> Result<AttemptOutcome> {
        info!(
            task_id = %task_id,
            job_id = %ctx.job_id,
            attempt = ctx.attempt,
            "generation attempt starting"
        );

        // Phase 1: wait for a provider slot.
        self.snapshot(ctx, task_id, json!({ "phase": "waiting_for_slot" }))
            .await;

        let holder_id = task_id.to_string();
        let Some(_slot) = self
            .slots
            .wait_acquire_owned(&holder_id, self.settings.slot_max_wait)
            .await
        else {
            // A holder far past the task time limit indicates a
            // leaked slot.
            warn!(
                task_id = %task_id,
                oldest_holder_secs = self.slots.oldest_holder_age().map(|a| a.as_secs()),
                "no provider slot became available"
            );
            return self
                .transient_failure(
                    ctx,
                    task_id,
                    format!(
                        "no provider slot within {}s",
                        self.settings.slot_max_wait.as_secs()
                    ),
                    None,
                )
                .await;
        };

        self.snapshot(ctx, task_id, json!({ "phase": "slot_acquired" }))
            .await;

        // Phase 2: submit.
        let submission = match self.client.submit(payload).await {
            Ok(submission) => submission,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "generation submission failed");
                return self.handle_failure(ctx, task_id, &e).await;
            }
        };

        info!(
            task_id = %task_id,
            provider_job_id = %submission.job_id,
            "generation submitted"
        );

        if let Err(e) = self
            .store
            .transition(
                task_id,
                SongStatus::Progress,
                Some(json!({ "phase": "generation_started" })),
                Some(&submission.job_id),
            )
            .await
        {
            error!(task_id = %task_id, error = %e, "failed to persist submission");
        }

        // Phase 3: poll until the provider finishes.
        self.poll_until_complete(ctx, task_id, &submission.job_id)
            .await
    }

    async fn poll_until_complete(
        &self,
        ctx: JobContext,
        task_id: Uuid,
        provider_job_id: &str,
    ) -> Result<AttemptOutcome> {
        let started = tokio::time::Instant::now();
        let mut poll_attempt = 0u32;

        // Check first; sleep only while still in progress.
        while poll_attempt < self.settings.max_poll_attempts {
            poll_attempt += 1;

            let status = match self.client.check_status(provider_job_id).await {
                Ok(status) => status,
                Err(e) => match classify_provider_error(&e) {
                    FailureAction::Terminal(error) => {
                        warn!(task_id = %task_id, error, "polling hit permanent error");
                        return self.terminal_failure(task_id, error).await;
                    }
                    FailureAction::Backoff {
                        reason,
                        retry_after,
                    } => {
                        let interval = retry_after.unwrap_or_else(|| {
                            adaptive_poll_interval(&self.settings.poll_intervals, started.elapsed())
                        });
                        debug!(
                            task_id = %task_id,
                            poll_attempt,
                            reason,
                            backoff_secs = interval.as_secs(),
                            "transient poll error, backing off"
                        );
                        tokio::time::sleep(interval).await;
                        continue;
                    }
                    FailureAction::NextAttempt {
                        reason,
                        retry_after,
                    } => {
                        warn!(task_id = %task_id, reason, "polling lost the provider");
                        return self
                            .transient_failure(ctx, task_id, reason, retry_after)
                            .await;
                    }
                },
            };

            match status.status() {
                ProviderStatus::Succeeded => {
                    let cleaned = clean_response(&status.raw);
                    let song = self.store.record_success(task_id, &cleaned).await?;
                    info!(
                        task_id = %task_id,
                        song_id = %song.id,
                        polls = poll_attempt,
                        elapsed_secs = started.elapsed().as_secs(),
                        "generation succeeded"
                    );

                    // The queue row carries no state worth keeping once
                    // the song row is terminal.
                    if let Err(e) = self.queue.forget(ctx.job_id).await {
                        warn!(job_id = %ctx.job_id, error = %e, "queue cleanup failed");
                    }

                    return Ok(AttemptOutcome::Completed);
                }
                ProviderStatus::Failed | ProviderStatus::Cancelled => {
                    let reason = status
                        .failed_reason()
                        .unwrap_or("generation failed on the provider side")
                        .to_string();
                    warn!(task_id = %task_id, reason, "provider reported failure");
                    return self
                        .terminal_failure(task_id, format!("provider failure: {reason}"))
                        .await;
                }
                ProviderStatus::InProgress(state) => {
                    let interval =
                        adaptive_poll_interval(&self.settings.poll_intervals, started.elapsed());
                    debug!(
                        task_id = %task_id,
                        poll_attempt,
                        provider_status = %state,
                        poll_interval_secs = interval.as_secs(),
                        "generation in progress"
                    );
                    self.snapshot(
                        ctx,
                        task_id,
                        json!({
                            "phase": "polling",
                            "poll_attempt": poll_attempt,
                            "poll_interval_secs": interval.as_secs(),
                            "provider_status": state,
                            "progress": status.progress(),
                            "elapsed_secs": started.elapsed().as_secs(),
                        }),
                    )
                    .await;
                    tokio::time::sleep(interval).await;
                }
            }
        }

        // Resubmitting after a full polling window would queue a second
        // generation behind the stuck one, so this is terminal.
        self.terminal_failure(
            task_id,
            format!(
                "no result after {} poll attempts",
                self.settings.max_poll_attempts
            ),
        )
        .await
    }

    /// Record a progress snapshot on both the song row and the queue
    /// row. Failures are logged, never fatal to the attempt.
    async fn snapshot(&self, ctx: JobContext, task_id: Uuid, progress: Value) {
        if let Err(e) = self
            .store
            .transition(task_id, SongStatus::Progress, Some(progress.clone()), None)
            .await
        {
            error!(task_id = %task_id, error = %e, "failed to persist progress");
        }
        if let Err(e) = self.queue.update_progress(ctx.job_id, progress).await {
            debug!(job_id = %ctx.job_id, error = %e, "failed to update queue progress");
        }
    }

    async fn handle_failure(
        &self,
        ctx: JobContext,
        task_id: Uuid,
        err: &MurekaError,
    ) -> Result<AttemptOutcome> {
        match classify_provider_error(err) {
            FailureAction::Terminal(error) => self.terminal_failure(task_id, error).await,
            // At submission time a backoff-able error ends the attempt;
            // resubmitting within the same attempt would double-submit.
            FailureAction::Backoff {
                reason,
                retry_after,
            }
            | FailureAction::NextAttempt {
                reason,
                retry_after,
            } => self.transient_failure(ctx, task_id, reason, retry_after).await,
        }
    }

    /// Terminal failure for an attempt cut short by the soft time
    /// limit. The attempt future is about to be dropped, so this is the
    /// last chance to leave the song row in a terminal state.
    pub async fn fail_timed_out(&self, task_id: Uuid) -> Result<AttemptOutcome> {
        self.terminal_failure(task_id, "task timeout exceeded".to_string())
            .await
    }

    /// Fail the song now. Ignores any remaining retry budget.
    async fn terminal_failure(&self, task_id: Uuid, error: String) -> Result<AttemptOutcome> {
        self.store.record_failure(task_id, &error).await?;
        Ok(AttemptOutcome::Failed { error })
    }

    /// End the attempt with a transient error. Moves the song to
    /// `retrying` while budget remains; otherwise this failure is
    /// terminal for the song as well. The provider's `Retry-After`
    /// overrides the configured retry delay.
    async fn transient_failure(
        &self,
        ctx: JobContext,
        task_id: Uuid,
        reason: String,
        retry_after: Option<Duration>,
    ) -> Result<AttemptOutcome> {
        if ctx.attempts_remaining > 0 {
            self.store.record_retrying(task_id, &reason).await?;
            let delay = retry_after.unwrap_or(self.settings.retry_delay);
            Ok(AttemptOutcome::retry(delay, reason))
        } else {
            self.store
                .record_failure(task_id, &format!("retries exhausted: {reason}"))
                .await?;
            Ok(AttemptOutcome::Failed {
                error: format!("retries exhausted: {reason}"),
            })
        }
    }
}
