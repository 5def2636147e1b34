//! Commands, enqueue service and handler wiring for the songs domain.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use mureka_client::{MurekaClient, MurekaError, StemResult};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::kernel::jobs::{
    AttemptOutcome, CommandMeta, EnqueueSpec, JobContext, JobQueue, JobRegistry,
};

use super::model::{SongStatus, StatusView};
use super::orchestrator::GenerationOrchestrator;
use super::store::{NewSong, SongStore};

pub const GENERATE_SONG_JOB: &str = "song:generate";
pub const GENERATE_INSTRUMENTAL_JOB: &str = "song:generate_instrumental";
pub const GENERATE_STEMS_JOB: &str = "song:generate_stems";

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateSongCommand {
    pub task_id: Uuid,
    pub lyrics: String,
    pub prompt: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl GenerateSongCommand {
    fn payload(&self) -> Value {
        json!({
            "lyrics": self.lyrics,
            "prompt": self.prompt,
            "model": self.model,
        })
    }
}

impl CommandMeta for GenerateSongCommand {
    fn command_type(&self) -> &'static str {
        GENERATE_SONG_JOB
    }

    fn idempotency_key(&self) -> Option<String> {
        Some(format!("song:{}", self.task_id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateInstrumentalCommand {
    pub task_id: Uuid,
    pub prompt: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl GenerateInstrumentalCommand {
    fn payload(&self) -> Value {
        json!({
            "prompt": self.prompt,
            "model": self.model,
        })
    }
}

impl CommandMeta for GenerateInstrumentalCommand {
    fn command_type(&self) -> &'static str {
        GENERATE_INSTRUMENTAL_JOB
    }

    fn idempotency_key(&self) -> Option<String> {
        Some(format!("song:{}", self.task_id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateStemsCommand {
    pub choice_id: Uuid,
    pub mp3_url: String,
}

impl CommandMeta for GenerateStemsCommand {
    fn command_type(&self) -> &'static str {
        GENERATE_STEMS_JOB
    }

    fn idempotency_key(&self) -> Option<String> {
        Some(format!("stems:{}", self.choice_id))
    }
}

// ============================================================================
// Stem client seam
// ============================================================================

/// Stem generation seam, separate from [`mureka_client::GenerationClient`]
/// because stems are synchronous on the provider side.
#[async_trait]
pub trait StemClient: Send + Sync {
    async fn generate_stems(&self, mp3_url: &str) -> mureka_client::Result<StemResult>;
}

#[async_trait]
impl StemClient for MurekaClient {
    async fn generate_stems(&self, mp3_url: &str) -> mureka_client::Result<StemResult> {
        MurekaClient::generate_stems(self, mp3_url).await
    }
}

// ============================================================================
// Service
// ============================================================================

/// Requests coming from the outer API surface.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub lyrics: Option<String>,
    pub prompt: String,
    pub model: String,
    pub title: Option<String>,
}

/// Entry points producers call to start work and read its state.
pub struct SongService {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn SongStore>,
    max_retries: i32,
    task_time_limit: Duration,
}

impl SongService {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn SongStore>,
        max_retries: i32,
        task_time_limit: Duration,
    ) -> Self {
        Self {
            queue,
            store,
            max_retries,
            task_time_limit,
        }
    }

    fn spec_for(&self, command: &impl CommandMeta) -> EnqueueSpec {
        EnqueueSpec {
            idempotency_key: command.idempotency_key(),
            priority: command.priority(),
            max_retries: self.max_retries,
            timeout_ms: self.task_time_limit.as_millis() as i64,
            run_at: None,
        }
    }

    /// Create a song row and queue its generation job.
    ///
    /// The row is created first so a status poll immediately after the
    /// call sees `pending` instead of nothing. If the enqueue fails the
    /// row is failed in place rather than left dangling.
    pub async fn request_song(&self, request: GenerationRequest) -> Result<Uuid> {
        let task_id = Uuid::new_v4();
        let command = GenerateSongCommand {
            task_id,
            lyrics: request.lyrics.clone().unwrap_or_default(),
            prompt: request.prompt.clone(),
            model: request.model.clone(),
            title: request.title.clone(),
        };

        self.store
            .create(NewSong {
                task_id,
                lyrics: request.lyrics,
                prompt: Some(request.prompt),
                model: Some(request.model),
                title: request.title,
                is_instrumental: false,
            })
            .await?;

        self.enqueue_or_fail(task_id, command).await?;
        Ok(task_id)
    }

    /// Create an instrumental song row and queue its generation job.
    pub async fn request_instrumental(&self, request: GenerationRequest) -> Result<Uuid> {
        let task_id = Uuid::new_v4();
        let command = GenerateInstrumentalCommand {
            task_id,
            prompt: request.prompt.clone(),
            model: request.model.clone(),
            title: request.title.clone(),
        };

        self.store
            .create(NewSong {
                task_id,
                lyrics: None,
                prompt: Some(request.prompt),
                model: Some(request.model),
                title: request.title,
                is_instrumental: true,
            })
            .await?;

        self.enqueue_or_fail(task_id, command).await?;
        Ok(task_id)
    }

    /// Queue stem generation for an already-rendered choice.
    pub async fn request_stems(&self, choice_id: Uuid) -> Result<()> {
        let choice = self
            .store
            .find_choice(choice_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("choice {} not found", choice_id))?;

        let mp3_url = choice
            .mp3_url
            .ok_or_else(|| anyhow::anyhow!("choice {} has no mp3 url", choice_id))?;

        let command = GenerateStemsCommand { choice_id, mp3_url };
        let spec = self.spec_for(&command);
        self.queue
            .enqueue_raw(command.command_type(), serde_json::to_value(&command)?, spec)
            .await?;
        Ok(())
    }

    /// Public status view for a task.
    ///
    /// Built from the song row alone; the row is updated by every
    /// attempt, so queue state adds nothing a client could act on.
    pub async fn status(&self, task_id: Uuid) -> Result<Option<StatusView>> {
        let Some(song) = self.store.find_by_task_id(task_id).await? else {
            return Ok(None);
        };

        let result = if song.status == SongStatus::Success {
            song.provider_response.clone()
        } else {
            None
        };

        Ok(Some(StatusView {
            task_id,
            status: song.status,
            progress: song.progress_info,
            error: song.error_message,
            result,
        }))
    }

    async fn enqueue_or_fail<C>(&self, task_id: Uuid, command: C) -> Result<()>
    where
        C: CommandMeta + Serialize,
    {
        let spec = self.spec_for(&command);
        let args = serde_json::to_value(&command)?;

        match self.queue.enqueue_raw(command.command_type(), args, spec).await {
            Ok(result) => {
                info!(
                    task_id = %task_id,
                    job_id = %result.job_id(),
                    job_type = command.command_type(),
                    "generation queued"
                );
                Ok(())
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "failed to enqueue generation");
                self.store
                    .record_failure(task_id, "failed to queue generation job")
                    .await?;
                Err(e)
            }
        }
    }
}

// ============================================================================
// Handler wiring
// ============================================================================

/// Register the songs-domain job handlers.
///
/// Each generation handler wraps its orchestrator in the soft time
/// limit: an attempt that overruns it fails the song row cleanly while
/// the runner's hard limit is still a safety margin away.
pub fn register_handlers(
    registry: &mut JobRegistry,
    song: Arc<GenerationOrchestrator>,
    instrumental: Arc<GenerationOrchestrator>,
    stems: Option<Arc<dyn StemClient>>,
    store: Arc<dyn SongStore>,
    soft_time_limit: Duration,
) {
    {
        let orchestrator = Arc::clone(&song);
        registry.register(
            GENERATE_SONG_JOB,
            move |ctx: JobContext, cmd: GenerateSongCommand| {
                let orchestrator = Arc::clone(&orchestrator);
                async move {
                    run_with_soft_limit(&orchestrator, ctx, cmd.task_id, cmd.payload(), soft_time_limit)
                        .await
                }
            },
        );
    }

    {
        let orchestrator = Arc::clone(&instrumental);
        registry.register(
            GENERATE_INSTRUMENTAL_JOB,
            move |ctx: JobContext, cmd: GenerateInstrumentalCommand| {
                let orchestrator = Arc::clone(&orchestrator);
                async move {
                    run_with_soft_limit(&orchestrator, ctx, cmd.task_id, cmd.payload(), soft_time_limit)
                        .await
                }
            },
        );
    }

    if let Some(stems) = stems {
        registry.register(
            GENERATE_STEMS_JOB,
            move |_ctx: JobContext, cmd: GenerateStemsCommand| {
                let stems = Arc::clone(&stems);
                let store = Arc::clone(&store);
                async move { generate_stems(&*stems, &*store, cmd).await }
            },
        );
    }
}

async fn run_with_soft_limit(
    orchestrator: &GenerationOrchestrator,
    ctx: JobContext,
    task_id: Uuid,
    payload: Value,
    soft_time_limit: Duration,
) -> Result<AttemptOutcome> {
    match tokio::time::timeout(soft_time_limit, orchestrator.run_attempt(ctx, task_id, &payload))
        .await
    {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(
                task_id = %task_id,
                limit_secs = soft_time_limit.as_secs(),
                "attempt exceeded soft time limit"
            );
            orchestrator.fail_timed_out(task_id).await
        }
    }
}

async fn generate_stems(
    client: &dyn StemClient,
    store: &dyn SongStore,
    cmd: GenerateStemsCommand,
) -> Result<AttemptOutcome> {
    match client.generate_stems(&cmd.mp3_url).await {
        Ok(StemResult {
            zip_url: Some(url), ..
        }) => {
            store.record_stem_url(cmd.choice_id, &url).await?;
            info!(choice_id = %cmd.choice_id, "stem archive recorded");
            Ok(AttemptOutcome::Completed)
        }
        Ok(_) => Ok(AttemptOutcome::failed("no stem archive in response")),
        Err(MurekaError::Api {
            status: 429, body, ..
        }) if mureka_client::classify_rate_limit(&body) == mureka_client::RateLimitKind::Quota =>
        {
            Ok(AttemptOutcome::failed(format!("API quota exhausted: {body}")))
        }
        Err(e)
            if matches!(e, MurekaError::Network(_))
                || e.is_transient_infra()
                || e.is_too_many_requests() =>
        {
            Ok(AttemptOutcome::retry(
                Duration::from_secs(60),
                e.to_string(),
            ))
        }
        Err(e) => Ok(AttemptOutcome::failed(e.to_string())),
    }
}
