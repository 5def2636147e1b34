//! End-to-end orchestration scenarios over in-memory fakes.
//!
//! The full production wiring runs here (service, queue, registry,
//! runner, orchestrator, slot manager) with only the provider client
//! and the two stores swapped for in-memory doubles. Time is paused,
//! so slot waits and poll backoffs resolve instantly.

use std::sync::Arc;
use std::time::Duration;

use mureka_client::MurekaError;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use server_core::domains::songs::testing::{InMemorySongStore, MockGenerationClient, MockStemClient};
use server_core::domains::songs::{
    GenerationOrchestrator, GenerationRequest, NewSong, OrchestratorSettings, SongService,
    SongStatus, SongStore, StemClient, register_handlers,
};
use server_core::kernel::SlotManager;
use server_core::kernel::jobs::testing::InMemoryJobQueue;
use server_core::kernel::jobs::{
    AttemptOutcome, JobContext, JobQueue, JobRegistry, JobRunner, JobRunnerConfig, JobStatus,
};

const SOFT_TIME_LIMIT: Duration = Duration::from_secs(1500);

struct World {
    queue: Arc<InMemoryJobQueue>,
    store: Arc<InMemorySongStore>,
    client: Arc<MockGenerationClient>,
    slots: Arc<SlotManager>,
    service: SongService,
    runner: Arc<JobRunner>,
}

fn build_world(settings: OrchestratorSettings, max_retries: i32) -> World {
    let queue = Arc::new(InMemoryJobQueue::new());
    let store = Arc::new(InMemorySongStore::new());
    let client = Arc::new(MockGenerationClient::new());
    let slots = Arc::new(SlotManager::new(1).with_poll_interval(Duration::from_secs(10)));

    let orchestrator = |client: Arc<MockGenerationClient>| {
        Arc::new(GenerationOrchestrator::new(
            client,
            store.clone() as Arc<dyn SongStore>,
            Arc::clone(&slots),
            queue.clone() as Arc<dyn JobQueue>,
            settings.clone(),
        ))
    };

    let mut registry = JobRegistry::new();
    register_handlers(
        &mut registry,
        orchestrator(Arc::clone(&client)),
        orchestrator(Arc::clone(&client)),
        Some(Arc::new(MockStemClient::new()) as Arc<dyn StemClient>),
        store.clone() as Arc<dyn SongStore>,
        SOFT_TIME_LIMIT,
    );

    let service = SongService::new(
        queue.clone() as Arc<dyn JobQueue>,
        store.clone() as Arc<dyn SongStore>,
        max_retries,
        Duration::from_secs(1800),
    );

    let runner = Arc::new(JobRunner::with_config(
        queue.clone() as Arc<dyn JobQueue>,
        Arc::new(registry),
        JobRunnerConfig {
            worker_id: "test-worker".to_string(),
            batch_size: 1,
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
        },
    ));

    World {
        queue,
        store,
        client,
        slots,
        service,
        runner,
    }
}

fn default_world() -> World {
    build_world(OrchestratorSettings::default(), 3)
}

fn spawn_runner(world: &World) -> (CancellationToken, tokio::task::JoinHandle<()>) {
    let shutdown = CancellationToken::new();
    let runner = Arc::clone(&world.runner);
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { runner.run(token).await });
    (shutdown, handle)
}

/// Advance paused time until the song reaches a terminal status.
async fn wait_terminal(world: &World, task_id: Uuid) -> SongStatus {
    for _ in 0..2000 {
        if let Some(song) = world.store.snapshot(task_id) {
            if song.status.is_terminal() {
                return song.status;
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    panic!("song never reached a terminal status");
}

fn assert_monotonic_history(world: &World, task_id: Uuid) {
    let history = world.store.status_history(task_id);
    assert!(!history.is_empty());
    assert_eq!(history[0], SongStatus::Pending);
    for pair in history.windows(2) {
        assert!(
            pair[0].can_transition_to(pair[1]),
            "illegal transition {:?} -> {:?} in {:?}",
            pair[0],
            pair[1],
            history
        );
    }
}

// ============================================================================
// Scenario: happy path
// ============================================================================

#[tokio::test(start_paused = true)]
async fn successful_generation_persists_choices_and_cleans_queue() {
    let world = default_world();

    world.client.push_status_json(json!({
        "status": "succeeded",
        "model": "mureka-6",
        "choices": [
            {
                "id": "c-1",
                "mp3_url": "https://cdn/song.mp3",
                "flac_url": "https://cdn/song.flac",
                "duration": 1000.0,
                "title": "Test Song",
                "lyrics_sections": [{"section": "verse"}]
            }
        ]
    }));

    let task_id = world
        .service
        .request_song(GenerationRequest {
            lyrics: Some("la la la".into()),
            prompt: "dreamy synthwave".into(),
            model: "auto".into(),
            title: Some("Test Song".into()),
        })
        .await
        .unwrap();

    // Visible as pending before any attempt runs.
    let view = world.service.status(task_id).await.unwrap().unwrap();
    assert_eq!(view.status, SongStatus::Pending);

    let (shutdown, handle) = spawn_runner(&world);
    let status = wait_terminal(&world, task_id).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(status, SongStatus::Success);

    let song = world.store.snapshot(task_id).unwrap();
    assert!(song.provider_job_id.is_some());
    assert_eq!(song.model.as_deref(), Some("mureka-6"));
    assert!(song.completed_at.is_some());

    // Verbose provider internals are stripped before persistence.
    let response = song.provider_response.clone().unwrap();
    assert!(response["choices"][0].get("lyrics_sections").is_none());

    let choices = world.store.choices(song.id).await.unwrap();
    assert_eq!(choices.len(), 1);
    assert_eq!(choices[0].mp3_url.as_deref(), Some("https://cdn/song.mp3"));
    assert_eq!(choices[0].duration, Some(1000.0));

    // Queue row is forgotten after success.
    assert!(world.queue.jobs().is_empty());

    // Slot is free again.
    assert!(world.slots.status().available);

    assert_monotonic_history(&world, task_id);

    let view = world.service.status(task_id).await.unwrap().unwrap();
    assert_eq!(view.status, SongStatus::Success);
    assert!(view.result.is_some());
    assert!(view.error.is_none());
}

// ============================================================================
// Scenario: quota exhaustion
// ============================================================================

#[tokio::test(start_paused = true)]
async fn quota_exhaustion_fails_immediately_without_retry() {
    let world = default_world();
    world
        .client
        .push_submit_error(429, "Quota exceeded for this billing period");

    let task_id = world
        .service
        .request_song(GenerationRequest {
            lyrics: Some("la".into()),
            prompt: "jazz".into(),
            model: "auto".into(),
            title: None,
        })
        .await
        .unwrap();

    let (shutdown, handle) = spawn_runner(&world);
    let status = wait_terminal(&world, task_id).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(status, SongStatus::Failure);

    let song = world.store.snapshot(task_id).unwrap();
    assert!(song.error_message.unwrap().contains("quota"));
    assert!(song.completed_at.is_some());

    // Exactly one submission, no retry rows, job dead-lettered.
    assert_eq!(world.client.submit_calls(), 1);
    let jobs = world.queue.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::DeadLetter);

    // Slot released despite the failure.
    assert!(world.slots.status().available);
}

// ============================================================================
// Scenario: transient upstream error during polling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn transient_poll_error_recovers_within_the_same_attempt() {
    let world = default_world();

    world.client.push_status(Err(MurekaError::Api {
        status: 503,
        body: "service unavailable".into(),
        retry_after: None,
    }));
    world.client.push_status_json(json!({
        "status": "succeeded",
        "choices": []
    }));

    let task_id = world
        .service
        .request_song(GenerationRequest {
            lyrics: Some("la".into()),
            prompt: "ambient".into(),
            model: "auto".into(),
            title: None,
        })
        .await
        .unwrap();

    let (shutdown, handle) = spawn_runner(&world);
    let status = wait_terminal(&world, task_id).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(status, SongStatus::Success);

    // The 503 was absorbed inside the attempt: one submission only.
    assert_eq!(world.client.submit_calls(), 1);
    assert!(world.client.status_calls() >= 2);

    // Zero choices is a valid success.
    let song = world.store.snapshot(task_id).unwrap();
    let choices = world.store.choices(song.id).await.unwrap();
    assert!(choices.is_empty());
}

// ============================================================================
// Scenario: network failure ends the attempt, retry succeeds
// ============================================================================

#[tokio::test(start_paused = true)]
async fn network_failure_schedules_retry_then_succeeds() {
    let world = default_world();

    world
        .client
        .push_submit(Err(MurekaError::Network("connection reset".into())));

    let task_id = world
        .service
        .request_song(GenerationRequest {
            lyrics: Some("la".into()),
            prompt: "lofi".into(),
            model: "auto".into(),
            title: None,
        })
        .await
        .unwrap();

    let (shutdown, handle) = spawn_runner(&world);

    // First attempt fails; the song parks in `retrying`.
    for _ in 0..2000 {
        if world.store.snapshot(task_id).map(|s| s.status) == Some(SongStatus::Retrying) {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    assert_eq!(
        world.store.snapshot(task_id).unwrap().status,
        SongStatus::Retrying
    );

    // The retry row is scheduled on the wall clock; pull it forward.
    world.queue.make_all_ready();

    let status = wait_terminal(&world, task_id).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(status, SongStatus::Success);
    assert_eq!(world.client.submit_calls(), 2);
    assert_monotonic_history(&world, task_id);
}

// ============================================================================
// Scenario: retries exhausted
// ============================================================================

#[tokio::test(start_paused = true)]
async fn exhausted_retries_end_in_terminal_failure() {
    let world = build_world(OrchestratorSettings::default(), 0);

    world
        .client
        .push_submit(Err(MurekaError::Network("connection reset".into())));

    let task_id = world
        .service
        .request_song(GenerationRequest {
            lyrics: Some("la".into()),
            prompt: "rock".into(),
            model: "auto".into(),
            title: None,
        })
        .await
        .unwrap();

    let (shutdown, handle) = spawn_runner(&world);
    let status = wait_terminal(&world, task_id).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(status, SongStatus::Failure);
    let song = world.store.snapshot(task_id).unwrap();
    assert!(song.error_message.unwrap().contains("retries exhausted"));
}

// ============================================================================
// Scenario: provider-side failure
// ============================================================================

#[tokio::test(start_paused = true)]
async fn provider_reported_failure_is_terminal() {
    let world = default_world();
    world.client.push_status_json(json!({
        "status": "failed",
        "failed_reason": "content policy violation"
    }));

    let task_id = world
        .service
        .request_song(GenerationRequest {
            lyrics: Some("la".into()),
            prompt: "pop".into(),
            model: "auto".into(),
            title: None,
        })
        .await
        .unwrap();

    let (shutdown, handle) = spawn_runner(&world);
    let status = wait_terminal(&world, task_id).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(status, SongStatus::Failure);
    let song = world.store.snapshot(task_id).unwrap();
    assert!(
        song.error_message
            .unwrap()
            .contains("content policy violation")
    );
    assert_eq!(world.client.submit_calls(), 1);
}

// ============================================================================
// Scenario: polling budget exhausted
// ============================================================================

#[tokio::test(start_paused = true)]
async fn poll_budget_exhaustion_is_terminal() {
    let settings = OrchestratorSettings {
        max_poll_attempts: 3,
        ..Default::default()
    };
    let world = build_world(settings, 3);

    for _ in 0..3 {
        world.client.push_status_json(json!({"status": "running"}));
    }

    let task_id = world
        .service
        .request_song(GenerationRequest {
            lyrics: Some("la".into()),
            prompt: "drone".into(),
            model: "auto".into(),
            title: None,
        })
        .await
        .unwrap();

    let (shutdown, handle) = spawn_runner(&world);
    let status = wait_terminal(&world, task_id).await;
    shutdown.cancel();
    handle.await.unwrap();

    // The provider sat on the job for the whole window: terminal even
    // with retry budget left, and never resubmitted.
    assert_eq!(status, SongStatus::Failure);
    let song = world.store.snapshot(task_id).unwrap();
    assert!(song.error_message.unwrap().contains("poll attempts"));
    assert_eq!(world.client.submit_calls(), 1);

    let jobs = world.queue.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::DeadLetter);

    // Each polling snapshot records the interval the attempt waited.
    let progress = song.progress_info.unwrap();
    assert_eq!(progress["phase"], "polling");
    assert_eq!(progress["poll_interval_secs"].as_u64(), Some(5));
}

// ============================================================================
// Scenario: rate-limited submission
// ============================================================================

#[tokio::test(start_paused = true)]
async fn rate_limited_submission_waits_out_retry_after() {
    let world = default_world();
    world.client.push_submit(Err(MurekaError::Api {
        status: 429,
        body: "please pace your requests".into(),
        retry_after: Some(300),
    }));

    let task_id = world
        .service
        .request_song(GenerationRequest {
            lyrics: Some("la".into()),
            prompt: "house".into(),
            model: "auto".into(),
            title: None,
        })
        .await
        .unwrap();

    let (shutdown, handle) = spawn_runner(&world);
    for _ in 0..2000 {
        if world.store.snapshot(task_id).map(|s| s.status) == Some(SongStatus::Retrying) {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(
        world.store.snapshot(task_id).unwrap().status,
        SongStatus::Retrying
    );
    assert_eq!(world.client.submit_calls(), 1);

    // The retry row is scheduled by the Retry-After header, not the
    // configured 60s delay.
    let retry = world
        .queue
        .jobs()
        .into_iter()
        .find(|j| j.status == JobStatus::Pending)
        .expect("retry row scheduled");
    let delay = retry.next_run_at.unwrap() - retry.created_at;
    assert!(
        delay.num_seconds() >= 299,
        "retry scheduled after only {}s",
        delay.num_seconds()
    );
}

// ============================================================================
// Scenario: fast provider completion
// ============================================================================

#[tokio::test(start_paused = true)]
async fn status_is_checked_before_the_first_poll_sleep() {
    let world = default_world();

    let orchestrator = GenerationOrchestrator::new(
        Arc::clone(&world.client) as Arc<dyn mureka_client::GenerationClient>,
        world.store.clone() as Arc<dyn SongStore>,
        Arc::clone(&world.slots),
        world.queue.clone() as Arc<dyn JobQueue>,
        OrchestratorSettings::default(),
    );

    let task_id = Uuid::new_v4();
    world
        .store
        .create(NewSong {
            task_id,
            prompt: Some("x".into()),
            ..Default::default()
        })
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let outcome = orchestrator
        .run_attempt(
            JobContext {
                job_id: Uuid::new_v4(),
                attempt: 1,
                attempts_remaining: 3,
            },
            task_id,
            &json!({"prompt": "x", "model": "auto"}),
        )
        .await
        .unwrap();

    assert!(matches!(outcome, AttemptOutcome::Completed));
    // The mock reports success on the first check, so the attempt never
    // slept: paused time did not move at all.
    assert_eq!(started.elapsed(), Duration::ZERO);
}

// ============================================================================
// Scenario: soft time limit
// ============================================================================

#[tokio::test(start_paused = true)]
async fn soft_time_limit_fails_the_song_cleanly() {
    // Poll budget far beyond the soft limit, provider never finishes.
    let settings = OrchestratorSettings {
        max_poll_attempts: 100_000,
        ..Default::default()
    };
    let world = build_world(settings, 0);

    let task_id = world
        .service
        .request_song(GenerationRequest {
            lyrics: Some("la".into()),
            prompt: "endless".into(),
            model: "auto".into(),
            title: None,
        })
        .await
        .unwrap();

    // The mock defaults to "succeeded" when its script runs dry, so
    // keep it saturated with "running" far past the soft limit.
    for _ in 0..400 {
        world.client.push_status_json(json!({"status": "running"}));
    }

    let (shutdown, handle) = spawn_runner(&world);
    let status = wait_terminal(&world, task_id).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(status, SongStatus::Failure);
    let song = world.store.snapshot(task_id).unwrap();
    assert_eq!(song.error_message.as_deref(), Some("task timeout exceeded"));

    // The aborted attempt released its slot through the guard.
    assert!(world.slots.status().available);
}

// ============================================================================
// Scenario: slot contention
// ============================================================================

#[tokio::test(start_paused = true)]
async fn concurrent_attempts_never_overlap_on_the_provider() {
    let world = default_world();

    // Two status polls per job keep each generation in flight long
    // enough for the other attempt to contend for the slot.
    for _ in 0..2 {
        world.client.push_status_json(json!({"status": "running"}));
        world.client.push_status_json(json!({
            "status": "succeeded",
            "choices": []
        }));
    }

    let orchestrator = GenerationOrchestrator::new(
        Arc::clone(&world.client) as Arc<dyn mureka_client::GenerationClient>,
        world.store.clone() as Arc<dyn SongStore>,
        Arc::clone(&world.slots),
        world.queue.clone() as Arc<dyn JobQueue>,
        OrchestratorSettings::default(),
    );

    let task_a = Uuid::new_v4();
    let task_b = Uuid::new_v4();
    for task_id in [task_a, task_b] {
        world
            .store
            .create(NewSong {
                task_id,
                prompt: Some("x".into()),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    let ctx = |job_id| JobContext {
        job_id,
        attempt: 1,
        attempts_remaining: 3,
    };
    let payload = json!({"prompt": "x", "model": "auto"});

    let (a, b) = tokio::join!(
        orchestrator.run_attempt(ctx(Uuid::new_v4()), task_a, &payload),
        orchestrator.run_attempt(ctx(Uuid::new_v4()), task_b, &payload),
    );
    a.unwrap();
    b.unwrap();

    // The provider never saw more than one generation at a time.
    assert_eq!(world.client.max_in_flight(), 1);
    assert_eq!(world.client.submit_calls(), 2);

    assert_eq!(
        world.store.snapshot(task_a).unwrap().status,
        SongStatus::Success
    );
    assert_eq!(
        world.store.snapshot(task_b).unwrap().status,
        SongStatus::Success
    );
    assert!(world.slots.status().available);
}

// ============================================================================
// Scenario: slot wait timeout
// ============================================================================

#[tokio::test(start_paused = true)]
async fn slot_wait_timeout_parks_the_song_for_retry() {
    let settings = OrchestratorSettings {
        slot_max_wait: Duration::from_secs(30),
        ..Default::default()
    };
    let world = build_world(settings, 3);

    // Occupy the only slot for the duration of the test.
    assert!(world.slots.try_acquire("hog"));

    let task_id = world
        .service
        .request_song(GenerationRequest {
            lyrics: Some("la".into()),
            prompt: "waiting".into(),
            model: "auto".into(),
            title: None,
        })
        .await
        .unwrap();

    let (shutdown, handle) = spawn_runner(&world);
    for _ in 0..2000 {
        if world.store.snapshot(task_id).map(|s| s.status) == Some(SongStatus::Retrying) {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    shutdown.cancel();
    handle.await.unwrap();

    let song = world.store.snapshot(task_id).unwrap();
    assert_eq!(song.status, SongStatus::Retrying);
    assert!(song.error_message.unwrap().contains("slot"));

    // Nothing was ever submitted.
    assert_eq!(world.client.submit_calls(), 0);
}

// ============================================================================
// Scenario: stem generation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn stem_generation_attaches_archive_to_choice() {
    let world = default_world();

    world.client.push_status_json(json!({
        "status": "succeeded",
        "choices": [{"mp3_url": "https://cdn/track.mp3"}]
    }));

    let task_id = world
        .service
        .request_song(GenerationRequest {
            lyrics: Some("la".into()),
            prompt: "stems please".into(),
            model: "auto".into(),
            title: None,
        })
        .await
        .unwrap();

    let (shutdown, handle) = spawn_runner(&world);
    wait_terminal(&world, task_id).await;

    let song = world.store.snapshot(task_id).unwrap();
    let choice_id = world.store.choices(song.id).await.unwrap()[0].id;

    world.service.request_stems(choice_id).await.unwrap();

    for _ in 0..2000 {
        let choice = world.store.find_choice(choice_id).await.unwrap().unwrap();
        if choice.stem_zip_url.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    shutdown.cancel();
    handle.await.unwrap();

    let choice = world.store.find_choice(choice_id).await.unwrap().unwrap();
    assert_eq!(
        choice.stem_zip_url.as_deref(),
        Some("https://cdn/track.mp3.stems.zip")
    );
    assert!(choice.stem_generated_at.is_some());
}

// ============================================================================
// Scenario: instrumental generation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn instrumental_requests_run_through_their_own_client() {
    let world = default_world();

    let task_id = world
        .service
        .request_instrumental(GenerationRequest {
            lyrics: None,
            prompt: "cinematic score".into(),
            model: "auto".into(),
            title: None,
        })
        .await
        .unwrap();

    let song = world.store.snapshot(task_id).unwrap();
    assert!(song.is_instrumental);
    assert!(song.lyrics.is_none());

    let (shutdown, handle) = spawn_runner(&world);
    let status = wait_terminal(&world, task_id).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(status, SongStatus::Success);
}
