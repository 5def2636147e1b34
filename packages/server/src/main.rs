// Main entry point for the music-generation worker

use std::sync::Arc;

use anyhow::{Context, Result};
use mureka_client::MurekaClient;
use server_core::Config;
use server_core::domains::songs::{
    GenerationOrchestrator, OrchestratorSettings, PostgresSongStore, SongStore, StemClient,
    register_handlers,
};
use server_core::kernel::SlotManager;
use server_core::kernel::jobs::{
    JobQueue, JobRegistry, JobRunner, JobRunnerConfig, PostgresJobQueue,
};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting music generation worker");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Run migrations
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Shared infrastructure
    let queue: Arc<dyn JobQueue> =
        Arc::new(PostgresJobQueue::new(pool.clone()).with_retry_delay(config.task_retry_delay));
    let store: Arc<dyn SongStore> = Arc::new(PostgresSongStore::new(pool.clone()));
    let slots = Arc::new(
        SlotManager::new(config.slot_max_concurrent).with_poll_interval(config.slot_poll_interval),
    );

    // Provider clients, one per generation kind
    let song_client = MurekaClient::song(
        config.mureka_api_key.clone(),
        config.mureka_generate_endpoint.clone(),
        config.mureka_status_endpoint.clone(),
    )
    .with_timeout(config.mureka_timeout);

    let instrumental_client = MurekaClient::instrumental(
        config.mureka_api_key.clone(),
        config.mureka_instrumental_generate_endpoint.clone(),
        config.mureka_instrumental_status_endpoint.clone(),
    )
    .with_timeout(config.mureka_timeout);

    let stem_client: Option<Arc<dyn StemClient>> =
        config.mureka_stem_generate_endpoint.as_ref().map(|url| {
            Arc::new(
                MurekaClient::song(
                    config.mureka_api_key.clone(),
                    config.mureka_generate_endpoint.clone(),
                    config.mureka_status_endpoint.clone(),
                )
                .with_timeout(config.mureka_timeout)
                .with_stem_endpoint(url.clone()),
            ) as Arc<dyn StemClient>
        });

    let settings = OrchestratorSettings {
        slot_max_wait: config.slot_max_wait,
        retry_delay: config.task_retry_delay,
        max_poll_attempts: config.max_poll_attempts,
        poll_intervals: config.poll_intervals,
    };

    let song_orchestrator = Arc::new(GenerationOrchestrator::new(
        Arc::new(song_client),
        Arc::clone(&store),
        Arc::clone(&slots),
        Arc::clone(&queue),
        settings.clone(),
    ));
    let instrumental_orchestrator = Arc::new(GenerationOrchestrator::new(
        Arc::new(instrumental_client),
        Arc::clone(&store),
        Arc::clone(&slots),
        Arc::clone(&queue),
        settings,
    ));

    // Handler registry
    let mut registry = JobRegistry::new();
    register_handlers(
        &mut registry,
        song_orchestrator,
        instrumental_orchestrator,
        stem_client,
        Arc::clone(&store),
        config.task_soft_time_limit,
    );

    // Worker loop
    let runner = JobRunner::with_config(
        queue,
        Arc::new(registry),
        JobRunnerConfig {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            batch_size: 1,
            ..Default::default()
        },
    );

    tracing::info!("Worker starting");
    runner.run_until_shutdown().await
}
