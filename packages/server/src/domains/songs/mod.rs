//! Song generation domain.
//!
//! A generation request becomes a song row (keyed by a public task ID)
//! plus a queued job. The job's handler drives the provider through
//! the [`GenerationOrchestrator`]; clients follow along by polling
//! [`SongService::status`].

pub mod commands;
pub mod model;
pub mod orchestrator;
pub mod store;
pub mod testing;

pub use commands::{
    GENERATE_INSTRUMENTAL_JOB, GENERATE_SONG_JOB, GENERATE_STEMS_JOB, GenerateInstrumentalCommand,
    GenerateSongCommand, GenerateStemsCommand, GenerationRequest, SongService, StemClient,
    register_handlers,
};
pub use model::{Song, SongChoice, SongStatus, StatusView};
pub use orchestrator::{GenerationOrchestrator, OrchestratorSettings};
pub use store::{NewSong, PostgresSongStore, SongStore};
