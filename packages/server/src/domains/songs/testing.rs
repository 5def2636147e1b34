//! In-memory fakes for orchestration tests.
//!
//! [`InMemorySongStore`] mirrors the PostgreSQL store's semantics
//! (monotonic transitions, set-once provider job ID, choice fan-out).
//! [`MockGenerationClient`] replays scripted provider responses and
//! tracks how many generations were in flight at once.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use mureka_client::{GenerationClient, MurekaError, StatusResponse, StemResult, Submission};
use serde_json::{Value, json};
use uuid::Uuid;

use super::commands::StemClient;
use super::model::{Song, SongChoice, SongStatus};
use super::store::{NewSong, SongStore};

// ============================================================================
// Song store
// ============================================================================

#[derive(Default)]
pub struct InMemorySongStore {
    songs: Mutex<HashMap<Uuid, Song>>,
    choices: Mutex<Vec<SongChoice>>,
    history: Mutex<HashMap<Uuid, Vec<SongStatus>>>,
}

impl InMemorySongStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn songs_lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Song>> {
        self.songs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn choices_lock(&self) -> std::sync::MutexGuard<'_, Vec<SongChoice>> {
        self.choices.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot a song row by task ID.
    pub fn snapshot(&self, task_id: Uuid) -> Option<Song> {
        self.songs_lock().get(&task_id).cloned()
    }

    /// Every status the song has passed through, for monotonicity
    /// assertions. Recorded on each successful write.
    pub fn status_history(&self, task_id: Uuid) -> Vec<SongStatus> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&task_id)
            .cloned()
            .unwrap_or_default()
    }

    fn record_history(&self, task_id: Uuid, status: SongStatus) {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(task_id)
            .or_default()
            .push(status);
    }
}

#[async_trait]
impl SongStore for InMemorySongStore {
    async fn create(&self, new: NewSong) -> Result<Song> {
        let now = Utc::now();
        let song = Song {
            id: Uuid::new_v4(),
            task_id: new.task_id,
            provider_job_id: None,
            lyrics: new.lyrics,
            prompt: new.prompt,
            model: new.model,
            title: new.title,
            is_instrumental: new.is_instrumental,
            status: SongStatus::Pending,
            progress_info: None,
            provider_status: None,
            provider_response: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        self.songs_lock().insert(new.task_id, song.clone());
        self.record_history(new.task_id, SongStatus::Pending);
        Ok(song)
    }

    async fn find_by_task_id(&self, task_id: Uuid) -> Result<Option<Song>> {
        Ok(self.snapshot(task_id))
    }

    async fn choices(&self, song_id: Uuid) -> Result<Vec<SongChoice>> {
        let mut choices: Vec<SongChoice> = self
            .choices_lock()
            .iter()
            .filter(|c| c.song_id == song_id)
            .cloned()
            .collect();
        choices.sort_by_key(|c| c.choice_index);
        Ok(choices)
    }

    async fn find_choice(&self, choice_id: Uuid) -> Result<Option<SongChoice>> {
        Ok(self
            .choices_lock()
            .iter()
            .find(|c| c.id == choice_id)
            .cloned())
    }

    async fn transition(
        &self,
        task_id: Uuid,
        status: SongStatus,
        progress: Option<Value>,
        provider_job_id: Option<&str>,
    ) -> Result<()> {
        if status.is_terminal() {
            return Err(anyhow!(
                "terminal transitions must use record_success or record_failure"
            ));
        }

        let mut songs = self.songs_lock();
        if let Some(song) = songs.get_mut(&task_id) {
            if song.status.is_terminal() {
                return Ok(());
            }
            song.status = status;
            if let Some(progress) = progress {
                song.progress_info = Some(progress);
            }
            if song.provider_job_id.is_none() {
                song.provider_job_id = provider_job_id.map(str::to_string);
            }
            song.updated_at = Utc::now();
            drop(songs);
            self.record_history(task_id, status);
        }
        Ok(())
    }

    async fn record_success(&self, task_id: Uuid, response: &Value) -> Result<Song> {
        let mut songs = self.songs_lock();
        let song = songs
            .get_mut(&task_id)
            .ok_or_else(|| anyhow!("song {} not found", task_id))?;

        if song.status.is_terminal() {
            return Ok(song.clone());
        }

        song.status = SongStatus::Success;
        song.provider_response = Some(response.clone());
        song.provider_status = response
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or(song.provider_status.take());
        if let Some(model) = response.get("model").and_then(Value::as_str) {
            song.model = Some(model.to_string());
        }
        song.error_message = None;
        song.completed_at = Some(Utc::now());
        song.updated_at = Utc::now();
        let song = song.clone();
        drop(songs);

        let mut choices = self.choices_lock();
        choices.retain(|c| c.song_id != song.id);
        if let Some(items) = response.get("choices").and_then(Value::as_array) {
            for (index, value) in items.iter().enumerate() {
                choices.push(SongChoice::from_provider_choice(
                    song.id,
                    index as i32,
                    value,
                ));
            }
        }
        drop(choices);

        self.record_history(task_id, SongStatus::Success);
        Ok(song)
    }

    async fn record_failure(&self, task_id: Uuid, error: &str) -> Result<()> {
        let mut songs = self.songs_lock();
        if let Some(song) = songs.get_mut(&task_id) {
            if song.status.is_terminal() {
                return Ok(());
            }
            song.status = SongStatus::Failure;
            song.error_message = Some(error.to_string());
            song.completed_at = Some(Utc::now());
            song.updated_at = Utc::now();
            drop(songs);
            self.record_history(task_id, SongStatus::Failure);
        }
        Ok(())
    }

    async fn record_retrying(&self, task_id: Uuid, reason: &str) -> Result<()> {
        let mut songs = self.songs_lock();
        if let Some(song) = songs.get_mut(&task_id) {
            if song.status.is_terminal() {
                return Ok(());
            }
            song.status = SongStatus::Retrying;
            song.error_message = Some(reason.to_string());
            song.updated_at = Utc::now();
            drop(songs);
            self.record_history(task_id, SongStatus::Retrying);
        }
        Ok(())
    }

    async fn record_stem_url(&self, choice_id: Uuid, zip_url: &str) -> Result<()> {
        let mut choices = self.choices_lock();
        if let Some(choice) = choices.iter_mut().find(|c| c.id == choice_id) {
            choice.stem_zip_url = Some(zip_url.to_string());
            choice.stem_generated_at = Some(Utc::now());
        }
        Ok(())
    }
}

// ============================================================================
// Generation client
// ============================================================================

/// Scripted [`GenerationClient`] for tests.
///
/// `submit` and `check_status` pop pre-loaded results in order. When a
/// script runs dry, `submit` succeeds with a fresh job ID and
/// `check_status` reports success, so the happy path needs no setup.
#[derive(Default)]
pub struct MockGenerationClient {
    submit_script: Mutex<VecDeque<mureka_client::Result<Submission>>>,
    status_script: Mutex<VecDeque<mureka_client::Result<StatusResponse>>>,
    submit_calls: AtomicU32,
    status_calls: AtomicU32,
    in_flight: AtomicI32,
    max_in_flight: AtomicI32,
}

impl MockGenerationClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_submit(&self, result: mureka_client::Result<Submission>) {
        self.submit_script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(result);
    }

    pub fn push_submit_error(&self, status: u16, body: &str) {
        self.push_submit(Err(MurekaError::Api {
            status,
            body: body.to_string(),
            retry_after: None,
        }));
    }

    pub fn push_status(&self, result: mureka_client::Result<StatusResponse>) {
        self.status_script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(result);
    }

    pub fn push_status_json(&self, body: Value) {
        self.push_status(Ok(StatusResponse::new(body)));
    }

    pub fn submit_calls(&self) -> u32 {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }

    /// Highest number of generations between submission and a terminal
    /// status at any point, for concurrency-ceiling assertions.
    pub fn max_in_flight(&self) -> i32 {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationClient for MockGenerationClient {
    async fn submit(&self, _payload: &Value) -> mureka_client::Result<Submission> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);

        let scripted = self
            .submit_script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();

        let result = match scripted {
            Some(result) => result,
            None => Ok(Submission {
                job_id: format!("job-{}", Uuid::new_v4()),
                raw: json!({"id": "job"}),
            }),
        };

        if result.is_ok() {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        }

        result
    }

    async fn check_status(&self, _job_id: &str) -> mureka_client::Result<StatusResponse> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);

        let scripted = self
            .status_script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();

        let result = match scripted {
            Some(result) => result,
            None => Ok(StatusResponse::new(json!({
                "status": "succeeded",
                "choices": [],
            }))),
        };

        if let Ok(response) = &result {
            if response.status().is_terminal() {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        }

        result
    }
}

// ============================================================================
// Stem client
// ============================================================================

/// Scripted [`StemClient`].
#[derive(Default)]
pub struct MockStemClient {
    script: Mutex<VecDeque<mureka_client::Result<StemResult>>>,
}

impl MockStemClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: mureka_client::Result<StemResult>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(result);
    }
}

#[async_trait]
impl StemClient for MockStemClient {
    async fn generate_stems(&self, mp3_url: &str) -> mureka_client::Result<StemResult> {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| {
                Ok(StemResult {
                    zip_url: Some(format!("{mp3_url}.stems.zip")),
                    raw: json!({}),
                })
            })
    }
}
