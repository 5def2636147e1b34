//! Persistence for songs and their generated choices.
//!
//! All status writes go through this store, which enforces the
//! monotonic lifecycle at the SQL level: terminal rows match no UPDATE
//! predicate, so a late write from a dying attempt cannot resurrect a
//! finished song.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use super::model::{Song, SongChoice, SongStatus};

/// Parameters for a new song row.
#[derive(Debug, Clone, Default)]
pub struct NewSong {
    pub task_id: Uuid,
    pub lyrics: Option<String>,
    pub prompt: Option<String>,
    pub model: Option<String>,
    pub title: Option<String>,
    pub is_instrumental: bool,
}

/// Storage seam for the songs domain.
#[async_trait]
pub trait SongStore: Send + Sync {
    /// Insert a song row in `pending` status.
    async fn create(&self, song: NewSong) -> Result<Song>;

    /// Fetch a song by its public task ID.
    async fn find_by_task_id(&self, task_id: Uuid) -> Result<Option<Song>>;

    /// Fetch the persisted choices of a song, ordered by index.
    async fn choices(&self, song_id: Uuid) -> Result<Vec<SongChoice>>;

    /// Fetch a single choice by ID.
    async fn find_choice(&self, choice_id: Uuid) -> Result<Option<SongChoice>>;

    /// Move a song to a non-terminal status with optional progress
    /// metadata.
    ///
    /// `provider_job_id` is set only if not already present; the first
    /// write wins and later values are ignored. Writes against a
    /// terminal row are ignored.
    async fn transition(
        &self,
        task_id: Uuid,
        status: SongStatus,
        progress: Option<Value>,
        provider_job_id: Option<&str>,
    ) -> Result<()>;

    /// Persist a successful generation: terminal `success` status, the
    /// full provider response, and one choice row per response choice.
    /// Replaces any choices from an earlier partial write.
    async fn record_success(&self, task_id: Uuid, response: &Value) -> Result<Song>;

    /// Persist a terminal failure with its error message.
    async fn record_failure(&self, task_id: Uuid, error: &str) -> Result<()>;

    /// Mark the song as waiting for its next attempt.
    async fn record_retrying(&self, task_id: Uuid, reason: &str) -> Result<()>;

    /// Attach a generated stem archive URL to a choice.
    async fn record_stem_url(&self, choice_id: Uuid, zip_url: &str) -> Result<()>;
}

/// PostgreSQL-backed [`SongStore`].
pub struct PostgresSongStore {
    pool: PgPool,
}

impl PostgresSongStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SongStore for PostgresSongStore {
    async fn create(&self, song: NewSong) -> Result<Song> {
        sqlx::query_as::<_, Song>(
            r#"
            INSERT INTO songs (task_id, lyrics, prompt, model, title, is_instrumental)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(song.task_id)
        .bind(&song.lyrics)
        .bind(&song.prompt)
        .bind(&song.model)
        .bind(&song.title)
        .bind(song.is_instrumental)
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn find_by_task_id(&self, task_id: Uuid) -> Result<Option<Song>> {
        sqlx::query_as::<_, Song>("SELECT * FROM songs WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    async fn choices(&self, song_id: Uuid) -> Result<Vec<SongChoice>> {
        sqlx::query_as::<_, SongChoice>(
            "SELECT * FROM song_choices WHERE song_id = $1 ORDER BY choice_index",
        )
        .bind(song_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn find_choice(&self, choice_id: Uuid) -> Result<Option<SongChoice>> {
        sqlx::query_as::<_, SongChoice>("SELECT * FROM song_choices WHERE id = $1")
            .bind(choice_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
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

        let result = sqlx::query(
            r#"
            UPDATE songs
            SET status = $2,
                progress_info = COALESCE($3, progress_info),
                provider_job_id = COALESCE(provider_job_id, $4),
                updated_at = NOW()
            WHERE task_id = $1
              AND status NOT IN ('success', 'failure')
            "#,
        )
        .bind(task_id)
        .bind(status)
        .bind(progress)
        .bind(provider_job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(task_id = %task_id, ?status, "transition ignored for terminal or missing song");
        }

        Ok(())
    }

    async fn record_success(&self, task_id: Uuid, response: &Value) -> Result<Song> {
        let mut tx = self.pool.begin().await?;

        let song = sqlx::query_as::<_, Song>(
            r#"
            UPDATE songs
            SET status = 'success',
                provider_response = $2,
                provider_status = COALESCE($3, provider_status),
                model = COALESCE($4, model),
                error_message = NULL,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE task_id = $1
              AND status NOT IN ('success', 'failure')
            RETURNING *
            "#,
        )
        .bind(task_id)
        .bind(response)
        .bind(response.get("status").and_then(Value::as_str))
        .bind(response.get("model").and_then(Value::as_str))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(song) = song else {
            warn!(task_id = %task_id, "success write ignored for terminal or missing song");
            return self
                .find_by_task_id(task_id)
                .await?
                .ok_or_else(|| anyhow!("song {} not found", task_id));
        };

        sqlx::query("DELETE FROM song_choices WHERE song_id = $1")
            .bind(song.id)
            .execute(&mut *tx)
            .await?;

        let choices = response
            .get("choices")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for (index, value) in choices.iter().enumerate() {
            let choice = SongChoice::from_provider_choice(song.id, index as i32, value);
            sqlx::query(
                r#"
                INSERT INTO song_choices (
                    id, song_id, provider_choice_id, choice_index, mp3_url, flac_url,
                    video_url, image_url, duration, title, tags
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(choice.id)
            .bind(choice.song_id)
            .bind(&choice.provider_choice_id)
            .bind(choice.choice_index)
            .bind(&choice.mp3_url)
            .bind(&choice.flac_url)
            .bind(&choice.video_url)
            .bind(&choice.image_url)
            .bind(choice.duration)
            .bind(&choice.title)
            .bind(&choice.tags)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(song)
    }

    async fn record_failure(&self, task_id: Uuid, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE songs
            SET status = 'failure',
                error_message = $2,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE task_id = $1
              AND status NOT IN ('success', 'failure')
            "#,
        )
        .bind(task_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(task_id = %task_id, "failure write ignored for terminal or missing song");
        }

        Ok(())
    }

    async fn record_retrying(&self, task_id: Uuid, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE songs
            SET status = 'retrying',
                error_message = $2,
                updated_at = NOW()
            WHERE task_id = $1
              AND status NOT IN ('success', 'failure')
            "#,
        )
        .bind(task_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_stem_url(&self, choice_id: Uuid, zip_url: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE song_choices
            SET stem_zip_url = $2,
                stem_generated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(choice_id)
        .bind(zip_url)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
