//! Song and song choice models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle of a generation request.
///
/// Transitions are monotonic: once terminal, a song never moves again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "song_status", rename_all = "snake_case")]
#[serde(rename_all = "UPPERCASE")]
pub enum SongStatus {
    /// Queued, no attempt has started yet.
    #[default]
    Pending,
    /// An attempt is actively working (slot wait, submission, polling).
    Progress,
    /// The last attempt failed transiently; another attempt is scheduled.
    Retrying,
    /// Generation finished and choices are persisted.
    Success,
    /// Terminal failure. No further attempts will run.
    Failure,
}

impl SongStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SongStatus::Success | SongStatus::Failure)
    }

    /// Whether moving to `next` preserves monotonicity.
    ///
    /// Terminal states accept nothing. Non-terminal states accept any
    /// non-pending state: `Progress -> Progress` covers phase updates
    /// within an attempt, `Retrying -> Progress` covers the next
    /// attempt starting.
    pub fn can_transition_to(&self, next: SongStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next != SongStatus::Pending
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Song {
    pub id: Uuid,
    /// Public handle clients poll with. Distinct from the queue job ID.
    pub task_id: Uuid,
    /// Provider-side job ID, set exactly once after submission.
    pub provider_job_id: Option<String>,

    // Request parameters
    pub lyrics: Option<String>,
    pub prompt: Option<String>,
    pub model: Option<String>,
    pub title: Option<String>,
    pub is_instrumental: bool,

    // Lifecycle
    pub status: SongStatus,
    pub progress_info: Option<Value>,
    pub provider_status: Option<String>,
    pub provider_response: Option<Value>,
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set exactly when the song enters a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SongChoice {
    pub id: Uuid,
    pub song_id: Uuid,
    pub provider_choice_id: Option<String>,
    /// Position within the provider response, stable across reads.
    pub choice_index: i32,

    pub mp3_url: Option<String>,
    pub flac_url: Option<String>,
    pub video_url: Option<String>,
    pub image_url: Option<String>,
    pub stem_zip_url: Option<String>,
    pub stem_generated_at: Option<DateTime<Utc>>,

    pub duration: Option<f64>,
    pub title: Option<String>,
    pub tags: Option<String>,
    pub rating: Option<i16>,

    pub created_at: DateTime<Utc>,
}

impl SongChoice {
    /// Build a choice row from one entry of the provider's `choices`
    /// array. Tolerant of missing keys; every field is optional except
    /// position.
    pub fn from_provider_choice(song_id: Uuid, choice_index: i32, value: &Value) -> Self {
        let text = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);

        let tags = match value.get("tags") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Array(items)) => Some(
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            _ => None,
        };

        Self {
            id: Uuid::new_v4(),
            song_id,
            provider_choice_id: match value.get("id") {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            },
            choice_index,
            mp3_url: text("mp3_url").or_else(|| text("url")),
            flac_url: text("flac_url"),
            video_url: text("video_url"),
            image_url: text("image_url"),
            stem_zip_url: None,
            stem_generated_at: None,
            duration: value.get("duration").and_then(Value::as_f64),
            title: text("title"),
            tags,
            rating: None,
            created_at: Utc::now(),
        }
    }
}

/// Public status view assembled from the song row (and queue state when
/// the song row alone cannot explain where the request is).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusView {
    pub task_id: Uuid,
    pub status: SongStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_states_accept_no_transition() {
        for next in [
            SongStatus::Pending,
            SongStatus::Progress,
            SongStatus::Retrying,
            SongStatus::Success,
            SongStatus::Failure,
        ] {
            assert!(!SongStatus::Success.can_transition_to(next));
            assert!(!SongStatus::Failure.can_transition_to(next));
        }
    }

    #[test]
    fn nothing_returns_to_pending() {
        assert!(!SongStatus::Progress.can_transition_to(SongStatus::Pending));
        assert!(!SongStatus::Retrying.can_transition_to(SongStatus::Pending));
    }

    #[test]
    fn attempt_lifecycle_transitions_are_legal() {
        assert!(SongStatus::Pending.can_transition_to(SongStatus::Progress));
        assert!(SongStatus::Progress.can_transition_to(SongStatus::Progress));
        assert!(SongStatus::Progress.can_transition_to(SongStatus::Retrying));
        assert!(SongStatus::Retrying.can_transition_to(SongStatus::Progress));
        assert!(SongStatus::Progress.can_transition_to(SongStatus::Success));
        assert!(SongStatus::Progress.can_transition_to(SongStatus::Failure));
        assert!(SongStatus::Retrying.can_transition_to(SongStatus::Failure));
    }

    #[test]
    fn choice_extraction_tolerates_missing_keys() {
        let song_id = Uuid::new_v4();
        let choice = SongChoice::from_provider_choice(song_id, 0, &json!({}));

        assert_eq!(choice.song_id, song_id);
        assert_eq!(choice.choice_index, 0);
        assert!(choice.mp3_url.is_none());
        assert!(choice.duration.is_none());
        assert!(choice.tags.is_none());
    }

    #[test]
    fn choice_extraction_reads_provider_fields() {
        let choice = SongChoice::from_provider_choice(
            Uuid::new_v4(),
            1,
            &json!({
                "id": 42,
                "mp3_url": "https://cdn/x.mp3",
                "flac_url": "https://cdn/x.flac",
                "duration": 183.5,
                "title": "Nocturne",
                "tags": ["piano", "calm"],
            }),
        );

        assert_eq!(choice.provider_choice_id.as_deref(), Some("42"));
        assert_eq!(choice.mp3_url.as_deref(), Some("https://cdn/x.mp3"));
        assert_eq!(choice.duration, Some(183.5));
        assert_eq!(choice.tags.as_deref(), Some("piano,calm"));
    }

    #[test]
    fn choice_falls_back_to_url_key() {
        let choice =
            SongChoice::from_provider_choice(Uuid::new_v4(), 0, &json!({"url": "https://cdn/a"}));
        assert_eq!(choice.mp3_url.as_deref(), Some("https://cdn/a"));
    }

    #[test]
    fn status_serializes_uppercase() {
        assert_eq!(
            serde_json::to_value(SongStatus::Progress).unwrap(),
            json!("PROGRESS")
        );
        assert_eq!(
            serde_json::to_value(SongStatus::Retrying).unwrap(),
            json!("RETRYING")
        );
    }
}
