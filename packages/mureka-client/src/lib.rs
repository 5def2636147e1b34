//! Pure Mureka REST API client
//!
//! A clean, minimal client for the Mureka music-generation API with no
//! domain-specific logic. Covers job submission, status polling, and
//! stem generation, plus the pure helpers the orchestration layer needs
//! (adaptive poll intervals, 429 classification, response cleaning).
//!
//! # Example
//!
//! ```rust,ignore
//! use mureka_client::{GenerationClient, MurekaClient};
//! use serde_json::json;
//!
//! let client = MurekaClient::song(
//!     api_key,
//!     "https://api.mureka.ai/v1/song/generate",
//!     "https://api.mureka.ai/v1/song/query",
//! );
//!
//! let submission = client.submit(&json!({
//!     "lyrics": "...",
//!     "prompt": "melancholic piano ballad",
//!     "model": "auto",
//! })).await?;
//!
//! let status = client.check_status(&submission.job_id).await?;
//! ```

pub mod clean;
pub mod error;
pub mod polling;
pub mod types;

pub use clean::{clean_response, prune, DEFAULT_STRIPPED_KEYS};
pub use error::{classify_rate_limit, MurekaError, RateLimitKind, Result};
pub use polling::{adaptive_poll_interval, PollIntervals};
pub use types::{ProviderStatus, StatusResponse, StemResult, Submission};

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::Value;
use tracing::{debug, info};

/// Payload keys forwarded for song generation; everything else is stripped.
pub const SONG_PARAMS: &[&str] = &["lyrics", "prompt", "model"];

/// Payload keys forwarded for instrumental generation.
pub const INSTRUMENTAL_PARAMS: &[&str] = &["prompt", "model"];

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const STEM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const STEM_READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Client seam for one generation job kind.
///
/// The orchestrator only depends on this trait, so job kinds (song,
/// instrumental) are separate client instances rather than separate
/// task bodies, and tests can substitute a scripted fake.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Submit a generation request. The payload is sanitized to the
    /// provider-recognized keys for this job kind before sending.
    async fn submit(&self, payload: &Value) -> Result<Submission>;

    /// Poll the status of a previously submitted job.
    async fn check_status(&self, job_id: &str) -> Result<StatusResponse>;
}

/// Mureka API client for one generation endpoint pair.
#[derive(Clone)]
pub struct MurekaClient {
    http_client: Client,
    api_key: String,
    generate_url: String,
    status_url: String,
    stem_url: Option<String>,
    allowed_params: &'static [&'static str],
    timeout: Duration,
}

impl MurekaClient {
    /// Create a client for standard song generation.
    pub fn song(
        api_key: impl Into<String>,
        generate_url: impl Into<String>,
        status_url: impl Into<String>,
    ) -> Self {
        Self::new(api_key, generate_url, status_url, SONG_PARAMS)
    }

    /// Create a client for instrumental generation.
    pub fn instrumental(
        api_key: impl Into<String>,
        generate_url: impl Into<String>,
        status_url: impl Into<String>,
    ) -> Self {
        Self::new(api_key, generate_url, status_url, INSTRUMENTAL_PARAMS)
    }

    fn new(
        api_key: impl Into<String>,
        generate_url: impl Into<String>,
        status_url: impl Into<String>,
        allowed_params: &'static [&'static str],
    ) -> Self {
        Self {
            http_client: Client::builder()
                .connect_timeout(STEM_CONNECT_TIMEOUT)
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            generate_url: generate_url.into(),
            status_url: status_url.into(),
            stem_url: None,
            allowed_params,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the request timeout (default 30s).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable stem generation against the given endpoint.
    pub fn with_stem_endpoint(mut self, url: impl Into<String>) -> Self {
        self.stem_url = Some(url.into());
        self
    }

    /// Generate stems for an already-rendered track.
    ///
    /// Stem rendering is synchronous on the provider side and can take
    /// minutes, so this uses a long read timeout while keeping the
    /// short connect timeout.
    pub async fn generate_stems(&self, mp3_url: &str) -> Result<StemResult> {
        let endpoint = self
            .stem_url
            .as_deref()
            .ok_or_else(|| MurekaError::Config("stem endpoint not configured".into()))?;

        info!(endpoint, mp3_url, "starting stem generation");

        let request = self
            .http_client
            .post(endpoint)
            .bearer_auth(&self.api_key)
            .timeout(STEM_READ_TIMEOUT)
            .json(&serde_json::json!({ "url": mp3_url }));

        let raw = self.execute(request).await?;
        let zip_url = raw
            .get("zip_url")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(StemResult { zip_url, raw })
    }

    /// Keep only the provider-recognized keys of a payload object.
    fn sanitize_payload(&self, payload: &Value) -> Result<Value> {
        let object = payload
            .as_object()
            .ok_or_else(|| MurekaError::Parse("payload must be a JSON object".into()))?;

        Ok(Value::Object(
            object
                .iter()
                .filter(|(k, _)| self.allowed_params.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ))
    }

    /// Send a request and decode the JSON body, mapping failures into
    /// the client error taxonomy.
    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<Value> {
        let response = request
            .send()
            .await
            .map_err(|e| MurekaError::Network(e.to_string()))?;

        let status = response.status();
        debug!(status = status.as_u16(), "mureka api response");

        if !status.is_success() {
            return Err(Self::api_error(response).await);
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| MurekaError::Parse(e.to_string()))
    }

    /// Build an `Api` error from a non-2xx response, preferring the
    /// provider's structured message over the raw body.
    async fn api_error(response: Response) -> MurekaError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let text = response.text().await.unwrap_or_default();
        let body = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| {
                v.get("message")
                    .or_else(|| v.get("error"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| {
                if text.is_empty() {
                    status
                        .canonical_reason()
                        .unwrap_or("unknown error")
                        .to_string()
                } else {
                    text
                }
            });

        MurekaError::Api {
            status: status.as_u16(),
            body,
            retry_after,
        }
    }
}

#[async_trait]
impl GenerationClient for MurekaClient {
    async fn submit(&self, payload: &Value) -> Result<Submission> {
        let sanitized = self.sanitize_payload(payload)?;

        info!(endpoint = %self.generate_url, "starting mureka generation");

        let request = self
            .http_client
            .post(&self.generate_url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&sanitized);

        let raw = self.execute(request).await?;

        let job_id = match raw.get("id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(MurekaError::Parse("no job id returned".into())),
        };

        info!(job_id = %job_id, "mureka generation started");
        Ok(Submission { job_id, raw })
    }

    async fn check_status(&self, job_id: &str) -> Result<StatusResponse> {
        let status_url = format!("{}/{}", self.status_url, job_id);
        debug!(job_id, %status_url, "checking mureka status");

        let request = self
            .http_client
            .get(&status_url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout);

        let raw = self.execute(request).await?;
        let response = StatusResponse::new(raw);
        debug!(job_id, status = response.status_str(), "mureka status response");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_strips_unknown_keys() {
        let client = MurekaClient::song("key", "http://g", "http://s");
        let sanitized = client
            .sanitize_payload(&json!({
                "lyrics": "la la",
                "prompt": "jazz",
                "model": "auto",
                "task_hint": "internal",
                "user_id": 7,
            }))
            .unwrap();

        assert_eq!(
            sanitized,
            json!({"lyrics": "la la", "prompt": "jazz", "model": "auto"})
        );
    }

    #[test]
    fn instrumental_strips_lyrics() {
        let client = MurekaClient::instrumental("key", "http://g", "http://s");
        let sanitized = client
            .sanitize_payload(&json!({"lyrics": "la", "prompt": "lofi", "model": "auto"}))
            .unwrap();

        assert_eq!(sanitized, json!({"prompt": "lofi", "model": "auto"}));
    }

    #[test]
    fn sanitize_rejects_non_object_payload() {
        let client = MurekaClient::song("key", "http://g", "http://s");
        assert!(matches!(
            client.sanitize_payload(&json!(["not", "an", "object"])),
            Err(MurekaError::Parse(_))
        ));
    }

    #[test]
    fn stems_require_configured_endpoint() {
        let client = MurekaClient::song("key", "http://g", "http://s");
        let err = tokio_test::block_on(client.generate_stems("http://x/1.mp3")).unwrap_err();
        assert!(matches!(err, MurekaError::Config(_)));
    }
}
