//! Request/response types for the Mureka API.

use serde_json::Value;

/// A successfully submitted generation job.
#[derive(Debug, Clone)]
pub struct Submission {
    /// Job identifier issued by the provider.
    pub job_id: String,
    /// Full response body, verbatim.
    pub raw: Value,
}

/// Provider-reported job state, parsed from the status string.
///
/// Providers may introduce new status tokens without notice, so
/// anything unrecognized is treated as "still going" rather than an
/// error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    Succeeded,
    Failed,
    Cancelled,
    InProgress(String),
}

impl ProviderStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "succeeded" => ProviderStatus::Succeeded,
            "failed" => ProviderStatus::Failed,
            "cancelled" => ProviderStatus::Cancelled,
            other => ProviderStatus::InProgress(other.to_string()),
        }
    }

    /// Whether the job has reached a terminal state on the provider side.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProviderStatus::Succeeded | ProviderStatus::Failed | ProviderStatus::Cancelled
        )
    }
}

/// One poll of the provider's status endpoint.
#[derive(Debug, Clone)]
pub struct StatusResponse {
    /// Full response body, verbatim.
    pub raw: Value,
}

impl StatusResponse {
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    /// The raw status string, `"unknown"` if absent.
    pub fn status_str(&self) -> &str {
        self.raw
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
    }

    /// The parsed provider status.
    pub fn status(&self) -> ProviderStatus {
        ProviderStatus::parse(self.status_str())
    }

    /// Provider-reported progress percentage, if present.
    pub fn progress(&self) -> Option<f64> {
        self.raw.get("progress").and_then(Value::as_f64)
    }

    /// Provider-reported failure reason, if present.
    pub fn failed_reason(&self) -> Option<&str> {
        self.raw.get("failed_reason").and_then(Value::as_str)
    }
}

/// Result of a stem-generation request.
#[derive(Debug, Clone)]
pub struct StemResult {
    /// Download URL for the generated stem archive, if provided.
    pub zip_url: Option<String>,
    /// Full response body, verbatim.
    pub raw: Value,
}
