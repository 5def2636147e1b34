use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use mureka_client::PollIntervals;
use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,

    // Provider endpoints
    pub mureka_api_key: String,
    pub mureka_generate_endpoint: String,
    pub mureka_status_endpoint: String,
    pub mureka_instrumental_generate_endpoint: String,
    pub mureka_instrumental_status_endpoint: String,
    pub mureka_stem_generate_endpoint: Option<String>,
    pub mureka_timeout: Duration,

    // Polling
    pub poll_intervals: PollIntervals,
    pub max_poll_attempts: u32,

    // Provider slot
    pub slot_max_concurrent: usize,
    pub slot_max_wait: Duration,
    pub slot_poll_interval: Duration,

    // Task execution
    pub task_time_limit: Duration,
    pub task_soft_time_limit: Duration,
    pub task_max_retries: i32,
    pub task_retry_delay: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,

            mureka_api_key: env::var("MUREKA_API_KEY").context("MUREKA_API_KEY must be set")?,
            mureka_generate_endpoint: env::var("MUREKA_GENERATE_ENDPOINT")
                .context("MUREKA_GENERATE_ENDPOINT must be set")?,
            mureka_status_endpoint: env::var("MUREKA_STATUS_ENDPOINT")
                .context("MUREKA_STATUS_ENDPOINT must be set")?,
            mureka_instrumental_generate_endpoint: env::var(
                "MUREKA_INSTRUMENTAL_GENERATE_ENDPOINT",
            )
            .context("MUREKA_INSTRUMENTAL_GENERATE_ENDPOINT must be set")?,
            mureka_instrumental_status_endpoint: env::var("MUREKA_INSTRUMENTAL_STATUS_ENDPOINT")
                .context("MUREKA_INSTRUMENTAL_STATUS_ENDPOINT must be set")?,
            mureka_stem_generate_endpoint: env::var("MUREKA_STEM_GENERATE_ENDPOINT").ok(),
            mureka_timeout: duration_var("MUREKA_TIMEOUT", 30)?,

            poll_intervals: PollIntervals {
                short: duration_var("MUREKA_POLL_INTERVAL_SHORT", 5)?,
                medium: duration_var("MUREKA_POLL_INTERVAL_MEDIUM", 15)?,
                long: duration_var("MUREKA_POLL_INTERVAL_LONG", 30)?,
            },
            max_poll_attempts: parse_var("MUREKA_MAX_POLL_ATTEMPTS", 240)?,

            slot_max_concurrent: parse_var("MUREKA_MAX_CONCURRENT_REQUESTS", 1)?,
            slot_max_wait: duration_var("MUREKA_SLOT_MAX_WAIT", 3600)?,
            slot_poll_interval: duration_var("MUREKA_SLOT_POLL_INTERVAL", 10)?,

            task_time_limit: duration_var("TASK_TIME_LIMIT", 1800)?,
            task_soft_time_limit: duration_var("TASK_SOFT_TIME_LIMIT", 1500)?,
            task_max_retries: parse_var("TASK_MAX_RETRIES", 3)?,
            task_retry_delay: duration_var("TASK_RETRY_DELAY", 60)?,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("{name} must be a valid number")),
        Err(_) => Ok(default),
    }
}

fn duration_var(name: &str, default_secs: u64) -> Result<Duration> {
    Ok(Duration::from_secs(parse_var(name, default_secs)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_var_uses_default_when_unset() {
        assert_eq!(
            parse_var::<u32>("DEFINITELY_NOT_SET_ANYWHERE_123", 240).unwrap(),
            240
        );
    }

    #[test]
    fn duration_var_uses_default_when_unset() {
        assert_eq!(
            duration_var("DEFINITELY_NOT_SET_ANYWHERE_456", 30).unwrap(),
            Duration::from_secs(30)
        );
    }
}
