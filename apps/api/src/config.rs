use std::time::Duration;

use anyhow::{Context, Result};

use crate::hearing::machine::{RetryPolicy, DEFAULT_CALL_TIMEOUT, DEFAULT_MAX_RETRIES};

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MAX_AUDIO_BYTES: usize = 25 * 1024 * 1024;

/// Application configuration loaded from environment variables.
/// Startup fails if required variables are missing.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub gemini_api_key: String,
    pub port: u16,
    pub rust_log: String,
    pub max_retries: u32,
    pub call_timeout: Duration,
    /// Deadline for a whole hearing request; the run is cancelled when it passes.
    pub request_timeout: Duration,
    pub max_audio_bytes: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            gemini_api_key: require_env("GEMINI_API_KEY")?,
            port: parse_or("PORT", optional_env("PORT"), 8080)?,
            rust_log: optional_env("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            max_retries: parse_or(
                "HEARING_MAX_RETRIES",
                optional_env("HEARING_MAX_RETRIES"),
                DEFAULT_MAX_RETRIES,
            )?,
            call_timeout: Duration::from_secs(parse_or(
                "HEARING_CALL_TIMEOUT_SECS",
                optional_env("HEARING_CALL_TIMEOUT_SECS"),
                DEFAULT_CALL_TIMEOUT.as_secs(),
            )?),
            request_timeout: Duration::from_secs(parse_or(
                "HEARING_REQUEST_TIMEOUT_SECS",
                optional_env("HEARING_REQUEST_TIMEOUT_SECS"),
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )?),
            max_audio_bytes: parse_or(
                "MAX_AUDIO_BYTES",
                optional_env("MAX_AUDIO_BYTES"),
                DEFAULT_MAX_AUDIO_BYTES,
            )?,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            call_timeout: self.call_timeout,
        }
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Some(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("{key} has an invalid value '{value}'")),
        None => Ok(default),
    }
}
