//! Environment-backed settings.
//!
//! Every loader takes a lookup function so tests can supply variables without
//! touching the process environment.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{TimelapseError, TimelapseResult};

pub const DEFAULT_RING_API_BASE_URL: &str = "https://api.ring.com";
pub const DEFAULT_RING_OAUTH_URL: &str = "https://oauth.ring.com/oauth/token";
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
pub const DEFAULT_GITHUB_WORKFLOW: &str = "ring-timelapse.yml";

const MIN_PART_SIZE_MB: usize = 5;

pub fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required<F>(lookup: &F, name: &str) -> TimelapseResult<String>
where
    F: Fn(&str) -> Option<String>,
{
    non_empty(lookup(name)).ok_or_else(|| TimelapseError::config(format!("{name} is not set")))
}

fn parsed_or<F, T>(lookup: &F, name: &str, default: T) -> TimelapseResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match non_empty(lookup(name)) {
        Some(raw) => raw
            .parse()
            .map_err(|_| TimelapseError::config(format!("{name} is not a valid number: {raw}"))),
        None => Ok(default),
    }
}

/// Ring account settings.
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Refresh credential from the environment. `None` when the token file
    /// is expected to supply it.
    pub refresh_token: Option<String>,
    /// Where rotated refresh tokens are persisted.
    pub token_file: Option<PathBuf>,
    pub hardware_id: Option<String>,
    pub api_base_url: String,
    pub oauth_url: String,
}

impl RingConfig {
    pub fn from_env() -> TimelapseResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> TimelapseResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self {
            refresh_token: non_empty(lookup("RING_REFRESH_TOKEN")),
            token_file: non_empty(lookup("RING_TOKEN_FILE")).map(PathBuf::from),
            hardware_id: non_empty(lookup("RING_HARDWARE_ID")),
            api_base_url: non_empty(lookup("RING_API_BASE_URL"))
                .unwrap_or_else(|| DEFAULT_RING_API_BASE_URL.to_string()),
            oauth_url: non_empty(lookup("RING_OAUTH_URL"))
                .unwrap_or_else(|| DEFAULT_RING_OAUTH_URL.to_string()),
        };

        if config.refresh_token.is_none() && config.token_file.is_none() {
            return Err(TimelapseError::config(
                "RING_REFRESH_TOKEN is not set (and no RING_TOKEN_FILE configured)",
            ));
        }

        Ok(config)
    }

    /// The refresh credential to start from: a previously rotated token in the
    /// token file wins over the environment value.
    pub async fn resolve_refresh_token(&self) -> TimelapseResult<String> {
        if let Some(ref path) = self.token_file {
            match tokio::fs::read_to_string(path).await {
                Ok(contents) if !contents.trim().is_empty() => {
                    return Ok(contents.trim().to_string());
                }
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(TimelapseError::config(format!(
                        "cannot read RING_TOKEN_FILE {}: {err}",
                        path.display()
                    )))
                }
            }
        }

        self.refresh_token
            .clone()
            .ok_or_else(|| TimelapseError::config("RING_REFRESH_TOKEN is not set"))
    }
}

/// Cloudflare R2 (S3-compatible) settings.
#[derive(Debug, Clone)]
pub struct R2Config {
    pub endpoint_url: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    pub region: String,
}

impl R2Config {
    pub fn from_env() -> TimelapseResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> TimelapseResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            endpoint_url: required(&lookup, "R2_ENDPOINT")?,
            access_key_id: required(&lookup, "R2_ACCESS_KEY_ID")?,
            secret_access_key: required(&lookup, "R2_SECRET_ACCESS_KEY")?,
            bucket: required(&lookup, "R2_BUCKET")?,
            region: non_empty(lookup("R2_REGION")).unwrap_or_else(|| "auto".to_string()),
        })
    }
}

/// Encoder, upload and polling knobs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub ffmpeg_bin: String,
    pub part_size_bytes: usize,
    pub poll: PollSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive transient poll failures tolerated before the job is
    /// declared failed.
    pub max_transient_failures: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1_000),
            timeout: Duration::from_millis(120_000),
            max_transient_failures: 5,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> TimelapseResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> TimelapseResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = PollSettings::default();
        let part_size_mb: usize = parsed_or(&lookup, "UPLOAD_PART_SIZE_MB", 8)?;
        if part_size_mb < MIN_PART_SIZE_MB {
            return Err(TimelapseError::config(format!(
                "UPLOAD_PART_SIZE_MB must be at least {MIN_PART_SIZE_MB}"
            )));
        }

        let interval_ms: u64 = parsed_or(&lookup, "POLL_INTERVAL_MS", 1_000)?;
        let timeout_ms: u64 = parsed_or(&lookup, "POLL_TIMEOUT_MS", 120_000)?;
        let max_transient_failures = parsed_or(
            &lookup,
            "POLL_MAX_TRANSIENT_FAILURES",
            defaults.max_transient_failures,
        )?;
        if interval_ms == 0 || timeout_ms == 0 || max_transient_failures == 0 {
            return Err(TimelapseError::config(
                "POLL_INTERVAL_MS, POLL_TIMEOUT_MS and POLL_MAX_TRANSIENT_FAILURES \
                 must be positive",
            ));
        }

        Ok(Self {
            ffmpeg_bin: non_empty(lookup("FFMPEG_BIN")).unwrap_or_else(|| "ffmpeg".to_string()),
            part_size_bytes: part_size_mb * 1024 * 1024,
            poll: PollSettings {
                interval: Duration::from_millis(interval_ms),
                timeout: Duration::from_millis(timeout_ms),
                max_transient_failures,
            },
        })
    }
}

/// Settings for `POST /dispatch`. Nothing here is required at startup;
/// missing values are reported per request.
#[derive(Debug, Clone, Default)]
pub struct DispatchConfig {
    pub shared_secret: Option<String>,
    /// Lowercased.
    pub allowed_emails: Vec<String>,
    /// `owner/repo`.
    pub github_repo: Option<String>,
    pub github_workflow: String,
    pub github_token: Option<String>,
    pub github_api_url: String,
    pub git_ref: String,
}

impl DispatchConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let allowed_emails = non_empty(lookup("DISPATCH_ALLOWED_EMAILS"))
            .map(|list| {
                list.split(',')
                    .map(|email| email.trim().to_lowercase())
                    .filter(|email| !email.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            shared_secret: non_empty(lookup("DISPATCH_SHARED_SECRET")),
            allowed_emails,
            github_repo: non_empty(lookup("GITHUB_REPO")),
            github_workflow: non_empty(lookup("GITHUB_WORKFLOW"))
                .unwrap_or_else(|| DEFAULT_GITHUB_WORKFLOW.to_string()),
            github_token: non_empty(lookup("GITHUB_DISPATCH_TOKEN")),
            github_api_url: non_empty(lookup("GITHUB_API_URL"))
                .unwrap_or_else(|| DEFAULT_GITHUB_API_URL.to_string()),
            git_ref: non_empty(lookup("GITHUB_REF")).unwrap_or_else(|| "main".to_string()),
        }
    }
}
