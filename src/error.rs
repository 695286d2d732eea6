use std::time::Duration;

use thiserror::Error;

pub type TimelapseResult<T> = Result<T, TimelapseError>;

/// Every way a timelapse run can fail. All variants are fatal for the run;
/// only transient [`TimelapseError::Api`] errors are absorbed by the poll loop.
#[derive(Debug, Error)]
pub enum TimelapseError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("Ring rejected the refresh token: {0}")]
    Auth(String),

    #[error("no Ring cameras found on the account")]
    NoCameraFound,

    #[error("download job submission rejected: {0}")]
    JobSubmission(String),

    #[error("download job {job_id} reported ready without a result_url")]
    MissingResultUrl { job_id: String },

    #[error("download job {job_id} did not finish within {elapsed:?}")]
    PollTimeout { job_id: String, elapsed: Duration },

    #[error("download job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },

    #[error("transcode failed (exit code {}): {detail}", label(.exit_code, "none"))]
    TranscodeFailed {
        exit_code: Option<i32>,
        detail: String,
    },

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("archive read failed: {0}")]
    Storage(String),

    #[error("no archived video at {key}")]
    VideoNotFound { key: String },

    #[error("workflow dispatch failed ({}): {message}", label(.status, "no response"))]
    Dispatch {
        status: Option<u16>,
        message: String,
    },

    #[error("Ring API request failed ({}): {message}", label(.status, "no response"))]
    Api {
        status: Option<u16>,
        message: String,
    },
}

fn label<T: ToString>(value: &Option<T>, missing: &str) -> String {
    value
        .as_ref()
        .map_or_else(|| missing.to_string(), ToString::to_string)
}

impl TimelapseError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn upload_failed(msg: impl Into<String>) -> Self {
        Self::UploadFailed(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn transcode_failed(exit_code: Option<i32>, detail: impl Into<String>) -> Self {
        Self::TranscodeFailed {
            exit_code,
            detail: detail.into(),
        }
    }

    /// Network errors, timeouts and 5xx responses.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Api { status: None, .. } => true,
            Self::Api {
                status: Some(status),
                ..
            } => *status >= 500,
            _ => false,
        }
    }

    /// Pipeline stage named in the final diagnostic line.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::InvalidInput(_) => "input validation",
            Self::Auth(_) => "authentication",
            Self::NoCameraFound => "camera selection",
            Self::JobSubmission(_) => "job submission",
            Self::MissingResultUrl { .. } | Self::PollTimeout { .. } | Self::JobFailed { .. } => {
                "job polling"
            }
            Self::TranscodeFailed { .. } => "transcode",
            Self::UploadFailed(_) => "upload",
            Self::Storage(_) | Self::VideoNotFound { .. } => "archive",
            Self::Dispatch { .. } => "dispatch",
            Self::Api { .. } => "ring api",
        }
    }
}

impl From<reqwest::Error> for TimelapseError {
    fn from(err: reqwest::Error) -> Self {
        Self::Api {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}
