//! Queues archive runs on the GitHub Actions workflow that executes `run`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::config::DispatchConfig;
use crate::error::{TimelapseError, TimelapseResult};

pub const SHARED_SECRET_HEADER: &str = "x-shared-secret";
pub const USER_EMAIL_HEADER: &str = "x-user-email";

const GITHUB_ACCEPT: &str = "application/vnd.github+json";
const GITHUB_TIMEOUT: Duration = Duration::from_secs(15);

const MISCONFIGURED: &str = "server misconfigured";
const BAD_REPO: &str = "GITHUB_REPO must be owner/repo";

/// Body of `POST /dispatch`. Both bounds are required; the rest is passed
/// through to the workflow as-is.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub start_iso: Option<String>,
    pub end_iso: Option<String>,
    /// Number or string.
    pub speed: Option<serde_json::Value>,
    pub out_key: Option<String>,
    pub camera_id: Option<String>,
    pub camera_name: Option<String>,
    pub clip_type: Option<String>,
}

/// Workflow inputs. GitHub only takes strings, absent values are `""`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInputs {
    pub start_iso: String,
    pub end_iso: String,
    pub speed: String,
    pub out_key: String,
    pub camera_id: String,
    pub camera_name: String,
    pub clip_type: String,
}

impl DispatchRequest {
    /// `None` when either window bound is missing or blank.
    pub fn into_inputs(self) -> Option<WorkflowInputs> {
        let present = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        let start_iso = present(self.start_iso)?;
        let end_iso = present(self.end_iso)?;

        let speed = match self.speed {
            Some(serde_json::Value::String(s)) => s,
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => String::new(),
        };

        Some(WorkflowInputs {
            start_iso,
            end_iso,
            speed,
            out_key: self.out_key.unwrap_or_default(),
            camera_id: self.camera_id.unwrap_or_default(),
            camera_name: self.camera_name.unwrap_or_default(),
            clip_type: self.clip_type.unwrap_or_default(),
        })
    }
}

#[async_trait]
pub trait WorkflowDispatch: Send + Sync {
    /// Failures carry the upstream status in [`TimelapseError::Dispatch`].
    async fn dispatch(&self, inputs: &WorkflowInputs) -> TimelapseResult<()>;
}

#[derive(Serialize)]
struct DispatchBody<'a> {
    #[serde(rename = "ref")]
    git_ref: &'a str,
    inputs: &'a WorkflowInputs,
}

/// `workflow_dispatch` through the GitHub REST API.
pub struct GithubDispatcher {
    http: reqwest::Client,
    url: String,
    token: String,
    git_ref: String,
}

/// The dispatch endpoint and token, or the message `POST /dispatch` answers with.
fn github_target(config: &DispatchConfig) -> Result<(String, String), &'static str> {
    let (Some(repo), Some(token)) = (&config.github_repo, &config.github_token) else {
        return Err(MISCONFIGURED);
    };
    let (owner, name) = repo
        .split_once('/')
        .filter(|(owner, name)| !owner.is_empty() && !name.is_empty() && !name.contains('/'))
        .ok_or(BAD_REPO)?;

    let url = format!(
        "{}/repos/{owner}/{name}/actions/workflows/{}/dispatches",
        config.github_api_url.trim_end_matches('/'),
        config.github_workflow
    );
    Ok((url, token.clone()))
}

impl GithubDispatcher {
    pub fn new(url: String, token: String, git_ref: String) -> TimelapseResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(GITHUB_TIMEOUT)
            .user_agent(concat!("ring-timelapse/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TimelapseError::config(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            http,
            url,
            token,
            git_ref,
        })
    }
}

#[async_trait]
impl WorkflowDispatch for GithubDispatcher {
    async fn dispatch(&self, inputs: &WorkflowInputs) -> TimelapseResult<()> {
        let resp = self
            .http
            .post(&self.url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, GITHUB_ACCEPT)
            .json(&DispatchBody {
                git_ref: &self.git_ref,
                inputs,
            })
            .send()
            .await
            .map_err(|e| TimelapseError::Dispatch {
                status: None,
                message: e.to_string(),
            })?;

        let status = resp.status();
        if status.is_success() {
            info!(
                "Queued timelapse {} -> {} on {}",
                inputs.start_iso, inputs.end_iso, self.git_ref
            );
            return Ok(());
        }

        let message = resp.text().await.unwrap_or_default();
        Err(TimelapseError::Dispatch {
            status: Some(status.as_u16()),
            message,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Missing or wrong shared secret, or none configured.
    Unauthorized,
    /// Caller email not on the allow-list.
    Forbidden,
}

/// Caller checks plus the dispatcher, shared by every `POST /dispatch`.
pub struct DispatchGate {
    shared_secret: Option<String>,
    allowed_emails: Vec<String>,
    dispatcher: Result<Arc<dyn WorkflowDispatch>, &'static str>,
}

impl DispatchGate {
    pub fn new(
        config: &DispatchConfig,
        dispatcher: Result<Arc<dyn WorkflowDispatch>, &'static str>,
    ) -> Self {
        Self {
            shared_secret: config.shared_secret.clone(),
            allowed_emails: config.allowed_emails.clone(),
            dispatcher,
        }
    }

    /// Gate backed by [`GithubDispatcher`]. Incomplete GitHub settings only
    /// fail the dispatch requests themselves.
    pub fn from_config(config: &DispatchConfig) -> Self {
        let dispatcher = github_target(config).and_then(|(url, token)| {
            GithubDispatcher::new(url, token, config.git_ref.clone())
                .map(|d| Arc::new(d) as Arc<dyn WorkflowDispatch>)
                .map_err(|e| {
                    warn!("{}", e);
                    MISCONFIGURED
                })
        });
        if let Err(reason) = &dispatcher {
            warn!("POST /dispatch is unavailable: {}", reason);
        }
        Self::new(config, dispatcher)
    }

    pub fn authorize(&self, secret: Option<&str>, email: Option<&str>) -> Result<(), Rejection> {
        let (Some(expected), Some(secret)) = (self.shared_secret.as_deref(), secret) else {
            return Err(Rejection::Unauthorized);
        };
        if !bool::from(expected.as_bytes().ct_eq(secret.as_bytes())) {
            return Err(Rejection::Unauthorized);
        }

        let email = email.map(|e| e.trim().to_lowercase()).unwrap_or_default();
        if email.is_empty() || !self.allowed_emails.contains(&email) {
            return Err(Rejection::Forbidden);
        }
        Ok(())
    }

    pub fn dispatcher(&self) -> Result<&dyn WorkflowDispatch, &'static str> {
        self.dispatcher.as_deref().map_err(|reason| *reason)
    }
}
