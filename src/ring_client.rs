//! Authenticated access to the Ring REST API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::credentials::{CredentialStore, RingSession};
use crate::error::{TimelapseError, TimelapseResult};

const RING_USER_AGENT: &str =
    "ring/5.93.1 (com.ring; build:5.93.1.4; iOS 18.5.0) Alamofire/5.10.2";
const RING_API_LANG: &str = "en";
const RING_APP_BRAND: &str = "ring";

/// Applies to every call, independent of the poll deadline.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(25);

const DEVICES_PATH: &str = "/clients_api/ring_devices";
const DOWNLOADS_PATH: &str = "/share_service/v2/transcodings/downloads";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CameraRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadPayload {
    pub device_id: String,
    /// Epoch milliseconds.
    pub start_timestamp: i64,
    pub end_timestamp: i64,
    pub notification: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_file_name: Option<String>,
}

impl DownloadPayload {
    /// Push notifications are always suppressed; a missing file name is
    /// derived from the camera name and the window end.
    pub fn new(
        camera: &CameraRef,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        file_name: Option<&str>,
    ) -> TimelapseResult<Self> {
        if end <= start {
            return Err(TimelapseError::invalid_input(
                "endTimestamp must be after startTimestamp",
            ));
        }

        let custom_file_name = match file_name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => custom_file_name(&camera.name, end),
        };

        Ok(Self {
            device_id: camera.id.clone(),
            start_timestamp: start.timestamp_millis(),
            end_timestamp: end.timestamp_millis(),
            notification: false,
            custom_file_name: Some(custom_file_name),
        })
    }
}

/// `Ring_{NameWithoutWhitespace}_{YYYYMMDD}_{HHMM}` of the window end.
pub fn custom_file_name(device_name: &str, end: DateTime<Utc>) -> String {
    let compact: String = device_name.split_whitespace().collect();
    let name = if compact.is_empty() {
        "RingCamera"
    } else {
        compact.as_str()
    };
    format!("Ring_{}_{}", name, end.format("%Y%m%d_%H%M"))
}

/// A download job as the vendor reports it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawDownloadJob")]
pub struct DownloadJob {
    pub id: String,
    pub state: String,
    pub result_url: Option<String>,
    pub failure_reason: Option<String>,
}

/// Ring has used both `id` and `clip_id`, as numbers or strings.
#[derive(Deserialize)]
struct RawDownloadJob {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    clip_id: Option<serde_json::Value>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    result_url: Option<String>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

fn value_to_string(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Null | serde_json::Value::String(_) => None,
        other => Some(other.to_string()),
    }
}

impl TryFrom<RawDownloadJob> for DownloadJob {
    type Error = String;

    fn try_from(raw: RawDownloadJob) -> Result<Self, Self::Error> {
        let id = raw
            .clip_id
            .and_then(value_to_string)
            .or_else(|| raw.id.and_then(value_to_string))
            .ok_or_else(|| "download job without id or clip_id".to_string())?;

        Ok(Self {
            id,
            state: raw.state.or(raw.status).unwrap_or_default(),
            result_url: raw.result_url,
            failure_reason: raw.error.and_then(value_to_string),
        })
    }
}

/// Closed view of the vendor's job state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    InProgress,
    Ready { result_url: String },
    Failed { reason: String },
}

impl DownloadJob {
    /// Maps the vendor state string. A ready job without a usable URL is a
    /// protocol violation, not a success.
    pub fn status(&self) -> TimelapseResult<JobStatus> {
        match self.state.to_ascii_lowercase().as_str() {
            "ready" | "done" | "completed" => match self.result_url.as_deref().map(str::trim) {
                Some(url) if !url.is_empty() => Ok(JobStatus::Ready {
                    result_url: url.to_string(),
                }),
                _ => Err(TimelapseError::MissingResultUrl {
                    job_id: self.id.clone(),
                }),
            },
            "failed" | "error" | "expired" => Ok(JobStatus::Failed {
                reason: self
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| format!("job {}", self.state)),
            }),
            "pending" | "processing" | "queued" | "" => Ok(JobStatus::InProgress),
            other => {
                warn!("Unknown download job state {:?} for job {}, waiting", other, self.id);
                Ok(JobStatus::InProgress)
            }
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}

#[derive(Deserialize)]
struct RingDevice {
    #[serde(deserialize_with = "string_or_number")]
    id: String,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize, Default)]
struct DevicesResponse {
    #[serde(default)]
    doorbots: Vec<RingDevice>,
    #[serde(default)]
    authorized_doorbots: Vec<RingDevice>,
    #[serde(default)]
    stickup_cams: Vec<RingDevice>,
}

impl DevicesResponse {
    fn into_cameras(self) -> Vec<CameraRef> {
        self.doorbots
            .into_iter()
            .chain(self.authorized_doorbots)
            .chain(self.stickup_cams)
            .map(|d| CameraRef {
                id: d.id,
                name: d.description,
            })
            .collect()
    }
}

#[async_trait]
pub trait CameraApi: Send + Sync {
    /// Every camera on the account; an empty list is not an error here.
    async fn list_cameras(&self) -> TimelapseResult<Vec<CameraRef>>;

    async fn submit_download_job(&self, payload: &DownloadPayload) -> TimelapseResult<DownloadJob>;

    async fn get_download_job(&self, job_id: &str) -> TimelapseResult<DownloadJob>;
}

/// Picks `camera_id` when it matches, otherwise the first camera.
/// `name_override` replaces the selected camera's display name.
pub fn select_camera(
    cameras: &[CameraRef],
    camera_id: Option<&str>,
    name_override: Option<&str>,
) -> TimelapseResult<CameraRef> {
    let first = cameras.first().ok_or(TimelapseError::NoCameraFound)?;

    let selected = match camera_id {
        Some(id) => cameras.iter().find(|c| c.id == id).unwrap_or_else(|| {
            warn!("Camera {} not found, falling back to {} ({})", id, first.id, first.name);
            first
        }),
        None => first,
    };

    Ok(CameraRef {
        id: selected.id.clone(),
        name: name_override
            .map(str::to_string)
            .unwrap_or_else(|| selected.name.clone()),
    })
}

pub struct RingClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Arc<CredentialStore>,
}

impl RingClient {
    pub fn new(
        base_url: impl Into<String>,
        credentials: Arc<CredentialStore>,
    ) -> TimelapseResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(RING_USER_AGENT)
            .build()
            .map_err(|e| TimelapseError::config(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn request(&self, method: Method, path: &str, session: &RingSession) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&session.access_token)
            .header("hardware_id", &session.hardware_id)
            .header("X-API-LANG", RING_API_LANG)
            .header("app_brand", RING_APP_BRAND)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    /// Sends an authenticated request, retrying once with fresh credentials
    /// when Ring answers 401.
    async fn send<T, B>(&self, method: Method, path: &str, body: Option<&B>) -> TimelapseResult<T>
    where
        T: DeserializeOwned + Send,
        B: Serialize + Sync,
    {
        let mut session = self.credentials.ensure_context().await?;
        let mut retried = false;

        loop {
            let mut request = self.request(method.clone(), path, &session);
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && !retried {
                retried = true;
                session = self.credentials.refresh_after_rejection(&session).await?;
                continue;
            }

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(TimelapseError::Auth(format!(
                    "{method} {path} answered {status} with fresh credentials"
                )));
            }

            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(TimelapseError::Api {
                    status: Some(status.as_u16()),
                    message: format!("{method} {path}: {message}"),
                });
            }

            return Ok(response.json().await?);
        }
    }
}

#[async_trait]
impl CameraApi for RingClient {
    async fn list_cameras(&self) -> TimelapseResult<Vec<CameraRef>> {
        let devices: DevicesResponse = self.send(Method::GET, DEVICES_PATH, None::<&()>).await?;
        let cameras = devices.into_cameras();
        debug!("Ring returned {} cameras", cameras.len());
        Ok(cameras)
    }

    async fn submit_download_job(&self, payload: &DownloadPayload) -> TimelapseResult<DownloadJob> {
        let job: DownloadJob = self
            .send(Method::POST, DOWNLOADS_PATH, Some(payload))
            .await
            .map_err(|e| match e {
                TimelapseError::Api {
                    status: Some(status),
                    message,
                } if (400..500).contains(&status) => {
                    TimelapseError::JobSubmission(format!("{status}: {message}"))
                }
                other => other,
            })?;

        info!(
            "Submitted download job {} for device {} ({} -> {})",
            job.id, payload.device_id, payload.start_timestamp, payload.end_timestamp
        );
        Ok(job)
    }

    async fn get_download_job(&self, job_id: &str) -> TimelapseResult<DownloadJob> {
        self.send(Method::GET, &format!("{DOWNLOADS_PATH}/{job_id}"), None::<&()>)
            .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::credentials::{AuthGrant, TokenExchange};

    fn cameras() -> Vec<CameraRef> {
        vec![
            CameraRef {
                id: "1".into(),
                name: "Front Door".into(),
            },
            CameraRef {
                id: "2".into(),
                name: "Backyard".into(),
            },
        ]
    }

    struct StaticExchange;

    #[async_trait]
    impl TokenExchange for StaticExchange {
        async fn exchange(&self, _: &str, _: &str) -> TimelapseResult<AuthGrant> {
            Ok(AuthGrant {
                access_token: "token".into(),
                refresh_token: None,
                expires_in: None,
            })
        }
    }

    fn client(server: &MockServer) -> RingClient {
        let store =
            CredentialStore::new("rt", Some("hid".into()), Arc::new(StaticExchange)).unwrap();
        RingClient::new(server.uri(), Arc::new(store)).unwrap()
    }

    #[test]
    fn non_matching_id_falls_back_to_first() {
        let selected = select_camera(&cameras(), Some("99"), None).unwrap();
        assert_eq!(selected, cameras()[0]);
    }

    #[test]
    fn matching_id_applies_name_override() {
        let selected = select_camera(&cameras(), Some("2"), Some("Garden")).unwrap();
        assert_eq!(selected.id, "2");
        assert_eq!(selected.name, "Garden");
    }

    #[test]
    fn empty_device_list_is_no_camera_found() {
        let err = select_camera(&[], Some("1"), None).unwrap_err();
        assert!(matches!(err, TimelapseError::NoCameraFound));
    }

    #[test]
    fn custom_file_name_strips_whitespace() {
        let end = Utc.with_ymd_and_hms(2024, 6, 1, 20, 30, 0).unwrap();
        assert_eq!(custom_file_name("Front Door", end), "Ring_FrontDoor_20240601_2030");
        assert_eq!(custom_file_name("  ", end), "Ring_RingCamera_20240601_2030");
    }

    #[test]
    fn payload_rejects_inverted_window() {
        let t = Utc.with_ymd_and_hms(2024, 6, 1, 20, 0, 0).unwrap();
        assert!(DownloadPayload::new(&cameras()[0], t, t, None).is_err());
    }

    #[test]
    fn ready_without_url_is_a_protocol_violation() {
        let job = DownloadJob {
            id: "7".into(),
            state: "ready".into(),
            result_url: None,
            failure_reason: None,
        };
        assert!(matches!(
            job.status(),
            Err(TimelapseError::MissingResultUrl { .. })
        ));
    }

    #[test]
    fn vendor_states_map_to_closed_status() {
        let job: DownloadJob = serde_json::from_value(serde_json::json!({
            "clip_id": 123,
            "state": "processing"
        }))
        .unwrap();
        assert_eq!(job.id, "123");
        assert_eq!(job.status().unwrap(), JobStatus::InProgress);

        let expired: DownloadJob =
            serde_json::from_value(serde_json::json!({"id": "9", "state": "expired"})).unwrap();
        assert!(matches!(expired.status().unwrap(), JobStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn lists_cameras_from_every_device_group() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DEVICES_PATH))
            .and(header("authorization", "Bearer token"))
            .and(header("hardware_id", "hid"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "doorbots": [{"id": 10, "description": "Front Door"}],
                "authorized_doorbots": [],
                "stickup_cams": [{"id": 20, "description": "Roof"}],
                "chimes": [{"id": 30, "description": "Hallway"}]
            })))
            .mount(&server)
            .await;

        let cams = client(&server).list_cameras().await.unwrap();
        let ids: Vec<&str> = cams.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["10", "20"]);

        let requests = server.received_requests().await.unwrap();
        let hids: Vec<_> = requests[0].headers.get_all("hardware_id").iter().collect();
        assert_eq!(hids, vec!["hid"]);
    }

    #[tokio::test]
    async fn unauthorized_after_refresh_is_an_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(DOWNLOADS_PATH))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let start = Utc.with_ymd_and_hms(2024, 6, 1, 20, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 6, 1, 20, 30, 0).unwrap();
        let payload = DownloadPayload::new(&cameras()[0], start, end, None).unwrap();

        let err = client(&server).submit_download_job(&payload).await.unwrap_err();
        assert!(matches!(err, TimelapseError::Auth(_)));
    }

    #[tokio::test]
    async fn forbidden_listing_is_an_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DEVICES_PATH))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let err = client(&server).list_cameras().await.unwrap_err();
        assert!(matches!(err, TimelapseError::Auth(_)));
    }

    #[tokio::test]
    async fn rejected_submission_is_a_submission_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(DOWNLOADS_PATH))
            .respond_with(ResponseTemplate::new(422).set_body_string("window too long"))
            .mount(&server)
            .await;

        let start = Utc.with_ymd_and_hms(2024, 6, 1, 20, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 6, 1, 20, 30, 0).unwrap();
        let payload = DownloadPayload::new(&cameras()[0], start, end, None).unwrap();

        let err = client(&server).submit_download_job(&payload).await.unwrap_err();
        assert!(matches!(err, TimelapseError::JobSubmission(_)));
    }

    #[tokio::test]
    async fn server_errors_on_status_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{DOWNLOADS_PATH}/5")))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client(&server).get_download_job("5").await.unwrap_err();
        assert!(err.is_transient());
    }
}
