//! Ring credential lifecycle.
//!
//! A [`CredentialStore`] owns the refresh credential, exchanges it for an
//! access token on first use and whenever the access token goes stale, and
//! publishes every rotated refresh token on a watch channel so it survives
//! process restarts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{TimelapseError, TimelapseResult};

/// Refresh this long before the vendor-reported expiry (at most half the
/// token lifetime).
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Used when the vendor omits `expires_in`.
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

const OAUTH_CLIENT_ID: &str = "ring_official_android";
const OAUTH_USER_AGENT: &str = "android:com.ringapp";

/// Result of one refresh-token exchange.
#[derive(Debug, Clone)]
pub struct AuthGrant {
    pub access_token: String,
    /// The vendor may rotate the refresh token on every exchange.
    pub refresh_token: Option<String>,
    pub expires_in: Option<Duration>,
}

#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(&self, refresh_token: &str, hardware_id: &str) -> TimelapseResult<AuthGrant>;
}

/// The Ring OAuth endpoint.
pub struct OAuthExchange {
    http: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    client_id: &'a str,
    scope: &'a str,
    grant_type: &'a str,
    refresh_token: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

impl OAuthExchange {
    pub fn new(url: impl Into<String>) -> TimelapseResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(25))
            .build()
            .map_err(|e| TimelapseError::config(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl TokenExchange for OAuthExchange {
    async fn exchange(&self, refresh_token: &str, hardware_id: &str) -> TimelapseResult<AuthGrant> {
        let response = self
            .http
            .post(&self.url)
            .header("2fa-support", "true")
            .header("2fa-code", "")
            .header("hardware_id", hardware_id)
            .header(reqwest::header::USER_AGENT, OAUTH_USER_AGENT)
            .json(&RefreshRequest {
                client_id: OAUTH_CLIENT_ID,
                scope: "client",
                grant_type: "refresh_token",
                refresh_token,
            })
            .send()
            .await?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(TimelapseError::Auth(format!("{status}: {body}")));
        }
        if !status.is_success() {
            return Err(TimelapseError::Api {
                status: Some(status.as_u16()),
                message: "token exchange failed".into(),
            });
        }

        let body: RefreshResponse = response.json().await?;
        Ok(AuthGrant {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            expires_in: body.expires_in.map(Duration::from_secs),
        })
    }
}

/// The `base64(JSON {"rt", "hid"})` refresh-token form used by Ring clients.
#[derive(Debug, Serialize, Deserialize)]
struct EncodedRefreshToken {
    rt: String,
    hid: Option<String>,
}

/// Splits a refresh credential into the raw token and any embedded
/// hardware id. Plain tokens pass through untouched.
pub fn parse_refresh_token(raw: &str) -> (String, Option<String>) {
    let decoded = STANDARD
        .decode(raw.trim())
        .ok()
        .and_then(|bytes| serde_json::from_slice::<EncodedRefreshToken>(&bytes).ok());

    match decoded {
        Some(token) => (token.rt, token.hid),
        None => (raw.trim().to_string(), None),
    }
}

pub fn encode_refresh_token(refresh_token: &str, hardware_id: &str) -> String {
    let token = EncodedRefreshToken {
        rt: refresh_token.to_string(),
        hid: Some(hardware_id.to_string()),
    };
    // Serializing two strings cannot fail.
    STANDARD.encode(serde_json::to_vec(&token).unwrap_or_default())
}

/// Snapshot of the current credentials. Replaced wholesale on rotation so a
/// reader never observes a half-updated pair.
#[derive(Debug)]
pub struct RingSession {
    pub access_token: String,
    pub hardware_id: String,
    refresh_token: String,
    refresh_at: Instant,
}

impl RingSession {
    fn is_fresh(&self) -> bool {
        Instant::now() < self.refresh_at
    }
}

pub struct CredentialStore {
    exchange: Arc<dyn TokenExchange>,
    initial_refresh_token: String,
    hardware_id: String,
    session: OnceCell<RwLock<Arc<RingSession>>>,
    rotations: watch::Sender<Option<String>>,
}

impl CredentialStore {
    /// `hardware_id` overrides any id embedded in the refresh credential;
    /// without either a new one is generated for this process.
    pub fn new(
        refresh_credential: &str,
        hardware_id: Option<String>,
        exchange: Arc<dyn TokenExchange>,
    ) -> TimelapseResult<Self> {
        let (refresh_token, embedded_hid) = parse_refresh_token(refresh_credential);
        if refresh_token.is_empty() {
            return Err(TimelapseError::config("refresh token is empty"));
        }

        let hardware_id = hardware_id
            .or(embedded_hid)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (rotations, _) = watch::channel(None);

        Ok(Self {
            exchange,
            initial_refresh_token: refresh_token,
            hardware_id,
            session: OnceCell::new(),
            rotations,
        })
    }

    /// Receives every rotated refresh credential, already in the encoded
    /// `{rt, hid}` form.
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.rotations.subscribe()
    }

    /// Returns valid credentials. The first caller performs the exchange;
    /// concurrent callers wait on the same initialization.
    pub async fn ensure_context(&self) -> TimelapseResult<Arc<RingSession>> {
        let cell = self
            .session
            .get_or_try_init(|| async {
                info!("Authenticating with Ring (hardware_id={})", self.hardware_id);
                let session = self.exchange_now(&self.initial_refresh_token).await?;
                Ok::<_, TimelapseError>(RwLock::new(Arc::new(session)))
            })
            .await?;

        let current = cell.read().await.clone();
        if current.is_fresh() {
            return Ok(current);
        }

        let mut guard = cell.write().await;
        if guard.is_fresh() {
            return Ok(guard.clone());
        }

        debug!("Ring access token is stale, refreshing");
        let next = Arc::new(self.exchange_now(&guard.refresh_token).await?);
        *guard = next.clone();
        Ok(next)
    }

    /// Forces a refresh after the API rejected `stale`. If another caller
    /// already replaced it, the newer session is returned as is.
    pub async fn refresh_after_rejection(
        &self,
        stale: &RingSession,
    ) -> TimelapseResult<Arc<RingSession>> {
        let Some(cell) = self.session.get() else {
            return self.ensure_context().await;
        };

        let mut guard = cell.write().await;
        if guard.access_token != stale.access_token {
            return Ok(guard.clone());
        }

        warn!("Ring rejected the access token, refreshing");
        let next = Arc::new(self.exchange_now(&guard.refresh_token).await?);
        *guard = next.clone();
        Ok(next)
    }

    async fn exchange_now(&self, refresh_token: &str) -> TimelapseResult<RingSession> {
        let grant = self.exchange.exchange(refresh_token, &self.hardware_id).await?;

        let refresh_token = match grant.refresh_token {
            Some(rotated) if rotated != refresh_token => {
                info!("Ring refresh token rotated");
                self.rotations
                    .send_replace(Some(encode_refresh_token(&rotated, &self.hardware_id)));
                rotated
            }
            _ => refresh_token.to_string(),
        };

        let ttl = grant.expires_in.unwrap_or(DEFAULT_TOKEN_TTL);
        Ok(RingSession {
            access_token: grant.access_token,
            hardware_id: self.hardware_id.clone(),
            refresh_token,
            refresh_at: Instant::now() + ttl - REFRESH_MARGIN.min(ttl / 2),
        })
    }
}

#[async_trait]
pub trait TokenSink: Send + Sync {
    async fn persist(&self, credential: &str) -> TimelapseResult<()>;
}

/// Writes rotated credentials to a file, replacing it atomically.
pub struct FileTokenSink {
    path: PathBuf,
}

impl FileTokenSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TokenSink for FileTokenSink {
    async fn persist(&self, credential: &str) -> TimelapseResult<()> {
        let tmp = self.path.with_extension("tmp");
        let io_err = |e: std::io::Error| {
            TimelapseError::config(format!("cannot persist token to {}: {e}", self.path.display()))
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
            }
        }
        tokio::fs::write(&tmp, credential).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        Ok(())
    }
}

/// Background task persisting rotations until every store handle is dropped.
pub struct TokenPersistence {
    handle: JoinHandle<()>,
}

impl TokenPersistence {
    pub fn spawn(mut rotations: watch::Receiver<Option<String>>, sink: Arc<dyn TokenSink>) -> Self {
        let handle = tokio::spawn(async move {
            while rotations.changed().await.is_ok() {
                let credential = rotations.borrow_and_update().clone();
                if let Some(credential) = credential {
                    match sink.persist(&credential).await {
                        Ok(()) => info!("Persisted rotated Ring refresh token"),
                        Err(e) => warn!("Failed to persist rotated Ring refresh token: {}", e),
                    }
                }
            }
        });

        Self { handle }
    }

    /// Waits for the last rotation to be written. Call after dropping the
    /// store.
    pub async fn finish(self) {
        if let Err(e) = self.handle.await {
            warn!("Token persistence task ended abnormally: {}", e);
        }
    }
}
