use std::sync::Arc;
use std::time::Duration;

use actix_web::http::{header, StatusCode};
use actix_web::{get, post, web, App, HttpRequest, HttpResponse, HttpServer, Responder};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::dispatch::{
    DispatchGate, DispatchRequest, Rejection, SHARED_SECRET_HEADER, USER_EMAIL_HEADER,
};
use crate::error::TimelapseError;
use crate::s3_querier::{ArchivedVideo, VideoArchive};

/// Lifetime of the URLs handed out by `/videos` and `/videos/refresh-url`.
pub const GALLERY_URL_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Lifetime of the URLs handed out by `/videos/download-url`.
pub const DOWNLOAD_URL_TTL: Duration = Duration::from_secs(5 * 60);

const DOWNLOAD_CACHE_CONTROL: &str = "public, max-age=86400";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedVideo {
    #[serde(flatten)]
    pub video: ArchivedVideo,
    pub signed_url: String,
    pub signed_url_expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadUrl {
    download_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshedUrl {
    signed_url: String,
    expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct Queued {
    status: &'static str,
}

#[derive(Serialize)]
struct ApiError {
    error: String,
}

fn error_body(status: StatusCode, message: &str) -> HttpResponse {
    HttpResponse::build(status).json(ApiError {
        error: message.to_string(),
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    page_size: Option<usize>,
}

#[derive(Deserialize)]
pub struct KeyQuery {
    key: Option<String>,
}

/// Only archive objects may be signed or downloaded.
pub fn is_valid_video_key(key: &str) -> bool {
    !key.is_empty()
        && key.ends_with(".mp4")
        && !key.starts_with('/')
        && !key.contains("..")
        && !key.contains('\\')
}

fn requested_key(query: &KeyQuery) -> Result<&str, HttpResponse> {
    let Some(key) = query.key.as_deref() else {
        return Err(error_body(StatusCode::BAD_REQUEST, "Missing key parameter"));
    };
    if !is_valid_video_key(key) {
        return Err(error_body(StatusCode::BAD_REQUEST, "Invalid video key"));
    }
    Ok(key)
}

/// `attachment` disposition named after the last key segment.
fn attachment(key: &str) -> String {
    let name = key.rsplit('/').next().unwrap_or(key).replace('"', "_");
    format!("attachment; filename=\"{name}\"")
}

/// List archived timelapses, newest first, each with a 24 hour signed URL.
///
/// # Example
/// ```shell
/// curl http://localhost:8080/videos?pageSize=10
/// ```
///
/// # Returns
/// ```json
/// [{
///    "key": "2024/June/ring-custom-20240601-30x.mp4",
///    "size": 1048576,
///    "lastModified": "2024-06-01T20:35:12Z",
///    "signedUrl": "https://<account>.r2.cloudflarestorage.com/...",
///    "signedUrlExpiresAt": "2024-06-02T20:40:00Z"
/// }]
/// ```
#[get("/videos")]
pub async fn list_videos(
    archive: web::Data<dyn VideoArchive>,
    query: web::Query<ListQuery>,
) -> impl Responder {
    let mut videos = match archive.list_videos().await {
        Ok(videos) => videos,
        Err(err) => {
            error!("Listing videos failed: {}", err);
            return error_body(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list videos");
        }
    };
    if let Some(page_size) = query.page_size.filter(|n| *n > 0) {
        videos.truncate(page_size);
    }

    let mut signed = Vec::with_capacity(videos.len());
    for video in videos {
        match archive.presign_get(&video.key, GALLERY_URL_TTL).await {
            Ok(url) => signed.push(SignedVideo {
                video,
                signed_url: url.url,
                signed_url_expires_at: url.expires_at,
            }),
            Err(err) => {
                error!("Signing {} failed: {}", video.key, err);
                return error_body(StatusCode::INTERNAL_SERVER_ERROR, "Failed to sign videos");
            }
        }
    }

    HttpResponse::Ok().json(signed)
}

/// Short-lived download URL for one archived video.
///
/// # Example
/// ```shell
/// curl 'http://localhost:8080/videos/download-url?key=20240601_sunset.mp4'
/// ```
///
/// # Returns
/// ```json
/// { "downloadUrl": "https://<account>.r2.cloudflarestorage.com/..." }
/// ```
#[get("/videos/download-url")]
pub async fn download_url(
    archive: web::Data<dyn VideoArchive>,
    query: web::Query<KeyQuery>,
) -> impl Responder {
    let key = match requested_key(&query) {
        Ok(key) => key,
        Err(resp) => return resp,
    };

    match archive.presign_get(key, DOWNLOAD_URL_TTL).await {
        Ok(url) => HttpResponse::Ok().json(DownloadUrl { download_url: url.url }),
        Err(err) => {
            error!("Signing download of {} failed: {}", key, err);
            error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to generate download URL",
            )
        }
    }
}

/// Fresh 24 hour URL for a gallery entry whose URL has lapsed.
///
/// # Returns
/// ```json
/// { "signedUrl": "https://...", "expiresAt": "2024-06-02T20:40:00Z" }
/// ```
#[get("/videos/refresh-url")]
pub async fn refresh_url(
    archive: web::Data<dyn VideoArchive>,
    query: web::Query<KeyQuery>,
) -> impl Responder {
    let key = match requested_key(&query) {
        Ok(key) => key,
        Err(resp) => return resp,
    };

    match archive.presign_get(key, GALLERY_URL_TTL).await {
        Ok(url) => HttpResponse::Ok().json(RefreshedUrl {
            signed_url: url.url,
            expires_at: url.expires_at,
        }),
        Err(err) => {
            error!("Refreshing URL of {} failed: {}", key, err);
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "Failed to generate signed URL")
        }
    }
}

/// Streams one archived video through the server as an attachment.
///
/// # Example
/// ```shell
/// curl -OJ 'http://localhost:8080/videos/download?key=2024/June/ring-daily-20240601-30x.mp4'
/// ```
#[get("/videos/download")]
pub async fn download_video(
    archive: web::Data<dyn VideoArchive>,
    query: web::Query<KeyQuery>,
) -> impl Responder {
    let key = match requested_key(&query) {
        Ok(key) => key,
        Err(resp) => return resp,
    };

    match archive.open_video(key).await {
        Ok(video) => {
            let mut resp = HttpResponse::Ok();
            resp.content_type("video/mp4")
                .insert_header((header::CONTENT_DISPOSITION, attachment(key)))
                .insert_header((header::CACHE_CONTROL, DOWNLOAD_CACHE_CONTROL));
            if let Some(len) = video.content_length.and_then(|n| u64::try_from(n).ok()) {
                resp.no_chunking(len);
            }
            resp.streaming(video.body)
        }
        Err(TimelapseError::VideoNotFound { .. }) => {
            error_body(StatusCode::NOT_FOUND, "Video not found")
        }
        Err(err) => {
            error!("Downloading {} failed: {}", key, err);
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "Failed to download video")
        }
    }
}

/// Queue an archive run on the CI workflow.
///
/// Requires the shared secret header and an allow-listed user email header.
///
/// # Example
/// ```shell
/// curl -X POST http://localhost:8080/dispatch \
///   -H 'x-shared-secret: ...' -H 'x-user-email: ops@example.com' \
///   -d '{"startIso":"2024-06-01T20:00:00Z","endIso":"2024-06-01T20:30:00Z","speed":30}'
/// ```
///
/// # Returns
/// ```json
/// { "status": "queued" }
/// ```
#[post("/dispatch")]
pub async fn dispatch_run(
    gate: web::Data<DispatchGate>,
    req: HttpRequest,
    body: web::Bytes,
) -> impl Responder {
    let header_value = |name: &str| req.headers().get(name).and_then(|v| v.to_str().ok());
    match gate.authorize(header_value(SHARED_SECRET_HEADER), header_value(USER_EMAIL_HEADER)) {
        Ok(()) => {}
        Err(Rejection::Unauthorized) => {
            return error_body(StatusCode::UNAUTHORIZED, "unauthorized")
        }
        Err(Rejection::Forbidden) => return error_body(StatusCode::FORBIDDEN, "forbidden"),
    }

    let request = match serde_json::from_slice::<Option<DispatchRequest>>(&body) {
        Ok(request) => request.unwrap_or_default(),
        Err(err) => {
            warn!("Rejected dispatch body: {}", err);
            return error_body(StatusCode::BAD_REQUEST, "invalid JSON body");
        }
    };
    let Some(inputs) = request.into_inputs() else {
        return error_body(StatusCode::BAD_REQUEST, "startIso and endIso are required");
    };

    let dispatcher = match gate.dispatcher() {
        Ok(dispatcher) => dispatcher,
        Err(reason) => return error_body(StatusCode::INTERNAL_SERVER_ERROR, reason),
    };
    match dispatcher.dispatch(&inputs).await {
        Ok(()) => HttpResponse::Ok().json(Queued { status: "queued" }),
        Err(TimelapseError::Dispatch {
            status: Some(code),
            message,
        }) => {
            error!("GitHub refused the dispatch with {}: {}", code, message);
            let status = StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY);
            error_body(status, &format!("dispatch failed: {code} {message}"))
        }
        Err(err) => {
            error!("Dispatch failed: {}", err);
            error_body(StatusCode::BAD_GATEWAY, "dispatch failed")
        }
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(list_videos)
        .service(download_url)
        .service(refresh_url)
        .service(download_video)
        .service(dispatch_run);
}

/// Run the API server
pub async fn run_api_server(
    archive: Arc<dyn VideoArchive>,
    gate: DispatchGate,
    addr: &str,
) -> std::io::Result<()> {
    let archive = web::Data::from(archive);
    let gate = web::Data::new(gate);
    info!("Archive API listening on {}", addr);

    HttpServer::new(move || {
        App::new()
            .app_data(archive.clone())
            .app_data(gate.clone())
            .configure(configure)
    })
    .bind(addr)?
    .run()
    .await
}
