//! One timelapse run: camera, download job, encoder, archive.

use std::sync::Arc;

use log::{info, warn};
use tokio_stream::wrappers::ReceiverStream;

use crate::archive_key;
use crate::config::{PipelineConfig, R2Config, RingConfig};
use crate::credentials::{CredentialStore, FileTokenSink, OAuthExchange, TokenPersistence};
use crate::error::TimelapseResult;
use crate::job_poller;
use crate::ring_client::{self, CameraApi, CameraRef, DownloadPayload, RingClient};
use crate::s3_uploader::{self, MultipartSink, S3Uploader};
use crate::transcode::{self, EncoderCommand};
use crate::window::TimeWindow;

/// How the archive key is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyScheme {
    /// `{year}/{MonthName}/ring-{kind}-{YYYYMMDD}-{speed}x.mp4` unless overridden.
    Timelapse {
        clip_type: Option<String>,
        key_override: Option<String>,
    },
    /// `{YYYYMMDD}_sunset.mp4`.
    Sunset,
}

impl KeyScheme {
    pub fn key(&self, window: &TimeWindow, speed: f64) -> String {
        match self {
            KeyScheme::Timelapse {
                clip_type,
                key_override,
            } => archive_key::derive_key(
                window.start,
                window.end,
                clip_type.as_deref(),
                speed,
                key_override.as_deref(),
            ),
            KeyScheme::Sunset => archive_key::sunset_key(window.start),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub window: TimeWindow,
    pub speed: f64,
    pub camera_id: Option<String>,
    pub camera_name: Option<String>,
    pub key_scheme: KeyScheme,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub camera: CameraRef,
    pub job_id: String,
    pub key: String,
    pub parts: usize,
    pub bytes: usize,
}

/// Wires the Ring account, the R2 bucket and the encoder together and runs
/// the pipeline once. Rotated refresh tokens are flushed before returning.
pub async fn run(
    ring: &RingConfig,
    r2: &R2Config,
    pipeline: &PipelineConfig,
    request: &RunRequest,
) -> TimelapseResult<RunReport> {
    let refresh_token = ring.resolve_refresh_token().await?;
    let exchange = Arc::new(OAuthExchange::new(ring.oauth_url.clone())?);
    let store = Arc::new(CredentialStore::new(
        &refresh_token,
        ring.hardware_id.clone(),
        exchange,
    )?);

    let persistence = ring.token_file.as_ref().map(|path| {
        TokenPersistence::spawn(store.subscribe(), Arc::new(FileTokenSink::new(path.clone())))
    });

    let client = RingClient::new(ring.api_base_url.clone(), Arc::clone(&store))?;
    let uploader = S3Uploader::new(r2);

    let result = run_pipeline(&client, &uploader, pipeline, request).await;

    // The persistence task exits once the last store handle is gone.
    drop(client);
    drop(store);
    if let Some(persistence) = persistence {
        persistence.finish().await;
    }

    result
}

/// The run itself against any camera API and multipart sink.
pub async fn run_pipeline(
    api: &dyn CameraApi,
    sink: &dyn MultipartSink,
    pipeline: &PipelineConfig,
    request: &RunRequest,
) -> TimelapseResult<RunReport> {
    let window = request.window;
    info!(
        "Timelapse of {} -> {} ({} min) at {}x",
        window.start.to_rfc3339(),
        window.end.to_rfc3339(),
        window.duration().num_minutes(),
        request.speed
    );

    let cameras = api.list_cameras().await?;
    let camera = ring_client::select_camera(
        &cameras,
        request.camera_id.as_deref(),
        request.camera_name.as_deref(),
    )?;
    info!("Using camera {} ({})", camera.id, camera.name);

    let payload = DownloadPayload::new(&camera, window.start, window.end, None)?;
    let ready = job_poller::submit_and_poll(api, &payload, pipeline.poll).await?;

    let key = request.key_scheme.key(&window, request.speed);
    info!("Archiving job {} to {}", ready.job_id, key);

    let command = EncoderCommand::timelapse(&pipeline.ffmpeg_bin, &ready.result_url, request.speed);
    let (parts, encoder) = transcode::spawn(&command, pipeline.part_size_bytes)?;

    let summary = match s3_uploader::upload_stream(sink, &key, ReceiverStream::new(parts)).await {
        Ok(summary) => summary,
        Err(e) => {
            warn!("Upload of {} failed, stopping encoder", key);
            encoder.terminate().await;
            return Err(e);
        }
    };
    encoder.wait().await?;

    info!(
        "Archived {} ({} parts, {} bytes)",
        summary.key, summary.parts, summary.bytes
    );
    Ok(RunReport {
        camera,
        job_id: ready.job_id,
        key: summary.key,
        parts: summary.parts,
        bytes: summary.bytes,
    })
}
