use std::pin::Pin;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_stream::Stream;

use crate::aws;
use crate::config::R2Config;
use crate::error::{TimelapseError, TimelapseResult};

/// An archived timelapse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedVideo {
    pub key: String,
    pub size: i64,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

pub type VideoBody = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// An archived object opened for reading.
pub struct VideoObject {
    pub content_length: Option<i64>,
    pub body: VideoBody,
}

const CACHE_CONTROL: &str = "public, max-age=86400, immutable";

/// Read access to the archive bucket.
#[async_trait]
pub trait VideoArchive: Send + Sync {
    async fn list_videos(&self) -> TimelapseResult<Vec<ArchivedVideo>>;

    async fn presign_get(&self, key: &str, expires_in: Duration) -> TimelapseResult<SignedUrl>;

    /// Missing keys are [`TimelapseError::VideoNotFound`].
    async fn open_video(&self, key: &str) -> TimelapseResult<VideoObject>;
}

#[derive(Clone)]
pub struct S3Querier {
    client: Client,
    bucket: String,
}

impl S3Querier {
    pub fn new(config: &R2Config) -> Self {
        S3Querier {
            client: aws::s3_client(config),
            bucket: config.bucket.clone(),
        }
    }
}

#[async_trait]
impl VideoArchive for S3Querier {
    /// Lists every `.mp4` object in the bucket, newest first.
    async fn list_videos(&self) -> TimelapseResult<Vec<ArchivedVideo>> {
        let mut videos = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let resp = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| storage_error("list objects", &e))?;

            for obj in resp.contents() {
                let Some(key) = obj.key() else { continue };
                if !key.ends_with(".mp4") {
                    continue;
                }
                videos.push(ArchivedVideo {
                    key: key.to_string(),
                    size: obj.size().unwrap_or_default(),
                    last_modified: obj
                        .last_modified()
                        .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos())),
                });
            }

            match resp.next_continuation_token() {
                Some(token) if resp.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        sort_newest_first(&mut videos);
        Ok(videos)
    }

    /// Presigned GET URL for `key`, valid for `expires_in`.
    async fn presign_get(&self, key: &str, expires_in: Duration) -> TimelapseResult<SignedUrl> {
        let presign_config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| TimelapseError::storage(format!("presign config: {e}")))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .response_cache_control(CACHE_CONTROL)
            .presigned(presign_config)
            .await
            .map_err(|e| storage_error("presign", &e))?;

        let expires_at = Utc::now()
            + chrono::Duration::from_std(expires_in).unwrap_or_else(|_| chrono::Duration::zero());

        Ok(SignedUrl {
            url: presigned.uri().to_string(),
            expires_at,
        })
    }

    async fn open_video(&self, key: &str) -> TimelapseResult<VideoObject> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    TimelapseError::VideoNotFound { key: key.to_string() }
                } else {
                    storage_error("get object", &e)
                }
            })?;

        Ok(VideoObject {
            content_length: resp.content_length(),
            body: Box::pin(object_stream(resp.body)),
        })
    }
}

fn object_stream(mut object: ByteStream) -> impl Stream<Item = std::io::Result<Bytes>> + Send {
    try_stream! {
        while let Some(chunk) = object.next().await {
            yield chunk.map_err(std::io::Error::other)?;
        }
    }
}

fn storage_error<E: std::error::Error>(action: &str, err: &E) -> TimelapseError {
    TimelapseError::storage(format!("{action}: {}", aws::display_error(err)))
}

fn sort_newest_first(videos: &mut [ArchivedVideo]) {
    videos.sort_by(|a, b| {
        b.last_modified
            .cmp(&a.last_modified)
            .then_with(|| b.key.cmp(&a.key))
    });
}
