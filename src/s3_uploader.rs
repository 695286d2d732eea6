use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use log::{debug, info, warn};
use tokio_stream::{Stream, StreamExt};

use crate::aws;
use crate::config::R2Config;
use crate::error::{TimelapseError, TimelapseResult};

pub const CONTENT_TYPE: &str = "video/mp4";

/// One uploaded part, as needed to complete the upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: i32,
    pub e_tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub key: String,
    pub parts: usize,
    pub bytes: usize,
}

/// The multipart operations the archive upload needs.
#[async_trait]
pub trait MultipartSink: Send + Sync {
    async fn create(&self, key: &str, content_type: &str) -> TimelapseResult<String>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> TimelapseResult<UploadedPart>;

    async fn complete(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> TimelapseResult<()>;

    async fn abort(&self, key: &str, upload_id: &str) -> TimelapseResult<()>;
}

pub struct S3Uploader {
    client: Client,
    bucket: String,
}

impl S3Uploader {
    /// Creates a new S3Uploader for the configured R2 bucket.
    pub fn new(config: &R2Config) -> Self {
        S3Uploader {
            client: aws::s3_client(config),
            bucket: config.bucket.clone(),
        }
    }
}

fn sdk_error(action: &str, err: impl std::fmt::Display) -> TimelapseError {
    TimelapseError::upload_failed(format!("{action}: {err}"))
}

#[async_trait]
impl MultipartSink for S3Uploader {
    async fn create(&self, key: &str, content_type: &str) -> TimelapseResult<String> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| sdk_error("create multipart upload", aws::display_error(&e)))?;

        response
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| TimelapseError::upload_failed("no upload id in response"))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> TimelapseResult<UploadedPart> {
        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| sdk_error("upload part", aws::display_error(&e)))?;

        Ok(UploadedPart {
            part_number,
            e_tag: response.e_tag().map(str::to_string),
        })
    }

    async fn complete(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> TimelapseResult<()> {
        let parts = parts
            .into_iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number)
                    .set_e_tag(p.e_tag)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(|e| sdk_error("complete multipart upload", aws::display_error(&e)))?;

        Ok(())
    }

    async fn abort(&self, key: &str, upload_id: &str) -> TimelapseResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| sdk_error("abort multipart upload", aws::display_error(&e)))?;

        Ok(())
    }
}

/// Streams parts into a multipart upload at `key`.
///
/// The upload is completed only when the stream ends without an error item;
/// any error (from the stream or from storage) aborts it so no partial object
/// becomes visible. At most one part is held here at a time.
pub async fn upload_stream<S>(
    sink: &dyn MultipartSink,
    key: &str,
    parts: S,
) -> TimelapseResult<UploadSummary>
where
    S: Stream<Item = TimelapseResult<Bytes>> + Send,
{
    let upload_id = sink.create(key, CONTENT_TYPE).await?;
    info!("Started multipart upload {} for {}", upload_id, key);

    let outcome = send_parts(sink, key, &upload_id, parts).await;
    let result = match outcome {
        Ok((completed, _)) if completed.is_empty() => {
            Err(TimelapseError::upload_failed("encoder produced no output"))
        }
        Ok((completed, bytes)) => {
            let count = completed.len();
            sink.complete(key, &upload_id, completed).await.map(|()| UploadSummary {
                key: key.to_string(),
                parts: count,
                bytes,
            })
        }
        Err(e) => Err(e),
    };

    if let Err(ref e) = result {
        warn!("Aborting multipart upload {} for {}: {}", upload_id, key, e);
        if let Err(abort_err) = sink.abort(key, &upload_id).await {
            warn!("Abort of upload {} failed: {}", upload_id, abort_err);
        }
    }

    result
}

async fn send_parts<S>(
    sink: &dyn MultipartSink,
    key: &str,
    upload_id: &str,
    parts: S,
) -> TimelapseResult<(Vec<UploadedPart>, usize)>
where
    S: Stream<Item = TimelapseResult<Bytes>> + Send,
{
    tokio::pin!(parts);
    let mut completed = Vec::new();
    let mut bytes = 0usize;

    while let Some(part) = parts.next().await {
        let body = part?;
        let part_number = completed.len() as i32 + 1;
        let size = body.len();

        completed.push(sink.upload_part(key, upload_id, part_number, body).await?);
        bytes += size;
        debug!("Uploaded part {} ({} bytes, {} total) of {}", part_number, size, bytes, key);
    }

    Ok((completed, bytes))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct MemorySink {
        parts: Mutex<Vec<(i32, Vec<u8>)>>,
        completed: Mutex<Option<Vec<i32>>>,
        aborted: Mutex<bool>,
        fail_on_part: Option<i32>,
    }

    #[async_trait]
    impl MultipartSink for MemorySink {
        async fn create(&self, _: &str, content_type: &str) -> TimelapseResult<String> {
            assert_eq!(content_type, CONTENT_TYPE);
            Ok("upload-1".into())
        }

        async fn upload_part(
            &self,
            _: &str,
            _: &str,
            part_number: i32,
            body: Bytes,
        ) -> TimelapseResult<UploadedPart> {
            if self.fail_on_part == Some(part_number) {
                return Err(TimelapseError::upload_failed("503 slow down"));
            }
            self.parts.lock().unwrap().push((part_number, body.to_vec()));
            Ok(UploadedPart {
                part_number,
                e_tag: Some(format!("etag-{part_number}")),
            })
        }

        async fn complete(
            &self,
            _: &str,
            _: &str,
            parts: Vec<UploadedPart>,
        ) -> TimelapseResult<()> {
            *self.completed.lock().unwrap() = Some(parts.iter().map(|p| p.part_number).collect());
            Ok(())
        }

        async fn abort(&self, _: &str, _: &str) -> TimelapseResult<()> {
            *self.aborted.lock().unwrap() = true;
            Ok(())
        }
    }

    fn chunks(
        items: Vec<TimelapseResult<&'static str>>,
    ) -> impl Stream<Item = TimelapseResult<Bytes>> + Send {
        tokio_stream::iter(items.into_iter().map(|r| r.map(|s| Bytes::from_static(s.as_bytes()))))
    }

    #[tokio::test]
    async fn completes_with_parts_in_order() {
        let sink = MemorySink::default();
        let parts = chunks(vec![Ok("aa"), Ok("bb"), Ok("c")]);
        let summary = upload_stream(&sink, "2024/June/a.mp4", parts).await.unwrap();

        assert_eq!(summary.parts, 3);
        assert_eq!(summary.bytes, 5);
        assert_eq!(*sink.completed.lock().unwrap(), Some(vec![1, 2, 3]));
        let bodies: Vec<Vec<u8>> = sink
            .parts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, b)| b.clone())
            .collect();
        assert_eq!(bodies.concat(), b"aabbc");
        assert!(!*sink.aborted.lock().unwrap());
    }

    #[tokio::test]
    async fn encoder_failure_aborts_instead_of_completing() {
        let sink = MemorySink::default();
        let err = upload_stream(
            &sink,
            "k.mp4",
            chunks(vec![Ok("aa"), Err(TimelapseError::transcode_failed(Some(1), "boom"))]),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TimelapseError::TranscodeFailed { exit_code: Some(1), .. }));
        assert!(sink.completed.lock().unwrap().is_none());
        assert!(*sink.aborted.lock().unwrap());
    }

    #[tokio::test]
    async fn storage_rejection_is_upload_failed_and_aborts() {
        let sink = MemorySink {
            fail_on_part: Some(2),
            ..MemorySink::default()
        };
        let err = upload_stream(&sink, "k.mp4", chunks(vec![Ok("aa"), Ok("bb"), Ok("cc")]))
            .await
            .unwrap_err();

        assert!(matches!(err, TimelapseError::UploadFailed(_)));
        assert!(*sink.aborted.lock().unwrap());
        assert_eq!(sink.parts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_stream_is_not_archived() {
        let sink = MemorySink::default();
        let err = upload_stream(&sink, "k.mp4", chunks(Vec::new())).await.unwrap_err();

        assert!(matches!(err, TimelapseError::UploadFailed(_)));
        assert!(sink.completed.lock().unwrap().is_none());
        assert!(*sink.aborted.lock().unwrap());
    }
}
