//! Submit → poll → terminal state machine for Ring download jobs.

use log::{debug, info, warn};
use tokio::time::{sleep, timeout, Instant};

use crate::config::PollSettings;
use crate::error::{TimelapseError, TimelapseResult};
use crate::ring_client::{CameraApi, DownloadJob, DownloadPayload, JobStatus};

/// A job that finished with a fetchable clip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyJob {
    pub job_id: String,
    pub result_url: String,
    pub polls: u32,
}

/// Submits `payload` and polls until the job is ready, fails, or the overall
/// deadline passes. The deadline is measured from submission and bounds the
/// whole loop, including in-flight status requests.
pub async fn submit_and_poll(
    api: &dyn CameraApi,
    payload: &DownloadPayload,
    settings: PollSettings,
) -> TimelapseResult<ReadyJob> {
    let started = Instant::now();
    let mut job = api.submit_download_job(payload).await?;
    let job_id = job.id.clone();
    let mut polls = 0u32;
    let mut transient_failures = 0u32;

    loop {
        match job.status()? {
            JobStatus::Ready { result_url } => {
                info!(
                    "Download job {} ready after {} polls ({:?})",
                    job_id,
                    polls,
                    started.elapsed()
                );
                return Ok(ReadyJob {
                    job_id,
                    result_url,
                    polls,
                });
            }
            JobStatus::Failed { reason } => {
                return Err(TimelapseError::JobFailed { job_id, reason });
            }
            JobStatus::InProgress => {}
        }

        let timed_out = || TimelapseError::PollTimeout {
            job_id: job_id.clone(),
            elapsed: started.elapsed(),
        };

        let remaining = settings
            .timeout
            .checked_sub(started.elapsed())
            .filter(|r| !r.is_zero())
            .ok_or_else(timed_out)?;
        sleep(settings.interval.min(remaining)).await;

        let remaining = settings
            .timeout
            .checked_sub(started.elapsed())
            .filter(|r| !r.is_zero())
            .ok_or_else(timed_out)?;

        polls += 1;
        match timeout(remaining, api.get_download_job(&job_id)).await {
            Err(_) => return Err(timed_out()),
            Ok(Ok(next)) => {
                debug!("Download job {} poll {}: {}", job_id, polls, next.state);
                transient_failures = 0;
                job = next;
            }
            Ok(Err(e)) if e.is_transient() => {
                transient_failures += 1;
                warn!(
                    "Poll {} for job {} failed transiently ({}/{}): {}",
                    polls, job_id, transient_failures, settings.max_transient_failures, e
                );
                if transient_failures >= settings.max_transient_failures {
                    return Err(TimelapseError::JobFailed {
                        job_id,
                        reason: format!(
                            "{transient_failures} consecutive poll failures, last: {e}"
                        ),
                    });
                }
                job = still_pending(&job);
            }
            Ok(Err(e)) => return Err(e),
        }
    }
}

/// A failed tick counts as a non-terminal response.
fn still_pending(job: &DownloadJob) -> DownloadJob {
    DownloadJob {
        state: "pending".into(),
        result_url: None,
        ..job.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::ring_client::CameraRef;

    fn job(state: &str, url: Option<&str>) -> DownloadJob {
        DownloadJob {
            id: "job-1".into(),
            state: state.into(),
            result_url: url.map(str::to_string),
            failure_reason: None,
        }
    }

    fn transient() -> TimelapseError {
        TimelapseError::Api {
            status: Some(502),
            message: "bad gateway".into(),
        }
    }

    /// Replays scripted poll responses; once exhausted, reports pending forever.
    struct ScriptedApi {
        submitted: DownloadJob,
        polls: Mutex<VecDeque<TimelapseResult<DownloadJob>>>,
        poll_delay: Duration,
    }

    impl ScriptedApi {
        fn new(polls: Vec<TimelapseResult<DownloadJob>>) -> Self {
            Self {
                submitted: job("pending", None),
                polls: Mutex::new(polls.into()),
                poll_delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl CameraApi for ScriptedApi {
        async fn list_cameras(&self) -> TimelapseResult<Vec<CameraRef>> {
            Ok(Vec::new())
        }

        async fn submit_download_job(&self, _: &DownloadPayload) -> TimelapseResult<DownloadJob> {
            Ok(self.submitted.clone())
        }

        async fn get_download_job(&self, _: &str) -> TimelapseResult<DownloadJob> {
            sleep(self.poll_delay).await;
            let next = self.polls.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(job("pending", None)))
        }
    }

    fn payload() -> DownloadPayload {
        DownloadPayload {
            device_id: "1".into(),
            start_timestamp: 0,
            end_timestamp: 1_000,
            notification: false,
            custom_file_name: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn returns_ready_job_after_pending_ticks() {
        let api = ScriptedApi::new(vec![
            Ok(job("pending", None)),
            Ok(job("processing", None)),
            Ok(job("ready", Some("https://clips.example/1.mp4"))),
        ]);
        let started = Instant::now();

        let ready = submit_and_poll(&api, &payload(), PollSettings::default())
            .await
            .unwrap();

        assert_eq!(ready.result_url, "https://clips.example/1.mp4");
        assert_eq!(ready.polls, 3);
        assert!(started.elapsed() >= Duration::from_millis(2_000));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_at_the_deadline() {
        let api = ScriptedApi::new(Vec::new());
        let settings = PollSettings::default();
        let started = Instant::now();

        let err = submit_and_poll(&api, &payload(), settings).await.unwrap_err();

        let elapsed = started.elapsed();
        assert!(matches!(err, TimelapseError::PollTimeout { .. }));
        assert!(elapsed >= settings.timeout);
        assert!(elapsed < settings.timeout + settings.interval);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_status_call_cannot_overrun_the_deadline() {
        let mut api = ScriptedApi::new(Vec::new());
        api.poll_delay = Duration::from_secs(25);
        let settings = PollSettings {
            timeout: Duration::from_secs(30),
            ..PollSettings::default()
        };
        let started = Instant::now();

        let err = submit_and_poll(&api, &payload(), settings).await.unwrap_err();

        let elapsed = started.elapsed();
        assert!(matches!(err, TimelapseError::PollTimeout { .. }));
        assert!(elapsed >= settings.timeout);
        assert!(elapsed < settings.timeout + Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn ready_without_url_is_not_success() {
        let api = ScriptedApi::new(vec![Ok(job("ready", None))]);
        let err = submit_and_poll(&api, &payload(), PollSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TimelapseError::MissingResultUrl { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_failure_is_job_failed() {
        let api = ScriptedApi::new(vec![Ok(job("pending", None)), Ok(job("failed", None))]);
        let err = submit_and_poll(&api, &payload(), PollSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TimelapseError::JobFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_absorbed() {
        let api = ScriptedApi::new(vec![
            Err(transient()),
            Err(TimelapseError::Api {
                status: None,
                message: "timed out".into(),
            }),
            Ok(job("ready", Some("https://clips.example/2.mp4"))),
        ]);

        let ready = submit_and_poll(&api, &payload(), PollSettings::default())
            .await
            .unwrap();
        assert_eq!(ready.polls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_transient_failures_escalate() {
        let settings = PollSettings::default();
        let failures = (0..settings.max_transient_failures)
            .map(|_| Err(transient()))
            .collect();
        let api = ScriptedApi::new(failures);
        let started = Instant::now();

        let err = submit_and_poll(&api, &payload(), settings).await.unwrap_err();

        assert!(matches!(err, TimelapseError::JobFailed { .. }));
        assert!(started.elapsed() < settings.timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_abort_immediately() {
        let api = ScriptedApi::new(vec![Err(TimelapseError::Api {
            status: Some(404),
            message: "no such job".into(),
        })]);
        let err = submit_and_poll(&api, &payload(), PollSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TimelapseError::Api { status: Some(404), .. }));
    }
}
