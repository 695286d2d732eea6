//! Streams a remote clip through ffmpeg into timelapse MP4 parts.
//!
//! ffmpeg fetches the source URL itself; its stdout is cut into upload-sized
//! parts and forwarded over a bounded channel so a slow upload stalls the
//! encoder instead of growing memory.

use std::process::{ExitStatus, Stdio};

use async_stream::try_stream;
use bytes::{Bytes, BytesMut};
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};

use crate::error::{TimelapseError, TimelapseResult};

/// Parts buffered between encoder and uploader.
const CHANNEL_CAPACITY: usize = 2;

pub type PartResult = TimelapseResult<Bytes>;

/// The encoder invocation: program plus its full argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl EncoderCommand {
    /// Scale to 1080p keeping aspect ratio, divide presentation timestamps by
    /// `speed`, drop audio, and write fragmented MP4 to stdout so the
    /// container never needs a seek-back indexing pass.
    pub fn timelapse(ffmpeg_bin: &str, source_url: &str, speed: f64) -> Self {
        let args = [
            "-hide_banner",
            "-loglevel",
            "warning",
            "-i",
            source_url,
            "-vf",
            &format!("scale=-2:1080,setpts=PTS/{speed}"),
            "-c:v",
            "libx264",
            "-preset",
            "veryfast",
            "-crf",
            "23",
            "-an",
            "-movflags",
            "frag_keyframe+empty_moov+default_base_moof",
            "-f",
            "mp4",
            "pipe:1",
        ];

        Self {
            program: ffmpeg_bin.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Cuts `reader` into chunks of exactly `part_size` bytes (the last one may
/// be shorter), in the order they were read.
pub fn part_stream<R>(mut reader: R, part_size: usize) -> impl Stream<Item = std::io::Result<Bytes>>
where
    R: AsyncRead + Unpin,
{
    try_stream! {
        loop {
            let mut buf = BytesMut::with_capacity(part_size);
            while buf.len() < part_size {
                let remaining = (part_size - buf.len()) as u64;
                let n = (&mut reader).take(remaining).read_buf(&mut buf).await?;
                if n == 0 {
                    break;
                }
            }

            if buf.is_empty() {
                break;
            }
            let last = buf.len() < part_size;
            yield buf.freeze();
            if last {
                break;
            }
        }
    }
}

/// A running encoder. The producer task owns the child process; dropping or
/// terminating the handle kills it.
pub struct TranscodeHandle {
    task: JoinHandle<TimelapseResult<()>>,
}

impl TranscodeHandle {
    /// Waits for the encoder to exit and reports whether it exited cleanly.
    pub async fn wait(self) -> TimelapseResult<()> {
        self.task
            .await
            .map_err(|e| {
                TimelapseError::transcode_failed(None, format!("encoder task panicked: {e}"))
            })?
    }

    /// Kills the encoder, e.g. after the upload side failed.
    pub async fn terminate(self) {
        self.task.abort();
        match self.task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Encoder ended before termination: {}", e),
            Err(e) if e.is_cancelled() => info!("Encoder terminated"),
            Err(e) => warn!("Encoder task failed: {}", e),
        }
    }
}

/// Starts the encoder. Parts arrive on the returned receiver; a non-zero
/// exit is delivered as a final `TranscodeFailed` item after the last part,
/// so the consumer can refuse to finalize an incomplete stream.
pub fn spawn(
    command: &EncoderCommand,
    part_size: usize,
) -> TimelapseResult<(mpsc::Receiver<PartResult>, TranscodeHandle)> {
    debug!("Running encoder: {} {}", command.program, command.args.join(" "));

    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            TimelapseError::transcode_failed(None, format!("cannot start {}: {e}", command.program))
        })?;

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let task = tokio::spawn(produce(child_stdout(&mut child)?, child, tx, part_size));

    Ok((rx, TranscodeHandle { task }))
}

fn child_stdout(child: &mut Child) -> TimelapseResult<tokio::process::ChildStdout> {
    child
        .stdout
        .take()
        .ok_or_else(|| TimelapseError::transcode_failed(None, "encoder stdout not captured"))
}

async fn produce(
    stdout: tokio::process::ChildStdout,
    mut child: Child,
    tx: mpsc::Sender<PartResult>,
    part_size: usize,
) -> TimelapseResult<()> {
    let parts = part_stream(stdout, part_size);
    tokio::pin!(parts);

    let mut produced = 0usize;
    while let Some(part) = parts.next().await {
        match part {
            Ok(bytes) => {
                produced += bytes.len();
                if tx.send(Ok(bytes)).await.is_err() {
                    warn!("Upload stopped consuming, killing encoder");
                    kill(&mut child).await;
                    return Err(TimelapseError::transcode_failed(None, "consumer went away"));
                }
            }
            Err(e) => {
                error!("Reading encoder output failed: {}", e);
                kill(&mut child).await;
                return Err(fail(&tx, None, format!("reading encoder output: {e}")).await);
            }
        }
    }

    let exit = child.wait().await;
    if exit.is_err() {
        kill(&mut child).await;
    }
    report_exit(&tx, exit, produced).await
}

/// Turns the encoder's exit into the task result. Anything but a clean exit
/// is also sent down the channel.
async fn report_exit(
    tx: &mpsc::Sender<PartResult>,
    exit: std::io::Result<ExitStatus>,
    produced: usize,
) -> TimelapseResult<()> {
    let status = match exit {
        Ok(status) => status,
        Err(e) => {
            error!("Waiting for encoder failed: {}", e);
            return Err(fail(tx, None, format!("waiting for encoder: {e}")).await);
        }
    };

    if status.success() {
        info!("Encoder exited cleanly after {} bytes", produced);
        return Ok(());
    }

    error!("Encoder exited with {}", status);
    let detail = format!("encoder exited with {status} after {produced} bytes");
    Err(fail(tx, status.code(), detail).await)
}

/// Delivers the failure as the terminal stream item so the upload is aborted
/// rather than completed, and returns it for the task result.
async fn fail(
    tx: &mpsc::Sender<PartResult>,
    exit_code: Option<i32>,
    detail: String,
) -> TimelapseError {
    let _ = tx
        .send(Err(TimelapseError::transcode_failed(exit_code, detail.clone())))
        .await;
    TimelapseError::transcode_failed(exit_code, detail)
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!("Failed to kill encoder: {}", e);
    }
}
