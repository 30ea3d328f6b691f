//! ffmpeg process boundary: recording sessions, single-frame extraction and
//! segment thumbnails.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

use crate::config::FfmpegLog;
use crate::errors::{Result, StreamError};
use crate::gateway::{ExtractMode, ExtractRequest, Frame, FrameBody, FrameExtractor};
use crate::recording::{CaptureLauncher, CaptureSpec, LaunchedCapture};
use crate::registry::ProcessHandle;

/// How long a terminated recorder gets to finalize its segment before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

fn is_rtsp(source: &str) -> bool {
    let lower = source.to_ascii_lowercase();
    lower.starts_with("rtsp://") || lower.starts_with("rtsps://")
}

pub fn recording_args(spec: &CaptureSpec) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
    if is_rtsp(&spec.source) {
        args.extend(["-rtsp_transport".into(), spec.transport.clone()]);
    }
    args.extend([
        "-i".into(), spec.source.clone(),
        "-c".into(), "copy".into(),                 // No re-encoding
        "-f".into(), "segment".into(),
        "-segment_time".into(), spec.segment_seconds.to_string(),
        "-reset_timestamps".into(), "1".into(),
        "-strftime".into(), "1".into(),
        spec.output_pattern().to_string_lossy().into_owned(),
    ]);
    args
}

pub fn snapshot_args(request: &ExtractRequest, timeout: Duration) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
    if is_rtsp(&request.url) {
        let transport = request.transport.clone().unwrap_or_else(|| "tcp".to_string());
        args.extend(["-rtsp_transport".into(), transport]);
    }
    // Socket timeout in µs since ffmpeg 5; 4.x reads it as an RTSP listen timeout
    args.extend([
        "-timeout".into(), timeout.as_micros().to_string(),
        "-i".into(), request.url.clone(),
        "-frames:v".into(), "1".into(),
    ]);
    if let Some(width) = request.width {
        args.extend(["-vf".into(), format!("scale={}:-1", width)]);
    }
    match request.mode {
        ExtractMode::Pipe => {
            args.extend(["-f".into(), "image2pipe".into(), "-vcodec".into(), "mjpeg".into()]);
        }
        ExtractMode::UpdateInPlace => {
            // `-update` belongs to the image2 muxer; image2pipe rejects it
            args.extend([
                "-c:v".into(), "mjpeg".into(),
                "-f".into(), "image2".into(),
                "-update".into(), "1".into(),
            ]);
        }
    }
    args.push("pipe:1".into());
    args
}

pub fn thumbnail_args(segment: &Path, output: &Path, offset: Duration) -> Vec<String> {
    vec![
        "-hide_banner".into(), "-loglevel".into(), "error".into(),
        "-y".into(),
        "-ss".into(), format!("{:.3}", offset.as_secs_f64()),
        "-i".into(), segment.to_string_lossy().into_owned(),
        "-frames:v".into(), "1".into(),
        "-q:v".into(), "4".into(),
        "-f".into(), "image2".into(),
        output.to_string_lossy().into_owned(),
    ]
}

fn unavailable_if_missing(program: &str, e: std::io::Error) -> StreamError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StreamError::service_unavailable(format!("{} is not installed", program))
    } else {
        StreamError::process_spawn_failed(program, e)
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) -> std::io::Result<()> {
    let Some(pid) = child.id() else {
        return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "process already exited"));
    };
    // SAFETY: plain syscall, no memory is shared. `pid` is a child we own and
    // only `child.wait()` in this task reaps it, so it cannot have been reused.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

pub struct FfmpegHandle {
    pid: Option<u32>,
    stop: Option<oneshot::Sender<()>>,
}

impl ProcessHandle for FfmpegHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn terminate(&mut self) -> std::io::Result<()> {
        let stop = self.stop.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "terminate already requested")
        })?;
        stop.send(())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::NotFound, "process already exited"))
    }
}

/// Spawns one segmenting ffmpeg recorder per camera.
pub struct FfmpegLauncher {
    ffmpeg_path: String,
    log: FfmpegLog,
}

impl FfmpegLauncher {
    pub fn new(ffmpeg_path: impl Into<String>, log: FfmpegLog) -> Self {
        Self { ffmpeg_path: ffmpeg_path.into(), log }
    }
}

impl CaptureLauncher for FfmpegLauncher {
    fn launch(&self, spec: &CaptureSpec) -> Result<LaunchedCapture> {
        let stderr = match self.log {
            FfmpegLog::Console => Stdio::piped(),
            FfmpegLog::None => Stdio::null(),
        };

        let mut child = Command::new(&self.ffmpeg_path)
            .args(recording_args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StreamError::process_spawn_failed(&self.ffmpeg_path, e))?;

        let pid = child.id();
        info!("Spawned ffmpeg recorder for camera '{}' (pid {:?})", spec.camera_id, pid);

        if let Some(stderr) = child.stderr.take() {
            let camera_id = spec.camera_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{}] ffmpeg: {}", camera_id, line);
                }
            });
        }

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel();
        let camera_id = spec.camera_id.clone();

        tokio::spawn(async move {
            // A dropped stop sender also counts as a stop request.
            let finished = tokio::select! {
                status = child.wait() => Some(status),
                _ = stop_rx => None,
            };

            let status = match finished {
                Some(status) => status,
                None => {
                    if let Err(e) = send_terminate(&mut child) {
                        debug!("SIGTERM to ffmpeg for camera '{}' failed: {}", camera_id, e);
                    }
                    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
                        Ok(status) => status,
                        Err(_) => {
                            warn!("ffmpeg for camera '{}' ignored SIGTERM, killing", camera_id);
                            let _ = child.start_kill();
                            child.wait().await
                        }
                    }
                }
            };

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    error!("Failed to wait for ffmpeg of camera '{}': {}", camera_id, e);
                    None
                }
            };
            debug!("ffmpeg for camera '{}' exited with {:?}", camera_id, code);
            let _ = exit_tx.send(code);
        });

        Ok(LaunchedCapture {
            handle: Box::new(FfmpegHandle { pid, stop: Some(stop_tx) }),
            exit: exit_rx,
        })
    }
}

/// Pulls single frames through ffmpeg and streams them to the caller.
pub struct FfmpegExtractor {
    ffmpeg_path: String,
    timeout: Duration,
}

impl FfmpegExtractor {
    pub fn new(ffmpeg_path: impl Into<String>, timeout: Duration) -> Self {
        Self { ffmpeg_path: ffmpeg_path.into(), timeout }
    }
}

#[async_trait]
impl FrameExtractor for FfmpegExtractor {
    async fn extract(&self, request: &ExtractRequest) -> Result<Frame> {
        let mut child = Command::new(&self.ffmpeg_path)
            .args(snapshot_args(request, self.timeout))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| unavailable_if_missing(&self.ffmpeg_path, e))?;

        let mut stdout = child.stdout.take()
            .ok_or_else(|| StreamError::fetch_failed("Failed to get ffmpeg stdout"))?;

        // ffmpeg enforces the connect timeout itself; the margin covers decode time.
        let mut first = vec![0u8; 64 * 1024];
        let read = tokio::time::timeout(self.timeout + Duration::from_secs(2), stdout.read(&mut first))
            .await
            .map_err(|_| StreamError::FetchTimeout { millis: self.timeout.as_millis() as u64 })??;

        if read == 0 {
            let status = child.wait().await?;
            return Err(StreamError::fetch_failed(format!(
                "ffmpeg produced no image (exit {:?})",
                status.code()
            )));
        }
        first.truncate(read);

        // Keeps the child alive (and reaped) until the body has been consumed;
        // dropping the stream early kills it.
        let reaper = futures_util::stream::once(async move {
            let _ = child.wait().await;
        })
        .filter_map(|_| futures_util::future::ready(None::<std::io::Result<Bytes>>));

        let body = futures_util::stream::once(futures_util::future::ready(Ok(Bytes::from(first))))
            .chain(ReaderStream::new(stdout))
            .chain(reaper);

        Ok(Frame {
            content_type: "image/jpeg".to_string(),
            body: FrameBody::Stream(Box::pin(body)),
        })
    }
}

/// Extracts one frame at `offset` from `segment` into `output`.
pub async fn generate_thumbnail(ffmpeg_path: &str, segment: &Path, output: &Path, offset: Duration) -> Result<()> {
    let partial = output.with_extension("part.jpg");
    let result = Command::new(ffmpeg_path)
        .args(thumbnail_args(segment, &partial, offset))
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| unavailable_if_missing(ffmpeg_path, e))?;

    if !result.status.success() {
        let _ = tokio::fs::remove_file(&partial).await;
        let stderr = String::from_utf8_lossy(&result.stderr);
        return Err(StreamError::fetch_failed(format!("ffmpeg thumbnail failed: {}", stderr.trim())));
    }

    tokio::fs::rename(&partial, output).await?;
    Ok(())
}
