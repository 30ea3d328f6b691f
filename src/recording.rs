use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Camera;
use crate::errors::{Result, StreamError};
use crate::registry::{ActiveSession, ProcessHandle, ProcessRegistry};
use crate::stream_address;

/// strftime pattern for segment file names; sorts in creation order.
pub const SEGMENT_PATTERN: &str = "%Y-%m-%d_%H-%M-%S";
pub const SEGMENT_EXTENSION: &str = "mp4";

pub fn segment_file_name(created: DateTime<Local>) -> String {
    format!("{}.{}", created.format(SEGMENT_PATTERN), SEGMENT_EXTENSION)
}

/// Read access to the current camera records.
#[async_trait]
pub trait CameraSource: Send + Sync {
    async fn get(&self, camera_id: &str) -> Option<Camera>;
    async fn list(&self) -> Vec<Camera>;
}

/// Everything the launcher needs to start one recording process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSpec {
    pub camera_id: String,
    pub source: String,
    pub output_dir: PathBuf,
    pub segment_seconds: u64,
    pub transport: String,
}

impl CaptureSpec {
    pub fn output_pattern(&self) -> PathBuf {
        self.output_dir.join(format!("{}.{}", SEGMENT_PATTERN, SEGMENT_EXTENSION))
    }
}

pub struct LaunchedCapture {
    pub handle: Box<dyn ProcessHandle>,
    /// Resolves with the exit code once the process is gone (`None` when it
    /// was killed by a signal).
    pub exit: oneshot::Receiver<Option<i32>>,
}

pub trait CaptureLauncher: Send + Sync {
    fn launch(&self, spec: &CaptureSpec) -> Result<LaunchedCapture>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitEffect {
    ScheduleRestart(Duration),
    Nothing,
}

#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub min_uptime: Duration,
    pub restart_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            min_uptime: Duration::from_millis(10_000),
            restart_delay: Duration::from_millis(15_000),
        }
    }
}

impl RestartPolicy {
    /// Restart after a failure or after meaningful uptime; a clean exit inside
    /// the uptime floor is left alone so broken inputs don't loop.
    pub fn on_exit(&self, code: Option<i32>, uptime: Duration) -> ExitEffect {
        let ran_long = uptime > self.min_uptime;
        if code != Some(0) || ran_long {
            ExitEffect::ScheduleRestart(self.restart_delay)
        } else {
            ExitEffect::Nothing
        }
    }

    pub fn classify_exit(&self, camera_id: &str, code: Option<i32>, uptime: Duration) -> StreamError {
        let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
        let message = format!("camera '{}' capture exited ({}) after {:?}", camera_id, code, uptime);
        if uptime > self.min_uptime {
            StreamError::process_crashed(message)
        } else {
            StreamError::process_exited_immediately(message)
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub segment_seconds: u64,
    pub transport: String,
    pub startup_delay: Duration,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            segment_seconds: 600,
            transport: "tcp".to_string(),
            startup_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RecorderState {
    Stopped,
    Running { session_id: Uuid, since: DateTime<Utc> },
    RestartPending,
}

struct PendingRestart {
    restart_id: Uuid,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct SupervisorState {
    registry: ProcessRegistry,
    restarts: HashMap<String, PendingRestart>,
}

struct SupervisorInner {
    policy: RestartPolicy,
    settings: RecorderSettings,
    destination_root: RwLock<Option<PathBuf>>,
    cameras: Arc<dyn CameraSource>,
    launcher: Arc<dyn CaptureLauncher>,
    // One exit watcher per launched session, awaited on shutdown
    exits: TaskTracker,
    // Registry and restart timers share one lock so start, stop and exit
    // handling for a camera never interleave.
    state: Mutex<SupervisorState>,
}

#[derive(Clone)]
pub struct RecordingSupervisor {
    inner: Arc<SupervisorInner>,
}

impl RecordingSupervisor {
    pub fn new(
        policy: RestartPolicy,
        settings: RecorderSettings,
        destination_root: Option<PathBuf>,
        cameras: Arc<dyn CameraSource>,
        launcher: Arc<dyn CaptureLauncher>,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                policy,
                settings,
                destination_root: RwLock::new(destination_root),
                cameras,
                launcher,
                exits: TaskTracker::new(),
                state: Mutex::new(SupervisorState::default()),
            }),
        }
    }

    pub async fn destination_root(&self) -> Option<PathBuf> {
        self.inner.destination_root.read().await.clone()
    }

    /// Starts recording every known camera once the settle delay has passed.
    pub fn initialize(&self) -> JoinHandle<()> {
        let supervisor = self.clone();
        let delay = self.inner.settings.startup_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!("Starting recordings for all cameras");
            supervisor.start_all().await;
        })
    }

    pub async fn start_all(&self) {
        for camera in self.inner.cameras.list().await {
            if let Err(e) = self.start(&camera).await {
                error!("Failed to start recording for camera '{}': {}", camera.id, e);
            }
        }
    }

    /// Starts (or restarts) the recording for `camera`. Returns the new
    /// session id, or `None` when the camera is not recordable right now.
    pub async fn start(&self, camera: &Camera) -> Result<Option<Uuid>> {
        let mut state = self.inner.state.lock().await;
        self.start_locked(&mut state, camera).await
    }

    async fn start_locked(&self, state: &mut SupervisorState, camera: &Camera) -> Result<Option<Uuid>> {
        cancel_restart(state, &camera.id);
        if let Some(session) = state.registry.remove(&camera.id) {
            info!("Replacing recording session {} for camera '{}'", session.session_id, camera.id);
            terminate_session(&camera.id, session);
        }

        let (output_dir, source) = match self.recording_target(camera).await {
            Ok(target) => target,
            Err(StreamError::ConfigurationMissing { message }) => {
                debug!("Not recording camera '{}': {}", camera.id, message);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = tokio::fs::create_dir_all(&output_dir).await {
            let err = StreamError::folder_create_failed(output_dir.display().to_string(), e);
            error!("Recording for camera '{}' aborted: {}", camera.id, err);
            return Err(err);
        }

        let spec = CaptureSpec {
            camera_id: camera.id.clone(),
            source,
            output_dir,
            segment_seconds: self.inner.settings.segment_seconds,
            transport: self.inner.settings.transport.clone(),
        };

        let launched = match self.inner.launcher.launch(&spec) {
            Ok(launched) => launched,
            Err(e) => {
                error!("Recording for camera '{}' not started: {}", camera.id, e);
                return Err(e);
            }
        };

        let session = ActiveSession::new(launched.handle);
        let session_id = session.session_id;
        if let Some(displaced) = state.registry.insert(&camera.id, session) {
            terminate_session(&camera.id, displaced);
        }
        self.watch_exit(camera.id.clone(), session_id, launched.exit);

        info!(
            "Recording camera '{}' into {} (session {})",
            camera.id,
            spec.output_dir.display(),
            session_id
        );
        Ok(Some(session_id))
    }

    async fn recording_target(&self, camera: &Camera) -> Result<(PathBuf, String)> {
        let root = self
            .inner
            .destination_root
            .read()
            .await
            .clone()
            .ok_or_else(|| StreamError::configuration_missing("no recording destination configured"))?;
        if !camera.status.is_recordable() {
            return Err(StreamError::configuration_missing(format!("status is {}", camera.status)));
        }
        let source = stream_address::resolve(camera)
            .ok_or_else(|| StreamError::configuration_missing("no source address"))?;
        Ok((root.join(stream_address::folder_token(&camera.name)), source))
    }

    fn watch_exit(&self, camera_id: String, session_id: Uuid, exit: oneshot::Receiver<Option<i32>>) {
        let supervisor = self.clone();
        self.inner.exits.spawn(async move {
            // A dropped sender means the watcher lost the process; treat it
            // as a signal death.
            let code = exit.await.unwrap_or(None);
            supervisor.handle_exit(&camera_id, session_id, code).await;
        });
    }

    /// Applies the restart policy to a finished session. Exits of sessions
    /// that were already stopped or replaced are ignored.
    pub async fn handle_exit(&self, camera_id: &str, session_id: Uuid, code: Option<i32>) -> ExitEffect {
        let mut state = self.inner.state.lock().await;
        let Some(session) = state.registry.remove_if_session(camera_id, session_id) else {
            debug!("Ignoring exit of released session {} for camera '{}'", session_id, camera_id);
            return ExitEffect::Nothing;
        };

        let uptime = session.started_at.elapsed();
        warn!("{}", self.inner.policy.classify_exit(camera_id, code, uptime));

        let effect = self.inner.policy.on_exit(code, uptime);
        match effect {
            ExitEffect::ScheduleRestart(delay) => {
                info!("Restarting recording for camera '{}' in {:?}", camera_id, delay);
                self.schedule_restart(&mut state, camera_id, delay);
            }
            ExitEffect::Nothing => {
                warn!("Camera '{}' exited cleanly right after start, not restarting", camera_id);
            }
        }
        effect
    }

    fn schedule_restart(&self, state: &mut SupervisorState, camera_id: &str, delay: Duration) {
        cancel_restart(state, camera_id);
        let restart_id = Uuid::new_v4();
        let supervisor = self.clone();
        let id = camera_id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            supervisor.fire_restart(&id, restart_id).await;
        });
        state.restarts.insert(camera_id.to_string(), PendingRestart { restart_id, task });
    }

    async fn fire_restart(&self, camera_id: &str, restart_id: Uuid) {
        let mut state = self.inner.state.lock().await;
        match state.restarts.get(camera_id) {
            Some(pending) if pending.restart_id == restart_id => {
                // Our own slot; dropping the JoinHandle detaches instead of aborting.
                state.restarts.remove(camera_id);
            }
            _ => return,
        }

        let Some(camera) = self.inner.cameras.get(camera_id).await else {
            info!("Camera '{}' was removed before its restart, skipping", camera_id);
            return;
        };
        if let Err(e) = self.start_locked(&mut state, &camera).await {
            error!("Restart of camera '{}' failed: {}", camera_id, e);
        }
    }

    /// Stops the recording for `camera_id`. The registry entry is removed
    /// right away, before the process has actually exited.
    pub async fn stop(&self, camera_id: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        let had_restart = cancel_restart(&mut state, camera_id);
        match state.registry.remove(camera_id) {
            Some(session) => {
                info!("Stopping recording session {} for camera '{}'", session.session_id, camera_id);
                terminate_session(camera_id, session);
                true
            }
            None => had_restart,
        }
    }

    pub async fn stop_all(&self) {
        let mut state = self.inner.state.lock().await;
        let pending: Vec<String> = state.restarts.keys().cloned().collect();
        for camera_id in pending {
            cancel_restart(&mut state, &camera_id);
        }
        for camera_id in state.registry.ids() {
            if let Some(session) = state.registry.remove(&camera_id) {
                terminate_session(&camera_id, session);
            }
        }
    }

    /// Stops every session and waits up to `timeout` for the processes to
    /// exit. Returns false if some were still running when time ran out.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.stop_all().await;
        self.inner.exits.close();
        match tokio::time::timeout(timeout, self.inner.exits.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!("Recorders still running after {:?}", timeout);
                false
            }
        }
    }

    /// Reacts to a camera record being created or edited.
    pub async fn on_camera_upserted(&self, previous: Option<&Camera>, camera: &Camera) -> Result<Option<Uuid>> {
        match previous {
            Some(prev) if !camera.recording_changed(prev) => {
                debug!("Camera '{}' updated without recording-relevant changes", camera.id);
                Ok(None)
            }
            _ => self.start(camera).await,
        }
    }

    pub async fn on_camera_removed(&self, camera_id: &str) {
        if self.stop(camera_id).await {
            info!("Recording for removed camera '{}' stopped", camera_id);
        }
    }

    /// Switches the recording root. Every session is restarted so new
    /// segments land under the new root. Returns false if nothing changed.
    pub async fn set_destination_root(&self, root: Option<PathBuf>) -> bool {
        {
            let mut current = self.inner.destination_root.write().await;
            if *current == root {
                return false;
            }
            info!("Recording destination changed to {:?}", root);
            *current = root;
        }
        self.stop_all().await;
        self.start_all().await;
        true
    }

    pub async fn state(&self, camera_id: &str) -> RecorderState {
        let state = self.inner.state.lock().await;
        state_of(&state, camera_id)
    }

    pub async fn states(&self) -> HashMap<String, RecorderState> {
        let cameras = self.inner.cameras.list().await;
        let state = self.inner.state.lock().await;
        cameras
            .into_iter()
            .map(|camera| {
                let current = state_of(&state, &camera.id);
                (camera.id, current)
            })
            .collect()
    }

    pub async fn active_count(&self) -> usize {
        self.inner.state.lock().await.registry.len()
    }

    /// Folder a camera's segments are written to under the current root.
    pub async fn camera_folder(&self, camera: &Camera) -> Option<PathBuf> {
        let root = self.destination_root().await?;
        Some(camera_folder(&root, camera))
    }
}

pub fn camera_folder(root: &Path, camera: &Camera) -> PathBuf {
    root.join(stream_address::folder_token(&camera.name))
}

fn state_of(state: &SupervisorState, camera_id: &str) -> RecorderState {
    if let Some(session) = state.registry.get(camera_id) {
        RecorderState::Running { session_id: session.session_id, since: session.started_wall }
    } else if state.restarts.contains_key(camera_id) {
        RecorderState::RestartPending
    } else {
        RecorderState::Stopped
    }
}

fn cancel_restart(state: &mut SupervisorState, camera_id: &str) -> bool {
    match state.restarts.remove(camera_id) {
        Some(pending) => {
            pending.task.abort();
            debug!("Cancelled pending restart for camera '{}'", camera_id);
            true
        }
        None => false,
    }
}

fn terminate_session(camera_id: &str, mut session: ActiveSession) {
    if let Err(e) = session.handle.terminate() {
        debug!("Terminate for camera '{}' session {} not delivered: {}", camera_id, session.session_id, e);
    }
}
