use std::collections::HashMap;
use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{error, info, warn};

use crate::config::{Camera, Config};
use crate::errors::{Result, StreamError};
use crate::playback::validate_component;
use crate::recording::CameraSource;
use crate::AppState;

/// Camera records, one JSON file per camera in the cameras directory.
pub struct CameraStore {
    directory: String,
    cameras: RwLock<HashMap<String, Camera>>,
    // Held across store update and recorder reaction
    edits: Mutex<()>,
}

impl CameraStore {
    pub fn load(directory: impl Into<String>) -> Result<Self> {
        let directory = directory.into();
        let cameras = Config::load_cameras_from_directory(&directory)?;
        info!("Loaded {} camera records from '{}'", cameras.len(), directory);
        Ok(Self { directory, cameras: RwLock::new(cameras), edits: Mutex::new(()) })
    }

    pub fn directory(&self) -> &str {
        &self.directory
    }

    /// Serializes edits so the recorder sees them in store order.
    pub async fn begin_edit(&self) -> MutexGuard<'_, ()> {
        self.edits.lock().await
    }

    /// Stores `camera` and returns the record it replaced.
    pub async fn upsert(&self, camera: Camera, persist: bool) -> Result<Option<Camera>> {
        validate_component(&camera.id)?;
        if persist {
            Config::save_camera(&camera, &self.directory)?;
        }
        let mut cameras = self.cameras.write().await;
        Ok(cameras.insert(camera.id.clone(), camera))
    }

    pub async fn remove(&self, camera_id: &str, persist: bool) -> Result<Option<Camera>> {
        if persist {
            validate_component(camera_id)?;
            Config::delete_camera(camera_id, &self.directory)?;
        }
        let mut cameras = self.cameras.write().await;
        Ok(cameras.remove(camera_id))
    }
}

#[async_trait]
impl CameraSource for CameraStore {
    async fn get(&self, camera_id: &str) -> Option<Camera> {
        self.cameras.read().await.get(camera_id).cloned()
    }

    async fn list(&self) -> Vec<Camera> {
        let mut cameras: Vec<Camera> = self.cameras.read().await.values().cloned().collect();
        cameras.sort_by(|a, b| a.id.cmp(&b.id));
        cameras
    }
}

impl AppState {
    /// Saves a camera record and lets the recorder react to what changed.
    /// Recording failures are logged, the record is kept either way.
    pub async fn upsert_camera(&self, camera: Camera, persist: bool) -> Result<Option<Camera>> {
        let _edit = self.cameras.begin_edit().await;
        let previous = self.cameras.upsert(camera.clone(), persist).await?;
        match &previous {
            Some(_) => info!("Updated camera '{}'", camera.id),
            None => info!("Added camera '{}'", camera.id),
        }

        if let Err(e) = self.supervisor.on_camera_upserted(previous.as_ref(), &camera).await {
            error!("Recording for camera '{}' could not be started: {}", camera.id, e);
        }
        Ok(previous)
    }

    pub async fn remove_camera(&self, camera_id: &str, persist: bool) -> Result<Camera> {
        info!("Removing camera '{}'...", camera_id);
        let _edit = self.cameras.begin_edit().await;
        let removed = self.cameras.remove(camera_id, persist).await?;
        // Stop even if the record was already gone; a session may outlive it
        self.supervisor.on_camera_removed(camera_id).await;

        removed.ok_or_else(|| {
            warn!("Camera '{}' was not found", camera_id);
            StreamError::not_found(format!("camera '{}' not found", camera_id))
        })
    }
}
