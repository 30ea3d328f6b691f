use std::path::Path;
use std::fs;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Duration;
use notify::{Config as NotifyConfig, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{info, error, debug};

use crate::config::Config;
use crate::errors::{Result, StreamError};
use crate::AppState;

const DEBOUNCE: Duration = Duration::from_millis(500);

/// Feeds hand-edited camera files into the same upsert/remove path as the API.
pub async fn start_camera_watcher(app_state: AppState) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(100);

    let mut watcher = RecommendedWatcher::new(
        move |res| {
            match res {
                Ok(event) => {
                    if let Err(e) = tx.blocking_send(event) {
                        error!("Failed to send file watcher event: {}", e);
                    }
                }
                Err(e) => error!("File watcher error: {}", e),
            }
        },
        NotifyConfig::default(),
    ).map_err(|e| StreamError::config(format!("File watcher error: {}", e)))?;

    let cameras_dir = app_state.cameras.directory().to_string();
    let cameras_dir_path = Path::new(&cameras_dir);
    if !cameras_dir_path.exists() {
        info!("Creating cameras directory '{}' for watching...", cameras_dir);
        fs::create_dir_all(cameras_dir_path)?;
    }

    watcher.watch(cameras_dir_path, RecursiveMode::NonRecursive)
        .map_err(|e| StreamError::config(format!("Failed to watch cameras directory: {}", e)))?;
    info!("Watching cameras directory '{}' for record changes", cameras_dir);

    tokio::spawn(async move {
        let _watcher = watcher; // Keep watcher alive
        let debouncer = Debouncer::default();

        while let Some(event) = rx.recv().await {
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)) {
                continue;
            }
            for path in event.paths {
                let Some(camera_id) = camera_id_from_path(&path) else { continue };
                let app_state = app_state.clone();
                let id = camera_id.clone();
                debouncer
                    .schedule(camera_id, DEBOUNCE, async move {
                        apply_camera_file(&app_state, &path, &id).await;
                    })
                    .await;
            }
        }
    });

    Ok(())
}

/// Runs only the last action scheduled for a key once it has been quiet
/// for the debounce period.
#[derive(Clone, Default)]
struct Debouncer {
    generations: Arc<Mutex<HashMap<String, u64>>>,
}

impl Debouncer {
    async fn schedule<F>(&self, key: String, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = {
            let mut generations = self.generations.lock().await;
            let counter = generations.entry(key.clone()).or_insert(0);
            *counter += 1;
            *counter
        };

        let generations = self.generations.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut generations = generations.lock().await;
                if generations.get(&key) != Some(&generation) {
                    return;
                }
                generations.remove(&key);
            }
            action.await;
        });
    }
}

/// Applies whatever the file holds once it has settled; a missing file
/// removes the camera.
async fn apply_camera_file(app_state: &AppState, path: &Path, camera_id: &str) {
    if !path.exists() {
        info!("Camera record file removed: {}", camera_id);
        if let Err(e) = app_state.remove_camera(camera_id, false).await {
            debug!("Removal of camera '{}' ignored: {}", camera_id, e);
        }
        return;
    }

    match Config::read_camera_file(path) {
        Ok(Some(mut camera)) => {
            camera.id = camera_id.to_string();
            debug!("Camera record file changed: {}", camera_id);
            if let Err(e) = app_state.upsert_camera(camera, false).await {
                error!("Failed to apply camera record '{}': {}", camera_id, e);
            }
        }
        Ok(None) => {}
        Err(e) => error!("Failed to read camera record {}: {}", path.display(), e),
    }
}

fn camera_id_from_path(path: &Path) -> Option<String> {
    match path.extension().and_then(|s| s.to_str()) {
        Some("json") | Some("toml") => path.file_stem().and_then(|s| s.to_str()).map(str::to_string),
        _ => None,
    }
}
