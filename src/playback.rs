use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;

use crate::errors::{Result, StreamError};
use crate::ffmpeg;
use crate::recording::SEGMENT_EXTENSION;

const THUMBNAIL_SUFFIX: &str = ".jpg";

#[derive(Debug, Clone, Serialize)]
pub struct SegmentInfo {
    pub filename: String,
    pub size_bytes: u64,
    pub modified: Option<DateTime<Utc>>,
    pub has_thumbnail: bool,
}

/// Rejects anything that could escape the camera folder.
pub fn validate_component(value: &str) -> Result<()> {
    if value.is_empty()
        || value.starts_with('.')
        || value.contains('/')
        || value.contains('\\')
        || value.contains("..")
    {
        return Err(StreamError::invalid_input(format!("invalid path component '{}'", value)));
    }
    Ok(())
}

pub fn thumbnail_name(segment: &str) -> String {
    format!("{}{}", segment, THUMBNAIL_SUFFIX)
}

/// Read side of the recording folders.
pub struct Playback {
    ffmpeg_path: String,
    thumbnail_offset: Duration,
    // One lock per sidecar being generated
    thumbnail_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl Playback {
    pub fn new(ffmpeg_path: impl Into<String>, thumbnail_offset: Duration) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            thumbnail_offset,
            thumbnail_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Segments of one camera folder, newest first.
    pub async fn list_segments(&self, root: &Path, token: &str) -> Result<Vec<SegmentInfo>> {
        validate_component(token)?;
        let folder = root.join(token);
        let mut entries = match tokio::fs::read_dir(&folder).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StreamError::not_found(format!("no recordings for '{}'", token)));
            }
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        let mut metadata = HashMap::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else { continue };
            let meta = entry.metadata().await?;
            if meta.is_file() {
                metadata.insert(name.clone(), meta);
                names.push(name);
            }
        }

        let suffix = format!(".{}", SEGMENT_EXTENSION);
        let mut segments: Vec<SegmentInfo> = names
            .iter()
            .filter(|name| name.ends_with(&suffix))
            .map(|name| {
                let meta = &metadata[name];
                SegmentInfo {
                    filename: name.clone(),
                    size_bytes: meta.len(),
                    modified: meta.modified().ok().map(DateTime::<Utc>::from),
                    has_thumbnail: metadata.contains_key(&thumbnail_name(name)),
                }
            })
            .collect();

        // File names embed a sortable timestamp
        segments.sort_by(|a, b| b.filename.cmp(&a.filename));
        Ok(segments)
    }

    pub async fn segment_path(&self, root: &Path, token: &str, filename: &str) -> Result<PathBuf> {
        validate_component(token)?;
        validate_component(filename)?;
        let path = root.join(token).join(filename);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            _ => Err(StreamError::not_found(format!("segment '{}/{}' not found", token, filename))),
        }
    }

    /// Returns the thumbnail sidecar for a segment, extracting it on first use.
    pub async fn thumbnail(&self, root: &Path, token: &str, filename: &str) -> Result<PathBuf> {
        let segment = self.segment_path(root, token, filename).await?;
        let thumb = root.join(token).join(thumbnail_name(filename));
        if tokio::fs::metadata(&thumb).await.is_ok() {
            return Ok(thumb);
        }

        let lock = self
            .thumbnail_locks
            .lock()
            .await
            .entry(thumb.clone())
            .or_default()
            .clone();
        let result = {
            let _guard = lock.lock().await;
            if tokio::fs::metadata(&thumb).await.is_ok() {
                Ok(())
            } else {
                ffmpeg::generate_thumbnail(&self.ffmpeg_path, &segment, &thumb, self.thumbnail_offset).await
            }
        };
        {
            let mut locks = self.thumbnail_locks.lock().await;
            // Only the map and this call still hold it
            if Arc::strong_count(&lock) <= 2 {
                locks.remove(&thumb);
            }
        }
        result?;
        info!("Thumbnail ready: {}", thumb.display());
        Ok(thumb)
    }
}
