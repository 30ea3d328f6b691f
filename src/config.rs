use serde::{Deserialize, Serialize};
use std::fs;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use crate::errors::{Result, StreamError};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CameraStatus {
    Online,
    #[default]
    Offline,
    Recording,
    Error,
}

impl CameraStatus {
    pub fn is_recordable(&self) -> bool {
        matches!(self, CameraStatus::Online | CameraStatus::Recording)
    }
}

impl std::fmt::Display for CameraStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraStatus::Online => write!(f, "online"),
            CameraStatus::Offline => write!(f, "offline"),
            CameraStatus::Recording => write!(f, "recording"),
            CameraStatus::Error => write!(f, "error"),
        }
    }
}

/// A camera record as kept by the camera store. The recorder only reads it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Camera {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub status: CameraStatus,
}

impl Camera {
    /// Whether a change from `previous` to `self` affects the recording session.
    pub fn recording_changed(&self, previous: &Camera) -> bool {
        self.url != previous.url
            || self.username != previous.username
            || self.password != previous.password
            || self.status != previous.status
            || self.name != previous.name
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub live: LiveConfig,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_allow_origin: Option<String>,
    pub cameras_directory: Option<String>,  // Directory path for camera record files (default: "cameras")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FfmpegLog {
    #[default]
    None,
    Console,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Root folder for segment files. Recording is off while unset.
    pub destination_root: Option<String>,
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u64,
    #[serde(default = "default_transport")]
    pub rtsp_transport: String,
    #[serde(default = "default_restart_delay")]
    pub restart_delay: String,
    #[serde(default = "default_min_uptime")]
    pub min_uptime: String,
    #[serde(default = "default_startup_delay")]
    pub startup_delay: String,
    #[serde(default = "default_thumbnail_offset")]
    pub thumbnail_offset: String,
    #[serde(default)]
    pub ffmpeg_log: FfmpegLog,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    #[serde(default = "default_direct_timeout")]
    pub direct_timeout: String,
    #[serde(default = "default_ffmpeg_timeout")]
    pub ffmpeg_timeout: String,
    #[serde(default = "default_transport")]
    pub default_transport: String,
}

fn default_ffmpeg_path() -> String { "ffmpeg".to_string() }
fn default_segment_seconds() -> u64 { 600 }
fn default_transport() -> String { "tcp".to_string() }
fn default_restart_delay() -> String { "15s".to_string() }
fn default_min_uptime() -> String { "10s".to_string() }
fn default_startup_delay() -> String { "5s".to_string() }
fn default_thumbnail_offset() -> String { "1s".to_string() }
fn default_direct_timeout() -> String { "3s".to_string() }
fn default_ffmpeg_timeout() -> String { "5s".to_string() }

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            destination_root: None,
            segment_seconds: default_segment_seconds(),
            rtsp_transport: default_transport(),
            restart_delay: default_restart_delay(),
            min_uptime: default_min_uptime(),
            startup_delay: default_startup_delay(),
            thumbnail_offset: default_thumbnail_offset(),
            ffmpeg_log: FfmpegLog::default(),
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            direct_timeout: default_direct_timeout(),
            ffmpeg_timeout: default_ffmpeg_timeout(),
            default_transport: default_transport(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                cors_allow_origin: Some("*".to_string()),
                cameras_directory: None,  // Default: "cameras"
            },
            recording: RecordingConfig::default(),
            live: LiveConfig::default(),
            ffmpeg_path: default_ffmpeg_path(),
        }
    }
}

/// Parse a humantime duration string like "15s" or "500ms".
pub fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    let duration = humantime::parse_duration(value)
        .map_err(|e| StreamError::config(format!("Invalid duration for '{}': {} ({})", field, value, e)))?;
    if duration.is_zero() {
        return Err(StreamError::config(format!("Duration for '{}' must be positive", field)));
    }
    Ok(duration)
}

impl RecordingConfig {
    pub fn restart_delay(&self) -> Result<Duration> {
        parse_duration("recording.restart_delay", &self.restart_delay)
    }

    pub fn min_uptime(&self) -> Result<Duration> {
        parse_duration("recording.min_uptime", &self.min_uptime)
    }

    pub fn startup_delay(&self) -> Result<Duration> {
        parse_duration("recording.startup_delay", &self.startup_delay)
    }

    pub fn thumbnail_offset(&self) -> Result<Duration> {
        parse_duration("recording.thumbnail_offset", &self.thumbnail_offset)
    }
}

impl LiveConfig {
    pub fn direct_timeout(&self) -> Result<Duration> {
        parse_duration("live.direct_timeout", &self.direct_timeout)
    }

    pub fn ffmpeg_timeout(&self) -> Result<Duration> {
        parse_duration("live.ffmpeg_timeout", &self.ffmpeg_timeout)
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = if path.ends_with(".json") {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject unparseable durations up front instead of at first use.
    pub fn validate(&self) -> Result<()> {
        self.recording.restart_delay()?;
        self.recording.min_uptime()?;
        self.recording.startup_delay()?;
        self.recording.thumbnail_offset()?;
        self.live.direct_timeout()?;
        self.live.ffmpeg_timeout()?;
        if self.recording.segment_seconds == 0 {
            return Err(StreamError::config("recording.segment_seconds must be positive"));
        }
        Ok(())
    }

    pub fn cameras_directory(&self) -> &str {
        self.server.cameras_directory.as_deref().unwrap_or("cameras")
    }

    pub fn load_cameras_from_directory(cameras_dir: &str) -> Result<HashMap<String, Camera>> {
        let mut cameras = HashMap::new();

        if !Path::new(cameras_dir).exists() {
            warn!("Cameras directory '{}' does not exist, no cameras will be loaded", cameras_dir);
            return Ok(cameras);
        }

        for entry in fs::read_dir(cameras_dir)? {
            let path = entry?.path();
            let Some(file_stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match Self::read_camera_file(&path) {
                Ok(Some(mut camera)) => {
                    // The file name is authoritative for the identifier
                    camera.id = file_stem.to_string();
                    info!("Loaded camera record: {}", file_stem);
                    cameras.insert(file_stem.to_string(), camera);
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping camera file {}: {}", path.display(), e),
            }
        }

        Ok(cameras)
    }

    /// Reads a `.json` or `.toml` camera file; other extensions yield `None`.
    pub fn read_camera_file(path: &Path) -> Result<Option<Camera>> {
        match path.extension().and_then(|s| s.to_str()) {
            Some("json") => {
                let content = fs::read_to_string(path)?;
                Ok(Some(serde_json::from_str::<Camera>(&content)?))
            }
            Some("toml") => {
                let content = fs::read_to_string(path)?;
                Ok(Some(toml::from_str::<Camera>(&content)?))
            }
            _ => Ok(None),
        }
    }

    pub fn save_camera(camera: &Camera, cameras_dir: &str) -> Result<()> {
        if !Path::new(cameras_dir).exists() {
            fs::create_dir_all(cameras_dir)?;
        }

        let file_path = Path::new(cameras_dir).join(format!("{}.json", camera.id));
        let json_content = serde_json::to_string_pretty(camera)?;
        fs::write(&file_path, json_content)?;

        info!("Saved camera record: {} to {}", camera.id, file_path.display());
        Ok(())
    }

    pub fn delete_camera(camera_id: &str, cameras_dir: &str) -> Result<bool> {
        let mut deleted = false;

        for ext in ["json", "toml"] {
            let path = Path::new(cameras_dir).join(format!("{}.{}", camera_id, ext));
            if path.exists() {
                fs::remove_file(&path)?;
                deleted = true;
                info!("Deleted camera record: {} ({})", camera_id, ext);
            }
        }

        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(id: &str) -> Camera {
        Camera {
            id: id.to_string(),
            name: "Garage".to_string(),
            url: "rtsp://10.0.0.5/stream1".to_string(),
            username: None,
            password: None,
            status: CameraStatus::Online,
        }
    }

    #[test]
    fn test_defaults_parse() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.recording.restart_delay().unwrap(), Duration::from_secs(15));
        assert_eq!(config.recording.min_uptime().unwrap(), Duration::from_secs(10));
        assert_eq!(config.live.direct_timeout().unwrap(), Duration::from_secs(3));
        assert_eq!(config.live.ffmpeg_timeout().unwrap(), Duration::from_secs(5));
        assert_eq!(config.recording.segment_seconds, 600);
    }

    #[test]
    fn test_minimal_toml() {
        let config: Config = toml::from_str(
            r#"
            [server]
            host = "127.0.0.1"
            port = 9000

            [recording]
            destination_root = "/srv/nvr"
            restart_delay = "30s"
            "#,
        )
        .unwrap();
        assert_eq!(config.recording.destination_root.as_deref(), Some("/srv/nvr"));
        assert_eq!(config.recording.restart_delay().unwrap(), Duration::from_secs(30));
        assert_eq!(config.recording.min_uptime().unwrap(), Duration::from_secs(10));
        assert_eq!(config.ffmpeg_path, "ffmpeg");
        assert_eq!(config.cameras_directory(), "cameras");
    }

    #[test]
    fn test_invalid_duration_rejected() {
        let mut config = Config::default();
        config.recording.restart_delay = "soon".to_string();
        assert!(config.validate().is_err());
        config.recording.restart_delay = "0s".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_camera_files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let dir_str = dir.path().to_str().unwrap();

        let mut cam = camera("garage");
        cam.username = Some("admin".to_string());
        Config::save_camera(&cam, dir_str).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let loaded = Config::load_cameras_from_directory(dir_str).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["garage"], cam);

        assert!(Config::delete_camera("garage", dir_str).unwrap());
        assert!(!Config::delete_camera("garage", dir_str).unwrap());
    }

    #[test]
    fn test_status_defaults_to_offline() {
        let cam: Camera = serde_json::from_str(r#"{"id":"a","name":"A"}"#).unwrap();
        assert_eq!(cam.status, CameraStatus::Offline);
        assert!(cam.url.is_empty());
        assert!(!cam.status.is_recordable());
        assert!(CameraStatus::Recording.is_recordable());
    }

    #[test]
    fn test_recording_changed() {
        let a = camera("a");
        let mut b = a.clone();
        assert!(!b.recording_changed(&a));
        b.status = CameraStatus::Offline;
        assert!(b.recording_changed(&a));
        let mut c = a.clone();
        c.url = "rtsp://10.0.0.6/stream1".to_string();
        assert!(c.recording_changed(&a));
    }
}
