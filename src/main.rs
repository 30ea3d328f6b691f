use std::path::PathBuf;
use std::sync::Arc;
use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

mod api;
mod camera_manager;
mod config;
mod errors;
mod ffmpeg;
mod gateway;
mod playback;
mod recording;
mod registry;
mod signal;
mod stream_address;
mod watcher;

use camera_manager::CameraStore;
use config::Config;
use ffmpeg::{FfmpegExtractor, FfmpegLauncher};
use gateway::FrameGateway;
use playback::Playback;
use recording::{RecorderSettings, RecordingSupervisor, RestartPolicy};

/// Covers ffmpeg's own SIGTERM grace period plus trailer writing.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(15);

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Continuous camera recording and live snapshots", long_about = None)]
pub struct Args {
    /// Path to the configuration file (TOML or JSON)
    #[arg(short, long, default_value = "config.toml")]
    pub config: String,

    /// Overrides server.cameras_directory
    #[arg(long)]
    pub cameras_dir: Option<String>,

    /// Overrides recording.destination_root
    #[arg(long)]
    pub recordings_dir: Option<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub cameras: Arc<CameraStore>,
    pub supervisor: RecordingSupervisor,
    pub gateway: FrameGateway,
    pub playback: Arc<Playback>,
}

impl AppState {
    pub fn from_config(config: &Config) -> errors::Result<Self> {
        let cameras = Arc::new(CameraStore::load(config.cameras_directory())?);

        let launcher = Arc::new(FfmpegLauncher::new(&config.ffmpeg_path, config.recording.ffmpeg_log));
        let policy = RestartPolicy {
            min_uptime: config.recording.min_uptime()?,
            restart_delay: config.recording.restart_delay()?,
        };
        let settings = RecorderSettings {
            segment_seconds: config.recording.segment_seconds,
            transport: config.recording.rtsp_transport.clone(),
            startup_delay: config.recording.startup_delay()?,
        };
        let supervisor = RecordingSupervisor::new(
            policy,
            settings,
            config.recording.destination_root.as_ref().map(PathBuf::from),
            cameras.clone(),
            launcher,
        );

        let extractor = Arc::new(FfmpegExtractor::new(&config.ffmpeg_path, config.live.ffmpeg_timeout()?));
        let gateway = FrameGateway::new(config.live.direct_timeout()?, &config.live.default_transport, extractor)?;
        let playback = Arc::new(Playback::new(&config.ffmpeg_path, config.recording.thumbnail_offset()?));

        Ok(Self { cameras, supervisor, gateway, playback })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("camwatch=debug,info")
        .init();

    let args = Args::parse();

    let mut config = Config::load(&args.config).unwrap_or_else(|e| {
        warn!("Could not load {} ({}), using default configuration", args.config, e);
        Config::default()
    });
    if let Some(dir) = &args.cameras_dir {
        config.server.cameras_directory = Some(dir.clone());
    }
    if let Some(dir) = &args.recordings_dir {
        config.recording.destination_root = Some(dir.clone());
    }

    match &config.recording.destination_root {
        Some(root) => info!("Recording to '{}'", root),
        None => warn!("No recording destination configured, recording is disabled"),
    }

    let app_state = AppState::from_config(&config)?;

    if let Err(e) = watcher::start_camera_watcher(app_state.clone()).await {
        warn!("Camera directory watcher not started: {}", e);
    }
    app_state.supervisor.initialize();

    let cors_layer = if let Some(origin) = &config.server.cors_allow_origin {
        if origin == "*" {
            tower_http::cors::CorsLayer::permissive()
        } else {
            match origin.parse::<axum::http::HeaderValue>() {
                Ok(origin_header) => {
                    tower_http::cors::CorsLayer::new()
                        .allow_origin(origin_header)
                        .allow_methods(tower_http::cors::Any)
                        .allow_headers(tower_http::cors::Any)
                }
                Err(_) => {
                    warn!("Invalid CORS origin '{}', falling back to permissive", origin);
                    tower_http::cors::CorsLayer::permissive()
                }
            }
        }
    } else {
        tower_http::cors::CorsLayer::permissive()
    };

    let app = api::router(app_state.clone()).layer(cors_layer);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("HTTP server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let signal = signal::wait_for_stop_signal().await;
            info!("Received {}, shutting down", signal);
        })
        .await?;

    if app_state.supervisor.shutdown(SHUTDOWN_GRACE).await {
        info!("All recordings stopped");
    }
    Ok(())
}
