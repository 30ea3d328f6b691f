//! Live-view snapshots: a direct HTTP fetch first, ffmpeg as the fallback.

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use tracing::debug;

use crate::errors::{Result, StreamError};
use crate::stream_address;

pub const DEFAULT_CONTENT_TYPE: &str = "image/jpeg";

#[derive(Debug, Clone, Default)]
pub struct FrameRequest {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub transport: Option<String>,
    pub width: Option<u32>,
}

pub enum FrameBody {
    Bytes(Bytes),
    Stream(BoxStream<'static, std::io::Result<Bytes>>),
}

pub struct Frame {
    pub content_type: String,
    pub body: FrameBody,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let body = match &self.body {
            FrameBody::Bytes(bytes) => format!("{} bytes", bytes.len()),
            FrameBody::Stream(_) => "stream".to_string(),
        };
        f.debug_struct("Frame")
            .field("content_type", &self.content_type)
            .field("body", &body)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractMode {
    /// Streaming sources: one frame piped out as MJPEG.
    Pipe,
    /// Still-image HTTP sources: single image, overwritten in place.
    UpdateInPlace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractRequest {
    pub url: String,
    pub transport: Option<String>,
    pub width: Option<u32>,
    pub mode: ExtractMode,
}

#[async_trait]
pub trait FrameExtractor: Send + Sync {
    async fn extract(&self, request: &ExtractRequest) -> Result<Frame>;
}

#[derive(Clone)]
pub struct FrameGateway {
    client: reqwest::Client,
    direct_timeout: Duration,
    default_transport: String,
    extractor: Arc<dyn FrameExtractor>,
}

impl FrameGateway {
    pub fn new(direct_timeout: Duration, default_transport: impl Into<String>, extractor: Arc<dyn FrameExtractor>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .build()?;
        Ok(Self {
            client,
            direct_timeout,
            default_transport: default_transport.into(),
            extractor,
        })
    }

    pub async fn acquire_frame(&self, request: &FrameRequest) -> Result<Frame> {
        if request.url.trim().is_empty() {
            return Err(StreamError::configuration_missing("camera has no source address"));
        }

        if !stream_address::is_http(&request.url) {
            let extract = ExtractRequest {
                url: self.authenticated_url(request),
                transport: Some(request.transport.clone().unwrap_or_else(|| self.default_transport.clone())),
                width: request.width,
                mode: ExtractMode::Pipe,
            };
            return self.extractor.extract(&extract).await.map_err(into_unavailable);
        }

        match self.fetch_direct(request).await {
            Ok(frame) => return Ok(frame),
            Err(e) => debug!("Direct snapshot failed ({}), falling back to ffmpeg", e),
        }

        let extract = ExtractRequest {
            url: self.authenticated_url(request),
            transport: None,
            width: request.width,
            mode: ExtractMode::UpdateInPlace,
        };
        self.extractor.extract(&extract).await.map_err(into_unavailable)
    }

    fn authenticated_url(&self, request: &FrameRequest) -> String {
        match (request.username.as_deref(), request.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() => {
                stream_address::embed_credentials(&request.url, user, pass)
            }
            _ => request.url.clone(),
        }
    }

    async fn fetch_direct(&self, request: &FrameRequest) -> Result<Frame> {
        let mut builder = self.client.get(&request.url).timeout(self.direct_timeout);
        if let Some(user) = request.username.as_deref().filter(|u| !u.is_empty()) {
            builder = builder.basic_auth(user, request.password.as_deref());
        }

        let response = builder.send().await.map_err(|e| self.fetch_error(e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::fetch_failed(format!("HTTP {}", status)));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let body = response.bytes().await.map_err(|e| self.fetch_error(e))?;

        Ok(Frame { content_type, body: FrameBody::Bytes(body) })
    }

    fn fetch_error(&self, e: reqwest::Error) -> StreamError {
        if e.is_timeout() {
            StreamError::FetchTimeout { millis: self.direct_timeout.as_millis() as u64 }
        } else {
            StreamError::fetch_failed(e.to_string())
        }
    }
}

fn into_unavailable(e: StreamError) -> StreamError {
    match e {
        StreamError::ServiceUnavailable { .. } => e,
        other => StreamError::service_unavailable(format!("no frame from source: {}", other)),
    }
}
