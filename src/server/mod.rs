//! Local HTTP frame server.
//!
//! Render sessions fetch decoded source-video frames from here, so every worker
//! process shares the single [`FrameSourceCache`] owned by the supervising render.

pub(crate) mod client;

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context as _;
use axum::{
    Json, Router,
    extract::{Query, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use rand::RngCore as _;
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    foundation::error::{FramecastError, FramecastResult},
    media::{
        frame_source::{FrameRequest, FrameSourceCache, StreamFormat},
        probe::probe_video,
    },
};

pub const SECRET_COOKIE: &str = "framecast-secret";
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Where sessions reach the frame server, and the secret they present.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameServerHandle {
    pub base_url: String,
    pub secret: String,
}

#[derive(Clone, Debug)]
pub struct FrameServerConfig {
    pub ffprobe: PathBuf,
    pub secret: String,
    pub bind: SocketAddr,
    pub request_log: bool,
}

impl Default for FrameServerConfig {
    fn default() -> Self {
        Self {
            ffprobe: PathBuf::from("ffprobe"),
            secret: generate_secret(),
            bind: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)),
            request_log: false,
        }
    }
}

/// Query string of `GET /api/frame`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameQuery {
    pub source: String,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub file_fps: f64,
    #[serde(default)]
    pub scale: bool,
    pub time: f64,
    #[serde(default)]
    pub stream_index: u32,
    #[serde(default)]
    pub output_format: StreamFormat,
    #[serde(default = "default_quality")]
    pub quality: u8,
    pub render_id: Option<u64>,
}

fn default_quality() -> u8 {
    90
}

impl FrameQuery {
    pub fn from_request(req: &FrameRequest) -> Self {
        Self {
            source: req.source.clone(),
            fps: req.fps,
            width: req.width,
            height: req.height,
            file_fps: req.file_fps,
            scale: req.scale,
            time: req.time,
            stream_index: req.stream_index,
            output_format: req.format,
            quality: req.quality,
            render_id: req.render_id,
        }
    }

    pub fn into_request(self) -> FrameRequest {
        FrameRequest {
            source: self.source,
            width: self.width,
            height: self.height,
            scale: self.scale,
            fps: self.fps,
            file_fps: self.file_fps,
            stream_index: self.stream_index,
            format: self.output_format,
            quality: self.quality,
            render_id: self.render_id,
            time: self.time,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataRequest {
    pub path: String,
    #[serde(default)]
    pub stream_index: u32,
}

pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex(&bytes)
}

/// Cookie value for `secret`; the raw secret never leaves the query string.
pub fn secret_digest(secret: &str) -> String {
    hex(&sha2::Sha256::digest(secret.as_bytes()))
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

struct AppState {
    cache: Arc<FrameSourceCache>,
    ffprobe: PathBuf,
    secret: String,
    cookie_digest: String,
}

pub struct FrameServer {
    addr: SocketAddr,
    secret: String,
    cache: Arc<FrameSourceCache>,
    shutdown: CancellationToken,
    task: JoinHandle<std::io::Result<()>>,
}

impl FrameServer {
    pub async fn start(cfg: FrameServerConfig, cache: Arc<FrameSourceCache>) -> FramecastResult<Self> {
        let listener = TcpListener::bind(cfg.bind)
            .await
            .with_context(|| format!("failed to bind frame server on {}", cfg.bind))?;
        let addr = listener
            .local_addr()
            .context("failed to read frame server address")?;

        let state = Arc::new(AppState {
            cache: Arc::clone(&cache),
            ffprobe: cfg.ffprobe,
            cookie_digest: secret_digest(&cfg.secret),
            secret: cfg.secret.clone(),
        });
        let app = router(state, cfg.request_log);

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await
        });
        tracing::info!(%addr, "frame server listening");

        Ok(Self {
            addr,
            secret: cfg.secret,
            cache,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn handle(&self) -> FrameServerHandle {
        FrameServerHandle {
            base_url: format!("http://{}", self.addr),
            secret: self.secret.clone(),
        }
    }

    /// Stops accepting requests and kills every decoder process.
    pub async fn stop(self) -> FramecastResult<()> {
        self.shutdown.cancel();
        self.cache.cleanup_all();

        let mut task = self.task;
        match tokio::time::timeout(STOP_GRACE, &mut task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::warn!("frame server stopped with error: {e}"),
            Ok(Err(e)) => tracing::warn!("frame server task failed: {e}"),
            Err(_) => {
                tracing::warn!("frame server did not stop in time, aborting");
                task.abort();
            }
        }
        tracing::debug!("frame server stopped");
        Ok(())
    }
}

fn router(state: Arc<AppState>, request_log: bool) -> Router {
    let mut app = Router::new()
        .route("/api/frame", get(read_frame))
        .route("/api/read-video-metadata", post(read_video_metadata))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_secret,
        ));
    if request_log {
        app = app.layer(middleware::from_fn(log_request));
    }
    app.with_state(state)
}

#[derive(Deserialize)]
struct SecretParam {
    secret: Option<String>,
}

fn has_secret_cookie(headers: &HeaderMap, digest: &str) -> bool {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .any(|(name, value)| name == SECRET_COOKIE && value == digest)
}

async fn require_secret(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    if has_secret_cookie(req.headers(), &state.cookie_digest) {
        return next.run(req).await;
    }

    let query_ok = Query::<SecretParam>::try_from_uri(req.uri())
        .ok()
        .and_then(|Query(p)| p.secret)
        .is_some_and(|s| s == state.secret);
    if !query_ok {
        return (StatusCode::UNAUTHORIZED, "missing or invalid secret").into_response();
    }

    let mut res = next.run(req).await;
    let cookie = format!("{SECRET_COOKIE}={}; HttpOnly; Path=/", state.cookie_digest);
    if let Ok(v) = HeaderValue::from_str(&cookie) {
        res.headers_mut().append(header::SET_COOKIE, v);
    }
    res
}

async fn log_request(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();
    let res = next.run(req).await;
    tracing::info!(
        %method,
        %path,
        status = res.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "frame server request"
    );
    res
}

async fn read_frame(State(state): State<Arc<AppState>>, Query(query): Query<FrameQuery>) -> Response {
    let render_id = query.render_id;
    let req = query.into_request();
    match state.cache.get_frame(&req).await {
        Ok(frame) => (
            [(header::CONTENT_TYPE, frame.encoding.content_type())],
            frame.data,
        )
            .into_response(),
        Err(e) => {
            let status = match e {
                FramecastError::Busy(_) => StatusCode::CONFLICT,
                _ => StatusCode::BAD_REQUEST,
            };
            tracing::warn!(
                ?render_id,
                source = %req.source,
                time = req.time,
                "frame request failed: {e}"
            );
            (status, e.to_string()).into_response()
        }
    }
}

async fn read_video_metadata(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MetadataRequest>,
) -> Response {
    let path = PathBuf::from(&body.path);
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return (StatusCode::NOT_FOUND, format!("'{}' does not exist", body.path)).into_response();
    }
    match probe_video(&state.ffprobe, &path, body.stream_index).await {
        Ok(info) => Json(info).into_response(),
        Err(e) => {
            tracing::warn!(path = %body.path, "metadata request failed: {e}");
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/server/frame_server.rs"]
mod tests;
