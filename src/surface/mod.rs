//! Content-rendering sessions.
//!
//! A render worker drives one [`SurfaceSession`] per part: it initializes the session
//! once, then for every frame triggers it, waits for it to settle and captures the
//! visible state through a [`FrameCapturer`]. Fatal session conditions arrive out of
//! band on the `faults` channel of [`LaunchedSurface`].

pub(crate) mod capture;
pub(crate) mod host;
pub(crate) mod scene;

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    foundation::{
        core::{Fps, FrameIndex},
        error::{FramecastResult, SessionFault},
    },
    media::frame_source::StreamFormat,
    render::{
        barrier::FrameCompletionBarrier,
        config::{CaptureFormat, CaptureMethod, RenderJob},
        planner::Part,
    },
    server::FrameServerHandle,
};

/// Parameters that stay fixed for the lifetime of one session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInit {
    pub width: u32,
    pub height: u32,
    pub fps: Fps,
    pub duration_frames: u64,
    /// Start frame of the owning part.
    pub render_id: u64,
    pub user_data: serde_json::Value,
    pub frame_server: Option<FrameServerHandle>,
    pub stream_format: StreamFormat,
    pub jpeg_quality: u8,
}

impl SessionInit {
    pub fn for_job(job: &RenderJob) -> Self {
        let cfg = &job.config;
        Self {
            width: cfg.width,
            height: cfg.height,
            fps: cfg.fps,
            duration_frames: cfg.duration_frames,
            render_id: job.part.start.0,
            user_data: cfg.user_data.clone(),
            frame_server: cfg.frame_server.clone(),
            stream_format: cfg.stream_format,
            jpeg_quality: cfg.jpeg_quality,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LaunchOptions {
    /// Isolated per-part state directory.
    pub profile_dir: PathBuf,
    pub part: Part,
    pub capture_method: CaptureMethod,
    pub capture_format: CaptureFormat,
    pub jpeg_quality: u8,
    pub settle_delay: Duration,
}

impl LaunchOptions {
    pub fn for_job(job: &RenderJob) -> Self {
        Self {
            profile_dir: job.profile_dir(),
            part: job.part,
            capture_method: job.config.capture_method,
            capture_format: job.config.capture_format,
            jpeg_quality: job.config.jpeg_quality,
            settle_delay: job.config.settle_delay(),
        }
    }
}

pub struct LaunchedSurface {
    pub session: Box<dyn SurfaceSession>,
    pub capturer: Box<dyn FrameCapturer>,
    /// Closed when the session can no longer report faults.
    pub faults: mpsc::UnboundedReceiver<SessionFault>,
}

/// Creates fresh sessions. Called again from scratch after every recoverable failure.
#[async_trait]
pub trait SurfaceLauncher: Send + Sync {
    async fn launch(&self, opts: &LaunchOptions) -> FramecastResult<LaunchedSurface>;
}

#[async_trait]
pub trait SurfaceSession: Send {
    /// Fails fast with a descriptive error if the session cannot render this part.
    async fn initialize(
        &mut self,
        init: &SessionInit,
        barrier: FrameCompletionBarrier,
    ) -> FramecastResult<()>;

    /// Starts materializing `frame`. Asynchronous work must be registered with the
    /// barrier handed to `initialize` before this returns.
    async fn render_frame(&mut self, frame: FrameIndex) -> FramecastResult<()>;

    /// Resolves once layout and paint for `frame` are complete.
    async fn await_settled(&mut self, frame: FrameIndex) -> FramecastResult<()>;

    async fn close(&mut self);
}

/// Returns one encoded image of the current visual state, or fails.
#[async_trait]
pub trait FrameCapturer: Send {
    async fn capture(&mut self, frame: FrameIndex) -> FramecastResult<Vec<u8>>;
}
