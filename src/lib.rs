//! Framecast renders video frame by frame, many frames at once.
//!
//! A render is split into contiguous parts. Each part runs in its own worker, which
//! drives a content-rendering session frame by frame, captures every frame and pipes
//! it into an ffmpeg encoder. Crashed sessions are recreated within a retry budget.
//! Finished parts are concatenated into the final file.
//!
//! - Plan and run a whole render with [`render_video`]
//! - Render a single part with [`RenderWorker`]
//! - Serve decoded source-video frames with [`FrameServer`]
#![forbid(unsafe_code)]

mod encode;
mod foundation;
mod media;
mod render;
mod server;
mod surface;

pub use crate::foundation::core::{Canvas, Fps, FrameIndex, FrameRange};
pub use crate::foundation::error::{FramecastError, FramecastResult, SessionFault};

pub use crate::encode::ffmpeg::{PartEncoder, PartEncoderConfig, is_ffmpeg_on_path};
pub use crate::encode::merge::{MergeConfig, concat_manifest, merge_parts};
pub use crate::encode::sink::{CapturedFrames, InMemorySink, PartSink};

pub use crate::media::demux::{DemuxError, SplitMode, StreamDemuxer, SubStream};
pub use crate::media::frame_source::{
    DecodeLauncher, DecodeProcess, FfmpegDecodeLauncher, FrameBuffer, FrameRequest,
    FrameSourceCache, StreamFormat,
};
pub use crate::media::probe::{VideoStreamInfo, count_frames, probe_video};

pub use crate::render::barrier::{FrameCompletionBarrier, Generation, SubtaskFailure, SubtaskTicket};
pub use crate::render::config::{CaptureFormat, CaptureMethod, RenderConfig, RenderJob};
pub use crate::render::ipc::{
    IpcLogLayer, IpcSender, PartOutcome, SupervisorMessage, WorkerEvent, WorkerMessage,
    serve_worker,
};
pub use crate::render::pipeline::{
    RenderOptions, RenderSummary, default_output_path, plan_jobs, render_video,
};
pub use crate::render::planner::{Part, effective_concurrency, split_into_parts};
pub use crate::render::pool::{
    InProcessRunner, PartEvent, PartEvents, PartRunner, ProcessRunner, ProgressCallback,
    ProgressSnapshot, ProgressTracker, WorkerPool, render_part_locally,
};
pub use crate::render::worker::{RenderWorker, WorkerState};

pub use crate::server::client::{FetchError, FrameClient};
pub use crate::server::{FrameServer, FrameServerConfig, FrameServerHandle};

pub use crate::surface::host::SceneLauncher;
pub use crate::surface::scene::Scene;
pub use crate::surface::{
    FrameCapturer, LaunchOptions, LaunchedSurface, SessionInit, SurfaceLauncher, SurfaceSession,
};
