use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context as _;

use crate::{
    encode::merge::{MergeConfig, merge_parts},
    foundation::{
        core::FrameIndex,
        error::{FramecastError, FramecastResult},
    },
    media::{
        frame_source::{FfmpegDecodeLauncher, FrameSourceCache},
        probe::count_frames,
    },
    render::{
        config::{CaptureFormat, RenderConfig, RenderJob},
        planner::{Part, split_into_parts},
        pool::{PartRunner, ProgressCallback, WorkerPool},
    },
    server::{FrameServer, FrameServerConfig},
};

pub const MANIFEST_NAME: &str = "concat.txt";

/// Invocation-level settings around the shared [`RenderConfig`].
#[derive(Clone, Debug)]
pub struct RenderOptions {
    pub config: RenderConfig,
    pub concurrency: usize,
    pub start_frame: u64,
    /// Defaults to [`default_output_path`].
    pub output: Option<PathBuf>,
    /// Stream-copy the parts into the output instead of re-encoding to H.264.
    pub raw_output: bool,
    pub verify_frame_count: bool,
    pub ffprobe: PathBuf,
    pub frame_server_log: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            config: RenderConfig::default(),
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            start_frame: 0,
            output: None,
            raw_output: true,
            verify_frame_count: false,
            ffprobe: PathBuf::from("ffprobe"),
            frame_server_log: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RenderSummary {
    pub output: PathBuf,
    pub parts: Vec<PathBuf>,
    pub frames: u64,
    pub elapsed: Duration,
}

pub fn default_output_path(config: &RenderConfig, raw_output: bool) -> PathBuf {
    let ext = match (config.duration_frames, raw_output, config.capture_format) {
        (1, _, format) => format.image_extension(),
        (_, true, CaptureFormat::Jpeg) => "mov",
        (_, true, CaptureFormat::Png) => "mkv",
        (_, false, _) => "mp4",
    };
    PathBuf::from(format!("framecast.{ext}"))
}

pub fn plan_jobs(
    config: &RenderConfig,
    start_frame: u64,
    concurrency: usize,
) -> FramecastResult<Vec<RenderJob>> {
    let parts = split_into_parts(FrameIndex(start_frame), config.duration_frames, concurrency)?;
    Ok(parts
        .into_iter()
        .map(|part: Part| RenderJob {
            part,
            config: config.clone(),
        })
        .collect())
}

/// Renders the configured frame range to one video file.
///
/// Starts a frame server for the duration of the call, fans the parts out to
/// `runner`, merges the part files in order and optionally re-counts the frames
/// of the result. Part files and the manifest stay in the temp directory.
#[tracing::instrument(
    skip_all,
    fields(frames = opts.config.duration_frames, concurrency = opts.concurrency)
)]
pub async fn render_video(
    opts: &RenderOptions,
    runner: Arc<dyn PartRunner>,
    progress: Option<ProgressCallback>,
) -> FramecastResult<RenderSummary> {
    opts.config.validate()?;
    if opts.concurrency == 0 {
        return Err(FramecastError::validation("concurrency must be >= 1"));
    }
    let started = Instant::now();
    let output = opts
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&opts.config, opts.raw_output));

    let temp_dir = &opts.config.temp_dir;
    tokio::fs::create_dir_all(temp_dir)
        .await
        .with_context(|| format!("create temp dir '{}'", temp_dir.display()))?;

    let cache = Arc::new(FrameSourceCache::new(Arc::new(FfmpegDecodeLauncher {
        ffmpeg: opts.config.ffmpeg.clone(),
        log_stderr: opts.config.ffmpeg_log,
    })));
    let server = FrameServer::start(
        FrameServerConfig {
            ffprobe: opts.ffprobe.clone(),
            request_log: opts.frame_server_log,
            ..FrameServerConfig::default()
        },
        cache,
    )
    .await?;

    let mut config = opts.config.clone();
    config.frame_server = Some(server.handle());
    let rendered = async {
        let jobs = plan_jobs(&config, opts.start_frame, opts.concurrency)?;
        tracing::info!(
            parts = jobs.len(),
            output = %output.display(),
            "rendering {} frames",
            config.duration_frames
        );
        let parts = run_parts(jobs, runner, progress).await?;
        merge_and_verify(opts, &parts, &output).await?;
        Ok::<_, FramecastError>(parts)
    }
    .await;

    if let Err(e) = server.stop().await {
        tracing::warn!("failed to stop frame server: {e}");
    }
    let parts = rendered?;

    let elapsed = started.elapsed();
    tracing::info!(
        output = %output.display(),
        elapsed_ms = elapsed.as_millis() as u64,
        "render finished"
    );
    Ok(RenderSummary {
        output,
        parts,
        frames: opts.config.duration_frames,
        elapsed,
    })
}

async fn run_parts(
    jobs: Vec<RenderJob>,
    runner: Arc<dyn PartRunner>,
    progress: Option<ProgressCallback>,
) -> FramecastResult<Vec<PathBuf>> {
    let pool = WorkerPool::new(runner, jobs.len());
    let outputs = pool.run(jobs, progress).await;
    pool.terminate().await;
    outputs
}

async fn merge_and_verify(
    opts: &RenderOptions,
    parts: &[PathBuf],
    output: &Path,
) -> FramecastResult<()> {
    let merge = MergeConfig {
        ffmpeg: opts.config.ffmpeg.clone(),
        manifest_path: opts.config.temp_dir.join(MANIFEST_NAME),
        out_path: output.to_path_buf(),
        remux_only: opts.raw_output,
    };
    merge_parts(&merge, parts).await?;

    if opts.verify_frame_count {
        let expected = opts.config.duration_frames;
        let actual = count_frames(&opts.ffprobe, output, 0).await?;
        if actual != expected {
            return Err(FramecastError::Verification { expected, actual });
        }
        tracing::info!(frames = actual, "frame count verified");
    }
    Ok(())
}

#[cfg(test)]
#[path = "../../tests/unit/render/pipeline.rs"]
mod tests;
