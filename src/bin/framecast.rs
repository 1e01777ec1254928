use std::{net::SocketAddr, path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _};

use framecast::{
    CaptureFormat, CaptureMethod, FfmpegDecodeLauncher, Fps, FrameServer, FrameServerConfig,
    FrameSourceCache, InProcessRunner, IpcLogLayer, IpcSender, PartRunner, ProcessRunner,
    RenderConfig, RenderOptions, Scene, SceneLauncher, StreamFormat, count_frames, probe_video,
    render_part_locally, render_video, serve_worker,
};

const LOG_ENV: &str = "FRAMECAST_LOG";

#[derive(Parser, Debug)]
#[command(name = "framecast", version, about = "Parallel frame-by-frame video renderer")]
struct Cli {
    /// Debug logging and full error chains.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render a scene to a video file (requires `ffmpeg` on PATH).
    Render(RenderArgs),
    /// Run one part for a supervising `render` over stdin/stdout.
    #[command(hide = true)]
    Worker,
    /// Run the frame server standalone until Ctrl-C.
    Serve(ServeArgs),
    /// Print video stream metadata as JSON (requires `ffprobe` on PATH).
    Probe(ProbeArgs),
}

#[derive(Args, Debug)]
struct RenderArgs {
    /// Scene JSON to render.
    scene: PathBuf,

    /// Output file. Defaults to `framecast.<ext>` chosen by duration and format.
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Number of frames to render.
    #[arg(long, conflicts_with = "duration_secs")]
    duration_frames: Option<u64>,

    /// Duration in seconds, rounded to whole frames.
    #[arg(long)]
    duration_secs: Option<f64>,

    /// First frame of the rendered range.
    #[arg(long, default_value_t = 0)]
    start_frame: u64,

    #[arg(long, default_value_t = 800)]
    width: u32,

    #[arg(long, default_value_t = 600)]
    height: u32,

    /// Frame rate, e.g. `30` or `30000/1001`.
    #[arg(long, default_value = "30")]
    fps: Fps,

    /// Parallel parts. Defaults to the number of CPUs.
    #[arg(long)]
    concurrency: Option<usize>,

    #[arg(long, value_enum, default_value_t = CaptureMethod::Screenshot)]
    capture_method: CaptureMethod,

    #[arg(long, value_enum, default_value_t = CaptureFormat::Jpeg)]
    capture_format: CaptureFormat,

    #[arg(long, default_value_t = 90)]
    jpeg_quality: u8,

    /// Encoding video layers are fetched in from the frame server.
    #[arg(long, value_enum, default_value_t = StreamFormat::Jpeg)]
    stream_format: StreamFormat,

    /// Session restarts allowed per frame.
    #[arg(long, default_value_t = 3)]
    retries: u32,

    /// Per-frame timeout in milliseconds.
    #[arg(long, default_value_t = 30_000)]
    frame_timeout_ms: u64,

    /// Log failed content subtasks instead of failing the frame.
    #[arg(long)]
    ignore_content_errors: bool,

    /// Wait this long after paint before capturing.
    #[arg(long, default_value_t = 0)]
    settle_delay_ms: u64,

    /// Re-encode the merged output to H.264 instead of stream-copying the parts.
    #[arg(long)]
    encode: bool,

    /// Re-count the output frames after merging and fail on mismatch.
    #[arg(long)]
    verify_frame_count: bool,

    /// Part files and the merge manifest are kept here.
    #[arg(long, default_value = "framecast-tmp")]
    temp_dir: PathBuf,

    /// Replaces `-c copy` in the per-part encoder command. Repeatable.
    #[arg(long = "output-ffmpeg-arg", allow_hyphen_values = true)]
    output_ffmpeg_args: Vec<String>,

    /// JSON payload handed to every session.
    #[arg(long)]
    user_data: Option<String>,

    /// Log every written frame.
    #[arg(long)]
    per_frame_log: bool,

    /// Forward ffmpeg stderr at debug level.
    #[arg(long)]
    ffmpeg_log: bool,

    /// Log every frame server request.
    #[arg(long)]
    request_log: bool,

    /// Render parts as tasks of this process instead of worker processes.
    #[arg(long)]
    in_process: bool,

    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: PathBuf,

    #[arg(long, default_value = "ffprobe")]
    ffprobe: PathBuf,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:0")]
    bind: SocketAddr,

    /// Shared secret. Generated when omitted.
    #[arg(long)]
    secret: Option<String>,

    #[arg(long)]
    request_log: bool,

    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: PathBuf,

    #[arg(long, default_value = "ffprobe")]
    ffprobe: PathBuf,
}

#[derive(Args, Debug)]
struct ProbeArgs {
    /// Media file to inspect.
    path: PathBuf,

    #[arg(long, default_value_t = 0)]
    stream_index: u32,

    /// Also count the frames of the stream (slow for long files).
    #[arg(long)]
    count_frames: bool,

    #[arg(long, default_value = "ffprobe")]
    ffprobe: PathBuf,
}

fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }))
}

fn init_tracing(verbose: bool) {
    tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let verbose = cli.verbose;

    let res = match cli.cmd {
        Command::Worker => cmd_worker(verbose).await,
        Command::Render(args) => {
            init_tracing(verbose);
            cmd_render(args, verbose).await
        }
        Command::Serve(args) => {
            init_tracing(verbose);
            cmd_serve(args).await
        }
        Command::Probe(args) => {
            init_tracing(verbose);
            cmd_probe(args).await
        }
    };

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if verbose {
                eprintln!("Error: {e:?}");
            } else {
                eprintln!("Error: {e:#}");
            }
            ExitCode::FAILURE
        }
    }
}

fn render_options(args: &RenderArgs) -> anyhow::Result<RenderOptions> {
    let duration_frames = match (args.duration_frames, args.duration_secs) {
        (Some(frames), _) => frames,
        (None, Some(secs)) => {
            anyhow::ensure!(
                secs.is_finite() && secs > 0.0,
                "duration must be a positive number of seconds"
            );
            args.fps.secs_to_frames_round(secs)
        }
        (None, None) => 1,
    };
    let user_data = match &args.user_data {
        Some(raw) => serde_json::from_str(raw).context("parse --user-data JSON")?,
        None => serde_json::Value::Null,
    };

    let defaults = RenderOptions::default();
    Ok(RenderOptions {
        config: RenderConfig {
            scene: args.scene.clone(),
            width: args.width,
            height: args.height,
            fps: args.fps,
            duration_frames,
            capture_method: args.capture_method,
            capture_format: args.capture_format,
            jpeg_quality: args.jpeg_quality,
            stream_format: args.stream_format,
            num_retries: args.retries,
            frame_render_timeout_ms: args.frame_timeout_ms,
            fail_on_web_errors: !args.ignore_content_errors,
            settle_delay_ms: args.settle_delay_ms,
            temp_dir: args.temp_dir.clone(),
            ffmpeg: args.ffmpeg.clone(),
            output_ffmpeg_args: (!args.output_ffmpeg_args.is_empty())
                .then(|| args.output_ffmpeg_args.clone()),
            user_data,
            frame_server: None,
            per_frame_log: args.per_frame_log,
            ffmpeg_log: args.ffmpeg_log,
        },
        concurrency: args.concurrency.unwrap_or(defaults.concurrency),
        start_frame: args.start_frame,
        output: args.output.clone(),
        raw_output: !args.encode,
        verify_frame_count: args.verify_frame_count,
        ffprobe: args.ffprobe.clone(),
        frame_server_log: args.request_log,
    })
}

async fn cmd_render(args: RenderArgs, verbose: bool) -> anyhow::Result<()> {
    let opts = render_options(&args)?;
    // Fail on a broken scene before any process is spawned.
    let scene = Scene::from_path(&opts.config.scene)?;

    let runner: Arc<dyn PartRunner> = if args.in_process {
        Arc::new(InProcessRunner::new(Arc::new(SceneLauncher::new(scene))))
    } else {
        let exe = std::env::current_exe().context("locate current executable")?;
        let mut worker_args = vec!["worker".to_string()];
        if verbose {
            worker_args.push("--verbose".to_string());
        }
        Arc::new(ProcessRunner::new(exe, worker_args))
    };

    let summary = render_video(&opts, runner, None).await?;
    eprintln!(
        "wrote {} ({} frames in {:.1}s)",
        summary.output.display(),
        summary.frames,
        summary.elapsed.as_secs_f64()
    );
    Ok(())
}

async fn cmd_worker(verbose: bool) -> anyhow::Result<()> {
    let (ipc, writer) = IpcSender::spawn_writer(tokio::io::stdout());
    tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(IpcLogLayer::new(ipc.clone()))
        .init();

    serve_worker(tokio::io::stdin(), ipc.clone(), |job, events, cancel| async move {
        let scene = Scene::from_path(&job.config.scene)?;
        render_part_locally(job, Arc::new(SceneLauncher::new(scene)), events, cancel).await
    })
    .await?;
    drop(ipc);
    // The tracing layer keeps its own sender, so the writer is only flushed, never closed.
    writer.abort();
    Ok(())
}

async fn cmd_serve(args: ServeArgs) -> anyhow::Result<()> {
    let cache = Arc::new(FrameSourceCache::new(Arc::new(FfmpegDecodeLauncher {
        ffmpeg: args.ffmpeg,
        log_stderr: false,
    })));
    let mut cfg = FrameServerConfig {
        ffprobe: args.ffprobe,
        bind: args.bind,
        request_log: args.request_log,
        ..FrameServerConfig::default()
    };
    if let Some(secret) = args.secret {
        cfg.secret = secret;
    }

    let server = FrameServer::start(cfg, cache).await?;
    let handle = server.handle();
    println!("url: {}", handle.base_url);
    println!("secret: {}", handle.secret);

    tokio::signal::ctrl_c()
        .await
        .context("wait for Ctrl-C")?;
    server.stop().await?;
    Ok(())
}

async fn cmd_probe(args: ProbeArgs) -> anyhow::Result<()> {
    let info = probe_video(&args.ffprobe, &args.path, args.stream_index).await?;
    let mut out = serde_json::to_value(&info).context("serialize metadata")?;
    if args.count_frames {
        let frames = count_frames(&args.ffprobe, &args.path, args.stream_index).await?;
        out["frameCount"] = serde_json::Value::from(frames);
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&out).context("serialize metadata")?
    );
    Ok(())
}
