//! Part dispatch, cross-part progress and the fan-out failure policy.

use std::{
    path::PathBuf,
    process::Stdio,
    sync::Arc,
    time::Instant,
};

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt as _, BufReader},
    process::Command,
    sync::{Semaphore, mpsc},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::{
    encode::ffmpeg::{PartEncoder, PartEncoderConfig},
    foundation::{
        core::Fps,
        error::{FramecastError, FramecastResult},
    },
    render::{
        config::RenderJob,
        ipc::{SupervisorMessage, WorkerEvent, WorkerMessage, write_line},
        worker::RenderWorker,
    },
    surface::SurfaceLauncher,
};

#[derive(Clone, Debug, PartialEq)]
pub struct PartEvent {
    pub part: usize,
    pub event: WorkerEvent,
}

/// Event channel of one part.
#[derive(Clone, Debug)]
pub struct PartEvents {
    part: usize,
    tx: mpsc::UnboundedSender<PartEvent>,
}

impl PartEvents {
    pub fn new(part: usize, tx: mpsc::UnboundedSender<PartEvent>) -> Self {
        Self { part, tx }
    }

    /// Events go nowhere.
    pub fn detached(part: usize) -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        Self { part, tx }
    }

    pub fn part(&self) -> usize {
        self.part
    }

    pub fn emit(&self, event: WorkerEvent) {
        // The pool stops listening once it has settled.
        let _ = self.tx.send(PartEvent {
            part: self.part,
            event,
        });
    }
}

/// Executes one part somewhere and returns its output file.
#[async_trait]
pub trait PartRunner: Send + Sync {
    async fn run_part(
        &self,
        job: RenderJob,
        events: PartEvents,
        cancel: CancellationToken,
    ) -> FramecastResult<PathBuf>;

    /// Kills anything still running. Called once after every render.
    async fn terminate(&self) {}
}

/// Renders one part in the current process, feeding an ffmpeg part encoder.
pub async fn render_part_locally(
    job: RenderJob,
    launcher: Arc<dyn SurfaceLauncher>,
    events: PartEvents,
    cancel: CancellationToken,
) -> FramecastResult<PathBuf> {
    let encoder = PartEncoder::spawn(PartEncoderConfig {
        ffmpeg: job.config.ffmpeg.clone(),
        fps: job.config.fps,
        format: job.config.capture_format,
        out_path: job.output_path(),
        output_args: job.config.output_ffmpeg_args.clone(),
        log_stderr: job.config.ffmpeg_log,
    })?;
    RenderWorker::new(job, launcher, events, cancel)
        .run(Box::new(encoder))
        .await
}

/// Runs parts as tasks of this process.
pub struct InProcessRunner {
    launcher: Arc<dyn SurfaceLauncher>,
}

impl InProcessRunner {
    pub fn new(launcher: Arc<dyn SurfaceLauncher>) -> Self {
        Self { launcher }
    }
}

#[async_trait]
impl PartRunner for InProcessRunner {
    async fn run_part(
        &self,
        job: RenderJob,
        events: PartEvents,
        cancel: CancellationToken,
    ) -> FramecastResult<PathBuf> {
        render_part_locally(job, Arc::clone(&self.launcher), events, cancel).await
    }
}

/// Runs every part in its own worker process speaking the line protocol of
/// [`crate::render::ipc`] over stdin/stdout.
pub struct ProcessRunner {
    exe: PathBuf,
    args: Vec<String>,
    shutdown: CancellationToken,
}

impl ProcessRunner {
    pub fn new(exe: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            exe: exe.into(),
            args,
            shutdown: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl PartRunner for ProcessRunner {
    async fn run_part(
        &self,
        job: RenderJob,
        events: PartEvents,
        cancel: CancellationToken,
    ) -> FramecastResult<PathBuf> {
        let part = job.part.index;
        let mut child = Command::new(&self.exe)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                FramecastError::worker(format!(
                    "failed to spawn worker '{}': {e}",
                    self.exe.display()
                ))
            })?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| FramecastError::worker("failed to open worker stdin (unexpected)"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FramecastError::worker("failed to open worker stdout (unexpected)"))?;

        write_line(
            &mut stdin,
            &SupervisorMessage::RenderPart { job: Box::new(job) },
        )
        .await?;

        let mut lines = BufReader::new(stdout).lines();
        let mut outcome = None;
        let mut cancel_sent = false;
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line.context("read worker output")? else {
                        break;
                    };
                    match serde_json::from_str::<WorkerMessage>(&line) {
                        Ok(WorkerMessage::Event(event)) => events.emit(event),
                        Ok(WorkerMessage::Outcome(o)) => {
                            outcome = Some(o);
                            break;
                        }
                        Err(e) => tracing::warn!(part, "unparseable worker output ({e}): {line}"),
                    }
                }
                _ = cancel.cancelled(), if !cancel_sent => {
                    cancel_sent = true;
                    if let Err(e) = write_line(&mut stdin, &SupervisorMessage::Cancel).await {
                        tracing::debug!(part, "could not deliver cancel to worker: {e}");
                    }
                }
                _ = self.shutdown.cancelled() => {
                    tracing::warn!(part, "killing worker process");
                    let _ = child.start_kill();
                    break;
                }
            }
        }
        drop(stdin);

        let status = child.wait().await.context("wait for worker process")?;
        match outcome {
            Some(o) => o.into_result(),
            None => Err(FramecastError::worker(format!(
                "worker for part {part} exited without a result ({status})"
            ))),
        }
    }

    async fn terminate(&self) {
        self.shutdown.cancel();
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProgressSnapshot {
    pub frames_done: u64,
    pub total_frames: u64,
    pub percent: f64,
    /// Frames per second since the render started.
    pub fps: f64,
    pub part_percent: Vec<f64>,
}

pub type ProgressCallback = Arc<dyn Fn(&ProgressSnapshot) + Send + Sync>;

/// Aggregates per-part progress events into whole-render progress.
pub struct ProgressTracker {
    part_frames: Vec<u64>,
    part_done: Vec<u64>,
    log_every: u64,
    last_logged: u64,
    started: Instant,
    callback: Option<ProgressCallback>,
}

impl ProgressTracker {
    pub fn new(part_frames: Vec<u64>, fps: Fps, callback: Option<ProgressCallback>) -> Self {
        Self {
            part_done: vec![0; part_frames.len()],
            part_frames,
            log_every: (fps.as_f64().ceil() as u64).max(1),
            last_logged: 0,
            started: Instant::now(),
            callback,
        }
    }

    pub fn total_frames(&self) -> u64 {
        self.part_frames.iter().sum()
    }

    pub fn record(&mut self, part: usize, frame_index: u64) -> Option<ProgressSnapshot> {
        let (Some(done), Some(&len)) = (self.part_done.get_mut(part), self.part_frames.get(part))
        else {
            tracing::warn!(part, "progress for unknown part");
            return None;
        };
        *done = (*done).max(frame_index + 1).min(len);

        let snapshot = self.snapshot();
        if snapshot.frames_done - self.last_logged >= self.log_every
            || snapshot.frames_done == snapshot.total_frames
        {
            self.last_logged = snapshot.frames_done;
            tracing::info!(
                done = snapshot.frames_done,
                total = snapshot.total_frames,
                "progress {:.1}% ({:.1} fps)",
                snapshot.percent,
                snapshot.fps
            );
        }
        if let Some(cb) = &self.callback {
            cb(&snapshot);
        }
        Some(snapshot)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let frames_done = self.part_done.iter().sum::<u64>();
        let total_frames = self.total_frames();
        let elapsed = self.started.elapsed().as_secs_f64();
        ProgressSnapshot {
            frames_done,
            total_frames,
            percent: percent(frames_done, total_frames),
            fps: if elapsed > 0.0 {
                frames_done as f64 / elapsed
            } else {
                0.0
            },
            part_percent: self
                .part_done
                .iter()
                .zip(&self.part_frames)
                .map(|(&d, &t)| percent(d, t))
                .collect(),
        }
    }
}

fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    done as f64 * 100.0 / total as f64
}

fn relay_log(part: usize, level: &str, message: &str) {
    match level {
        "error" => tracing::error!(part, "{message}"),
        "warn" => tracing::warn!(part, "{message}"),
        "debug" => tracing::debug!(part, "{message}"),
        "trace" => tracing::trace!(part, "{message}"),
        _ => tracing::info!(part, "{message}"),
    }
}

/// Runs parts with bounded parallelism.
///
/// The first part to fail cancels every other part; the pool then waits for all of
/// them to settle and returns that first error.
pub struct WorkerPool {
    runner: Arc<dyn PartRunner>,
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(runner: Arc<dyn PartRunner>, concurrency: usize) -> Self {
        Self {
            runner,
            concurrency: concurrency.max(1),
        }
    }

    /// Output files in job order.
    #[tracing::instrument(skip_all, fields(parts = jobs.len(), concurrency = self.concurrency))]
    pub async fn run(
        &self,
        jobs: Vec<RenderJob>,
        progress: Option<ProgressCallback>,
    ) -> FramecastResult<Vec<PathBuf>> {
        let Some(fps) = jobs.first().map(|j| j.config.fps) else {
            return Ok(Vec::new());
        };
        let mut tracker = ProgressTracker::new(
            jobs.iter().map(|j| j.part.len_frames()).collect(),
            fps,
            progress,
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let tokens = jobs
            .iter()
            .map(|_| CancellationToken::new())
            .collect::<Vec<_>>();

        let mut set = JoinSet::new();
        for (slot, (job, token)) in jobs.into_iter().zip(&tokens).enumerate() {
            let runner = Arc::clone(&self.runner);
            let permits = Arc::clone(&permits);
            let events = PartEvents::new(slot, tx.clone());
            let token = token.clone();
            set.spawn(async move {
                let res = match permits.acquire_owned().await {
                    Ok(_permit) if token.is_cancelled() => Err(FramecastError::Cancelled),
                    Ok(_permit) => runner.run_part(job, events, token).await,
                    Err(_) => Err(FramecastError::worker("worker pool closed")),
                };
                (slot, res)
            });
        }
        drop(tx);

        let mut outputs: Vec<Option<PathBuf>> = vec![None; tokens.len()];
        let mut first_error = None;
        loop {
            tokio::select! {
                Some(ev) = rx.recv() => self.handle_event(&mut tracker, ev),
                joined = set.join_next() => {
                    let (slot, res) = match joined {
                        None => break,
                        Some(Ok(done)) => done,
                        Some(Err(e)) => (usize::MAX, Err(FramecastError::worker(format!("part task failed: {e}")))),
                    };
                    match res {
                        Ok(path) => {
                            if let Some(out) = outputs.get_mut(slot) {
                                *out = Some(path);
                            }
                        }
                        Err(e) if first_error.is_none() => {
                            tracing::error!(part = slot, "part failed, aborting the others: {e}");
                            tokens.iter().for_each(CancellationToken::cancel);
                            first_error = Some(e);
                        }
                        Err(e) => tracing::debug!(part = slot, "part settled after abort: {e}"),
                    }
                }
            }
        }
        while let Ok(ev) = rx.try_recv() {
            self.handle_event(&mut tracker, ev);
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        outputs
            .into_iter()
            .enumerate()
            .map(|(i, out)| {
                out.ok_or_else(|| FramecastError::worker(format!("part {i} produced no output")))
            })
            .collect()
    }

    fn handle_event(&self, tracker: &mut ProgressTracker, ev: PartEvent) {
        match ev.event {
            WorkerEvent::Progress { frame_index } => {
                tracker.record(ev.part, frame_index);
            }
            WorkerEvent::Log { level, message } => relay_log(ev.part, &level, &message),
        }
    }

    pub async fn terminate(&self) {
        self.runner.terminate().await;
    }
}

#[cfg(test)]
#[path = "../../tests/unit/render/pool.rs"]
mod tests;
