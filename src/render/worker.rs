//! Per-part render loop with session crash recovery.

use std::{fmt, path::PathBuf, sync::Arc};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    encode::sink::PartSink,
    foundation::{
        core::FrameIndex,
        error::{FramecastError, FramecastResult, SessionFault},
    },
    render::{
        barrier::{FrameCompletionBarrier, Generation, SubtaskFailure},
        config::RenderJob,
        ipc::WorkerEvent,
        pool::PartEvents,
    },
    surface::{LaunchOptions, LaunchedSurface, SessionInit, SurfaceLauncher},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Ready,
    RenderingFrame(FrameIndex),
    Recovering { attempt: u32 },
    Failed,
    Done,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Ready => write!(f, "ready"),
            Self::RenderingFrame(i) => write!(f, "rendering frame {i}"),
            Self::Recovering { attempt } => write!(f, "recovering (attempt {attempt})"),
            Self::Failed => write!(f, "failed"),
            Self::Done => write!(f, "done"),
        }
    }
}

struct ActiveSession {
    surface: LaunchedSurface,
    barrier: FrameCompletionBarrier,
}

impl ActiveSession {
    async fn close(mut self) {
        self.surface.session.close().await;
    }
}

/// Renders one part frame by frame into a [`PartSink`].
///
/// Frames are strictly sequential: frame `i + 1` is not triggered before frame `i`
/// was accepted by the sink. Recoverable failures tear the session down and retry
/// the same frame on a fresh one until the retry budget is spent.
pub struct RenderWorker {
    job: RenderJob,
    launcher: Arc<dyn SurfaceLauncher>,
    events: PartEvents,
    cancel: CancellationToken,
    state: WorkerState,
    generation: u64,
    attempts: u64,
}

impl RenderWorker {
    pub fn new(
        job: RenderJob,
        launcher: Arc<dyn SurfaceLauncher>,
        events: PartEvents,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job,
            launcher,
            events,
            cancel,
            state: WorkerState::Starting,
            generation: 0,
            attempts: 0,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Frame attempts made so far, retries included.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Renders the whole part. The sink is finished on success and aborted on any
    /// failure; the session is closed either way.
    #[tracing::instrument(
        name = "render_part",
        skip_all,
        fields(part = self.job.part.index, start = %self.job.part.start, end = %self.job.part.end)
    )]
    pub async fn run(&mut self, mut sink: Box<dyn PartSink>) -> FramecastResult<PathBuf> {
        let mut active = None;
        let rendered = self.render_frames(&mut active, sink.as_mut()).await;
        if let Some(session) = active.take() {
            session.close().await;
        }

        match rendered {
            Ok(()) => {
                let out = sink.finish().await;
                self.transition(if out.is_ok() {
                    WorkerState::Done
                } else {
                    WorkerState::Failed
                });
                out
            }
            Err(e) => {
                self.transition(WorkerState::Failed);
                sink.abort().await;
                Err(e)
            }
        }
    }

    fn transition(&mut self, next: WorkerState) {
        if self.state != next {
            tracing::debug!(from = %self.state, to = %next, "worker state");
            self.state = next;
        }
    }

    async fn render_frames(
        &mut self,
        active: &mut Option<ActiveSession>,
        sink: &mut dyn PartSink,
    ) -> FramecastResult<()> {
        let part = self.job.part;
        for frame in part.range().iter() {
            if self.cancel.is_cancelled() {
                tracing::info!(%frame, "render aborted");
                return Err(FramecastError::Cancelled);
            }

            let data = self.render_with_recovery(active, frame).await?;
            sink.push_frame(frame, &data).await?;

            self.events.emit(WorkerEvent::Progress {
                frame_index: frame.0 - part.start.0,
            });
            if self.job.config.per_frame_log {
                tracing::info!(%frame, bytes = data.len(), "frame written");
            }
            self.transition(WorkerState::Ready);
        }
        Ok(())
    }

    async fn render_with_recovery(
        &mut self,
        active: &mut Option<ActiveSession>,
        frame: FrameIndex,
    ) -> FramecastResult<Vec<u8>> {
        let budget = self.job.config.num_retries;
        let timeout = self.job.config.frame_timeout();
        let mut attempt = 0u32;

        loop {
            self.attempts += 1;
            let outcome = match tokio::time::timeout(timeout, self.attempt_frame(active, frame)).await
            {
                Ok(res) => res,
                Err(_) => Err(FramecastError::timeout(format!(
                    "frame {frame} did not render within {}ms",
                    timeout.as_millis()
                ))),
            };

            let err = match outcome {
                Ok(data) => return Ok(data),
                Err(e) => e,
            };
            if !err.is_recoverable() {
                return Err(err);
            }
            if attempt >= budget {
                if budget > 0 {
                    tracing::error!(%frame, "failed to restart session after {budget} attempts");
                }
                return Err(err);
            }
            if self.cancel.is_cancelled() {
                return Err(FramecastError::Cancelled);
            }

            attempt += 1;
            tracing::warn!(%frame, attempt, "restarting session after recoverable error: {err}");
            self.transition(WorkerState::Recovering { attempt });
            if let Some(session) = active.take() {
                session.close().await;
            }
        }
    }

    async fn start_session(&mut self) -> FramecastResult<ActiveSession> {
        self.transition(WorkerState::Starting);
        let opts = LaunchOptions::for_job(&self.job);
        let mut surface = self.launcher.launch(&opts).await?;
        let barrier = FrameCompletionBarrier::new();

        let init = SessionInit::for_job(&self.job);
        if let Err(e) = surface.session.initialize(&init, barrier.clone()).await {
            surface.session.close().await;
            return Err(e);
        }
        self.transition(WorkerState::Ready);
        Ok(ActiveSession { surface, barrier })
    }

    async fn attempt_frame(
        &mut self,
        active: &mut Option<ActiveSession>,
        frame: FrameIndex,
    ) -> FramecastResult<Vec<u8>> {
        if active.is_none() {
            *active = Some(self.start_session().await?);
        }
        let Some(ActiveSession { surface, barrier }) = active.as_mut() else {
            return Err(FramecastError::worker("render session vanished after start"));
        };

        self.transition(WorkerState::RenderingFrame(frame));
        self.generation += 1;
        let generation = Generation(self.generation);
        let fail_on_content_errors = self.job.config.fail_on_web_errors;

        let LaunchedSurface {
            session,
            capturer,
            faults,
        } = surface;

        let steps = async {
            let failures = barrier
                .trigger_and_await(generation, session.render_frame(frame))
                .await?;
            if !failures.is_empty() {
                let summary = summarize(&failures);
                if fail_on_content_errors {
                    return Err(FramecastError::content(format!("frame {frame}: {summary}")));
                }
                tracing::warn!(%frame, "ignoring content errors: {summary}");
            }
            session.await_settled(frame).await?;
            capturer.capture(frame).await
        };

        tokio::select! {
            biased;
            fault = next_fault(faults) => Err(fault.into()),
            res = steps => res,
        }
    }
}

/// Pending forever once the session dropped its fault sender.
async fn next_fault(faults: &mut mpsc::UnboundedReceiver<SessionFault>) -> SessionFault {
    match faults.recv().await {
        Some(fault) => fault,
        None => std::future::pending().await,
    }
}

fn summarize(failures: &[SubtaskFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.label, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
#[path = "../../tests/unit/render/worker.rs"]
mod tests;
