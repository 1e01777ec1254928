//! Line-delimited JSON protocol between the render supervisor and worker processes.
//!
//! The supervisor writes [`SupervisorMessage`]s to the worker's stdin. The worker
//! writes [`WorkerMessage`]s to its stdout: any number of events, then exactly one
//! outcome.

use std::{fmt::Write as _, future::Future, path::PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt as _, AsyncRead, AsyncWrite, AsyncWriteExt as _, BufReader},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::Context;

use crate::{
    foundation::error::{FramecastError, FramecastResult, SessionFault},
    render::{
        config::RenderJob,
        pool::{PartEvent, PartEvents},
    },
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum WorkerEvent {
    Progress {
        /// Offset of the written frame within its part.
        #[serde(rename = "frameIndex")]
        frame_index: u64,
    },
    Log {
        level: String,
        message: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Session,
    Timeout,
    Content,
    Busy,
    Process,
    Worker,
    Cancelled,
    Verification,
    Serde,
    Other,
}

/// A [`FramecastError`] flattened for the wire. Keeps the error class so the
/// supervisor can tell cancellations and recoverable faults apart.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<SessionFault>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<u64>,
}

impl WireError {
    pub fn from_error(err: &FramecastError) -> Self {
        let (kind, message) = match err {
            FramecastError::Validation(m) => (ErrorKind::Validation, m.clone()),
            FramecastError::Session(f) => (ErrorKind::Session, f.to_string()),
            FramecastError::Timeout(m) => (ErrorKind::Timeout, m.clone()),
            FramecastError::Content(m) => (ErrorKind::Content, m.clone()),
            FramecastError::Busy(m) => (ErrorKind::Busy, m.clone()),
            FramecastError::Process(m) => (ErrorKind::Process, m.clone()),
            FramecastError::Demux(e) => (ErrorKind::Process, e.to_string()),
            FramecastError::Worker(m) => (ErrorKind::Worker, m.clone()),
            FramecastError::Cancelled => (ErrorKind::Cancelled, err.to_string()),
            FramecastError::Verification { .. } => (ErrorKind::Verification, err.to_string()),
            FramecastError::Serde(m) => (ErrorKind::Serde, m.clone()),
            FramecastError::Other(e) => (ErrorKind::Other, format!("{e:#}")),
        };
        let (expected, actual) = match err {
            FramecastError::Verification { expected, actual } => (Some(*expected), Some(*actual)),
            _ => (None, None),
        };
        Self {
            kind,
            message,
            fault: match err {
                FramecastError::Session(f) => Some(f.clone()),
                _ => None,
            },
            expected,
            actual,
        }
    }

    pub fn into_error(self) -> FramecastError {
        match self.kind {
            ErrorKind::Validation => FramecastError::Validation(self.message),
            ErrorKind::Session => match self.fault {
                Some(fault) => FramecastError::Session(fault),
                None => FramecastError::Session(SessionFault::Script(self.message)),
            },
            ErrorKind::Timeout => FramecastError::Timeout(self.message),
            ErrorKind::Content => FramecastError::Content(self.message),
            ErrorKind::Busy => FramecastError::Busy(self.message),
            ErrorKind::Process => FramecastError::Process(self.message),
            ErrorKind::Worker => FramecastError::Worker(self.message),
            ErrorKind::Cancelled => FramecastError::Cancelled,
            ErrorKind::Verification => match (self.expected, self.actual) {
                (Some(expected), Some(actual)) => FramecastError::Verification { expected, actual },
                _ => FramecastError::Worker(self.message),
            },
            ErrorKind::Serde => FramecastError::Serde(self.message),
            ErrorKind::Other => FramecastError::Other(anyhow::anyhow!(self.message)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PartOutcome {
    Done {
        #[serde(rename = "outputPath")]
        output_path: PathBuf,
    },
    Failed(WireError),
}

impl PartOutcome {
    pub fn from_result(res: &FramecastResult<PathBuf>) -> Self {
        match res {
            Ok(path) => Self::Done {
                output_path: path.clone(),
            },
            Err(e) => Self::Failed(WireError::from_error(e)),
        }
    }

    pub fn into_result(self) -> FramecastResult<PathBuf> {
        match self {
            Self::Done { output_path } => Ok(output_path),
            Self::Failed(e) => Err(e.into_error()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerMessage {
    Event(WorkerEvent),
    Outcome(PartOutcome),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum SupervisorMessage {
    RenderPart { job: Box<RenderJob> },
    Cancel,
}

pub async fn write_line<W, T>(out: &mut W, msg: &T) -> FramecastResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(msg).map_err(|e| FramecastError::serde(e.to_string()))?;
    line.push(b'\n');
    out.write_all(&line).await.context("write ipc message")?;
    out.flush().await.context("flush ipc message")?;
    Ok(())
}

enum Outgoing {
    Message(WorkerMessage),
    Flush(oneshot::Sender<()>),
}

/// Serializes worker messages onto one writer from any thread, including from
/// inside the tracing layer.
#[derive(Clone, Debug)]
pub struct IpcSender {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl IpcSender {
    pub fn spawn_writer<W>(mut out: W) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    Outgoing::Message(msg) => {
                        if let Err(e) = write_line(&mut out, &msg).await {
                            eprintln!("framecast worker: ipc write failed: {e}");
                            return;
                        }
                    }
                    Outgoing::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        (Self { tx }, task)
    }

    pub fn send(&self, msg: WorkerMessage) {
        // A closed channel means the writer already gave up on a broken pipe.
        let _ = self.tx.send(Outgoing::Message(msg));
    }

    /// Resolves once every message sent before it was written.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Outgoing::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

/// Forwards every tracing event of a worker process to the supervisor as a log event.
pub struct IpcLogLayer {
    ipc: IpcSender,
}

impl IpcLogLayer {
    pub fn new(ipc: IpcSender) -> Self {
        Self { ipc }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={value}", field.name());
        }
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for IpcLogLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let level = event.metadata().level().as_str().to_ascii_lowercase();
        self.ipc.send(WorkerMessage::Event(WorkerEvent::Log {
            level,
            message: format!("{}{}", visitor.message, visitor.fields),
        }));
    }
}

/// Worker-process side: reads one job from `input`, renders it and reports the outcome.
///
/// A `cancel` command, or `input` closing, aborts the render at the next frame boundary.
pub async fn serve_worker<R, F, Fut>(input: R, ipc: IpcSender, render: F) -> FramecastResult<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: FnOnce(RenderJob, PartEvents, CancellationToken) -> Fut,
    Fut: Future<Output = FramecastResult<PathBuf>>,
{
    let mut lines = BufReader::new(input).lines();
    let first = lines
        .next_line()
        .await
        .context("read supervisor command")?
        .ok_or_else(|| FramecastError::worker("supervisor closed the channel before sending a job"))?;
    let job = match serde_json::from_str::<SupervisorMessage>(&first)
        .map_err(|e| FramecastError::serde(format!("supervisor command: {e}")))?
    {
        SupervisorMessage::RenderPart { job } => *job,
        SupervisorMessage::Cancel => {
            ipc.send(WorkerMessage::Outcome(PartOutcome::from_result(&Err(
                FramecastError::Cancelled,
            ))));
            ipc.flush().await;
            return Ok(());
        }
    };

    let cancel = CancellationToken::new();
    let watcher = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match serde_json::from_str::<SupervisorMessage>(&line) {
                        Ok(SupervisorMessage::Cancel) => {
                            tracing::debug!("cancel requested by supervisor");
                            cancel.cancel();
                        }
                        Ok(SupervisorMessage::RenderPart { .. }) => {
                            tracing::warn!("ignoring second render request");
                        }
                        Err(e) => tracing::warn!("unparseable supervisor command: {e}"),
                    },
                    Ok(None) | Err(_) => {
                        cancel.cancel();
                        return;
                    }
                }
            }
        }
    });

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<PartEvent>();
    let forwarder = tokio::spawn({
        let ipc = ipc.clone();
        async move {
            while let Some(ev) = events_rx.recv().await {
                ipc.send(WorkerMessage::Event(ev.event));
            }
        }
    });

    let part = job.part.index;
    let result = render(job, PartEvents::new(part, events_tx), cancel).await;
    // Events emitted before the outcome must be written before it.
    let _ = forwarder.await;
    watcher.abort();

    ipc.send(WorkerMessage::Outcome(PartOutcome::from_result(&result)));
    ipc.flush().await;
    Ok(())
}

#[cfg(test)]
#[path = "../../tests/unit/render/ipc.rs"]
mod tests;
