use serde::{Deserialize, Serialize};

use crate::media::demux::DemuxError;

pub type FramecastResult<T> = Result<T, FramecastError>;

/// Fatal conditions raised by a content-rendering session.
///
/// Every variant is recoverable: the render worker tears the session down and
/// recreates it while it still has retry budget.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "fault", content = "detail", rename_all = "snake_case")]
pub enum SessionFault {
    #[error("uncaught script error: {0}")]
    Script(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("unable to capture frame: {0}")]
    Capture(String),
}

#[derive(thiserror::Error, Debug)]
pub enum FramecastError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("session fault: {0}")]
    Session(SessionFault),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("content error: {0}")]
    Content(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error(transparent)]
    Demux(#[from] DemuxError),

    #[error("process error: {0}")]
    Process(String),

    #[error("worker error: {0}")]
    Worker(String),

    #[error("render cancelled")]
    Cancelled,

    #[error("frame count mismatch: expected {expected} frames, found {actual}")]
    Verification { expected: u64, actual: u64 },

    #[error("serialization error: {0}")]
    Serde(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FramecastError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn content(msg: impl Into<String>) -> Self {
        Self::Content(msg.into())
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        Self::Busy(msg.into())
    }

    pub fn process(msg: impl Into<String>) -> Self {
        Self::Process(msg.into())
    }

    pub fn worker(msg: impl Into<String>) -> Self {
        Self::Worker(msg.into())
    }

    pub fn serde(msg: impl Into<String>) -> Self {
        Self::Serde(msg.into())
    }

    /// Session faults and per-step timeouts are retried by recreating the session;
    /// everything else fails the part immediately.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Session(_) | Self::Timeout(_))
    }
}

impl From<SessionFault> for FramecastError {
    fn from(fault: SessionFault) -> Self {
        Self::Session(fault)
    }
}

#[cfg(test)]
#[path = "../../tests/unit/foundation/error.rs"]
mod tests;
