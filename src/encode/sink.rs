use std::{
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;

use crate::foundation::{core::FrameIndex, error::FramecastResult};

/// Consumer of one part's captured frames.
///
/// Ordering contract: `push_frame` is called in strictly increasing `FrameIndex` order within the
/// part. `finish` is only called after every frame was accepted; `abort` replaces it on failure.
#[async_trait]
pub trait PartSink: Send {
    async fn push_frame(&mut self, idx: FrameIndex, data: &[u8]) -> FramecastResult<()>;
    async fn finish(self: Box<Self>) -> FramecastResult<PathBuf>;
    async fn abort(self: Box<Self>);
}

/// Shared view of the frames an [`InMemorySink`] received.
pub type CapturedFrames = Arc<Mutex<Vec<(FrameIndex, Vec<u8>)>>>;

/// In-memory sink for tests and debugging.
#[derive(Debug, Default)]
pub struct InMemorySink {
    out_path: PathBuf,
    frames: CapturedFrames,
}

impl InMemorySink {
    pub fn new(out_path: impl Into<PathBuf>) -> Self {
        Self {
            out_path: out_path.into(),
            frames: CapturedFrames::default(),
        }
    }

    pub fn frames(&self) -> CapturedFrames {
        Arc::clone(&self.frames)
    }
}

#[async_trait]
impl PartSink for InMemorySink {
    async fn push_frame(&mut self, idx: FrameIndex, data: &[u8]) -> FramecastResult<()> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((idx, data.to_vec()));
        Ok(())
    }

    async fn finish(self: Box<Self>) -> FramecastResult<PathBuf> {
        Ok(self.out_path)
    }

    async fn abort(self: Box<Self>) {}
}
