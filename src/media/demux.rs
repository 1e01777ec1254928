//! Splits one continuous byte stream into an ordered sequence of sub-streams.
//!
//! A background pump task owns the source. Each sub-stream is a bounded channel of
//! chunks, so a slow consumer stalls the pump (and the process writing the source)
//! instead of buffering without limit.

use std::sync::{Arc, OnceLock};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::{Mutex, mpsc},
    task::JoinHandle,
};

use crate::foundation::error::{FramecastError, FramecastResult};

const READ_CHUNK: usize = 64 * 1024;
const SUBSTREAM_BUFFER: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SplitMode {
    /// Every occurrence of the delimiter starts a new sub-stream, delimiter included.
    Delimiter(Vec<u8>),
    /// Chunks of exactly N bytes; only the last may be shorter.
    Length(usize),
}

/// Terminal demux condition. Once reached, every later request observes it again.
#[derive(thiserror::Error, Clone, Debug)]
pub enum DemuxError {
    #[error("stream has ended")]
    Ended,

    #[error("source read failed: {0}")]
    Source(Arc<std::io::Error>),
}

type Chunk = Result<Vec<u8>, DemuxError>;

pub struct SubStream {
    chunks: mpsc::Receiver<Chunk>,
}

impl SubStream {
    pub async fn next_chunk(&mut self) -> Option<Chunk> {
        self.chunks.recv().await
    }

    pub async fn read_to_end(mut self) -> Result<Vec<u8>, DemuxError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.chunks.recv().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

pub struct StreamDemuxer {
    splits: Mutex<mpsc::Receiver<SubStream>>,
    terminal: Arc<OnceLock<DemuxError>>,
    pump: JoinHandle<()>,
}

impl StreamDemuxer {
    pub fn new<R>(source: R, mode: SplitMode) -> FramecastResult<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        match &mode {
            SplitMode::Delimiter(d) if d.is_empty() => {
                return Err(FramecastError::validation(
                    "demux delimiter must not be empty",
                ));
            }
            SplitMode::Length(0) => {
                return Err(FramecastError::validation(
                    "demux chunk length must be >= 1",
                ));
            }
            _ => {}
        }

        // Capacity 1: the pump never runs more than one sub-stream ahead of the reader.
        let (splits_tx, splits_rx) = mpsc::channel(1);
        let terminal = Arc::new(OnceLock::new());
        let terminal_slot = Arc::clone(&terminal);

        let pump = tokio::spawn(async move {
            let mut pump = Pump {
                splits: splits_tx,
                current: None,
                current_len: 0,
            };
            let outcome = match mode {
                SplitMode::Delimiter(delimiter) => pump.run_delimited(source, &delimiter).await,
                SplitMode::Length(len) => pump.run_fixed(source, len).await,
            };
            match outcome {
                Ok(()) => {
                    let _ = terminal_slot.set(DemuxError::Ended);
                }
                Err(PumpStop::Source(e)) => {
                    tracing::debug!("demux source failed: {e}");
                    let err = DemuxError::Source(Arc::new(e));
                    let _ = terminal_slot.set(err.clone());
                    pump.fail(err).await;
                }
                Err(PumpStop::Detached) => {}
            }
        });

        Ok(Self {
            splits: Mutex::new(splits_rx),
            terminal,
            pump,
        })
    }

    /// Waits until the next sub-stream has received its first bytes.
    ///
    /// Concurrent callers are served in order. After the source ends every caller,
    /// waiting or not, gets the terminal error.
    pub async fn next_split(&self) -> Result<SubStream, DemuxError> {
        let mut splits = self.splits.lock().await;
        match splits.recv().await {
            Some(sub) => Ok(sub),
            None => Err(self.terminal.get().cloned().unwrap_or(DemuxError::Ended)),
        }
    }
}

impl Drop for StreamDemuxer {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

enum PumpStop {
    Source(std::io::Error),
    Detached,
}

struct Pump {
    splits: mpsc::Sender<SubStream>,
    current: Option<mpsc::Sender<Chunk>>,
    current_len: usize,
}

impl Pump {
    /// Appends to the current sub-stream, opening one lazily. Empty writes never
    /// create a sub-stream.
    async fn write(&mut self, bytes: &[u8]) -> Result<(), PumpStop> {
        if bytes.is_empty() {
            return Ok(());
        }
        if self.current.is_none() {
            let (tx, rx) = mpsc::channel(SUBSTREAM_BUFFER);
            self.splits
                .send(SubStream { chunks: rx })
                .await
                .map_err(|_| PumpStop::Detached)?;
            self.current = Some(tx);
            self.current_len = 0;
        }
        if let Some(tx) = &self.current {
            // A consumer that dropped its sub-stream early just discards the rest.
            let _ = tx.send(Ok(bytes.to_vec())).await;
        }
        self.current_len += bytes.len();
        Ok(())
    }

    fn end_current(&mut self) {
        self.current = None;
    }

    async fn fail(&mut self, err: DemuxError) {
        if let Some(tx) = self.current.take() {
            let _ = tx.send(Err(err)).await;
        }
    }

    async fn run_delimited<R>(&mut self, mut source: R, delimiter: &[u8]) -> Result<(), PumpStop>
    where
        R: AsyncRead + Unpin,
    {
        let mut pending: Vec<u8> = Vec::new();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = match source.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    self.write(&pending).await?;
                    return Err(PumpStop::Source(e));
                }
            };
            if n == 0 {
                break;
            }
            pending.extend_from_slice(&buf[..n]);

            while let Some(at) = find(&pending, delimiter) {
                self.write(&pending[..at]).await?;
                self.end_current();
                self.write(delimiter).await?;
                pending.drain(..at + delimiter.len());
            }

            let held = partial_delimiter_suffix(&pending, delimiter);
            let flush = pending.len() - held;
            self.write(&pending[..flush]).await?;
            pending.drain(..flush);
        }
        // A trailing partial delimiter is ordinary data.
        self.write(&pending).await
    }

    async fn run_fixed<R>(&mut self, mut source: R, len: usize) -> Result<(), PumpStop>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = source.read(&mut buf).await.map_err(PumpStop::Source)?;
            if n == 0 {
                return Ok(());
            }
            let mut rest = &buf[..n];
            while !rest.is_empty() {
                let room = if self.current.is_some() {
                    len - self.current_len
                } else {
                    len
                };
                let take = room.min(rest.len());
                self.write(&rest[..take]).await?;
                rest = &rest[take..];
                if self.current_len == len {
                    self.end_current();
                }
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Length of the longest tail of `buf` that is a proper prefix of `delimiter`.
fn partial_delimiter_suffix(buf: &[u8], delimiter: &[u8]) -> usize {
    let max = buf.len().min(delimiter.len() - 1);
    (1..=max)
        .rev()
        .find(|&k| buf[buf.len() - k..] == delimiter[..k])
        .unwrap_or(0)
}

#[cfg(test)]
#[path = "../../tests/unit/media/demux.rs"]
mod tests;
