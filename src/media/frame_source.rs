//! On-demand frame extraction from source media.
//!
//! One decoder subprocess per parameter set is kept alive while requests walk
//! forward one frame at a time; any other access pattern restarts it at the new
//! position.

use std::{
    collections::HashMap,
    path::PathBuf,
    process::Stdio,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};
use tokio::{
    io::AsyncRead,
    process::{Child, Command},
};

use crate::{
    encode::ffmpeg::forward_stderr,
    foundation::{
        core::{Canvas, FrameIndex},
        error::{FramecastError, FramecastResult},
    },
    media::{
        demux::{SplitMode, StreamDemuxer},
        fingerprint::{DecodeFingerprint, fingerprint_request},
    },
};

pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
pub const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum StreamFormat {
    /// Uncompressed RGBA, exactly `width * height * 4` bytes per frame.
    Raw,
    Png,
    #[default]
    Jpeg,
}

impl StreamFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Png => "png",
            Self::Jpeg => "jpeg",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Raw => "application/octet-stream",
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameRequest {
    pub source: String,
    pub width: u32,
    pub height: u32,
    pub scale: bool,
    /// Frame rate of the timeline the frame is requested for.
    pub fps: f64,
    /// Frame rate of the source media.
    pub file_fps: f64,
    pub stream_index: u32,
    pub format: StreamFormat,
    pub quality: u8,
    /// Owner of the decoder. Parts rendering concurrently never share one.
    #[serde(default)]
    pub render_id: Option<u64>,
    pub time: f64,
}

impl FrameRequest {
    pub fn validate(&self) -> FramecastResult<()> {
        if self.source.is_empty() {
            return Err(FramecastError::validation("frame source must not be empty"));
        }
        Canvas {
            width: self.width,
            height: self.height,
        }
        .validate()?;
        for (name, v) in [("fps", self.fps), ("fileFps", self.file_fps)] {
            if !(v.is_finite() && v > 0.0) {
                return Err(FramecastError::validation(format!(
                    "{name} must be a positive number, got {v}"
                )));
            }
        }
        if !(self.time.is_finite() && self.time >= 0.0) {
            return Err(FramecastError::validation(format!(
                "time must be a non-negative number, got {}",
                self.time
            )));
        }
        if !(1..=100).contains(&self.quality) {
            return Err(FramecastError::validation("quality must be within 1..=100"));
        }
        Ok(())
    }

    pub fn frame_index(&self) -> FrameIndex {
        FrameIndex((self.time * self.fps).round().max(0.0) as u64)
    }

    pub fn split_mode(&self) -> SplitMode {
        match self.format {
            StreamFormat::Raw => SplitMode::Length(self.width as usize * self.height as usize * 4),
            StreamFormat::Jpeg => SplitMode::Delimiter(JPEG_SOI.to_vec()),
            StreamFormat::Png => SplitMode::Delimiter(PNG_SIGNATURE.to_vec()),
        }
    }

    /// Seek target for a fresh decoder. Backs off a tenth of a source frame so a seek
    /// rounded up by the demuxer still lands on the requested frame.
    pub fn seek_secs(&self) -> f64 {
        (self.time - 0.1 / self.file_fps).max(0.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameBuffer {
    pub data: Vec<u8>,
    pub encoding: StreamFormat,
    pub frame: FrameIndex,
}

/// Maps a 1..=100 quality to ffmpeg's mjpeg `-q:v` scale (2 best, 31 worst).
pub fn jpeg_qscale(quality: u8) -> u8 {
    let q = 2.0 + (29.0 * (100.0 - f64::from(quality.min(100)))) / 100.0;
    (q.round() as u8).clamp(2, 31)
}

pub fn decoder_args(req: &FrameRequest, seek_secs: f64) -> Vec<String> {
    let mut filter = format!("fps={}", req.fps);
    if req.scale {
        filter.push_str(&format!(",scale={}:{}", req.width, req.height));
    }

    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-ss".into(),
        seek_secs.to_string(),
        "-noautorotate".into(),
        "-i".into(),
        req.source.clone(),
        "-an".into(),
        "-vf".into(),
        filter,
        "-map".into(),
        format!("0:v:{}", req.stream_index),
    ];
    match req.format {
        StreamFormat::Raw => {
            args.extend(["-pix_fmt", "rgba", "-vcodec", "rawvideo"].map(String::from));
        }
        StreamFormat::Png => {
            args.extend(["-pix_fmt", "rgba", "-vcodec", "png"].map(String::from));
        }
        StreamFormat::Jpeg => {
            args.push("-q:v".into());
            args.push(jpeg_qscale(req.quality).to_string());
            args.extend(["-pix_fmt", "rgba", "-vcodec", "mjpeg"].map(String::from));
        }
    }
    args.extend(["-f", "image2pipe", "-"].map(String::from));
    args
}

pub struct DecodeProcess {
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// `None` for in-memory sources.
    pub child: Option<Child>,
}

pub trait DecodeLauncher: Send + Sync {
    fn launch(&self, req: &FrameRequest, seek_secs: f64) -> FramecastResult<DecodeProcess>;
}

#[derive(Clone, Debug)]
pub struct FfmpegDecodeLauncher {
    pub ffmpeg: PathBuf,
    pub log_stderr: bool,
}

impl DecodeLauncher for FfmpegDecodeLauncher {
    fn launch(&self, req: &FrameRequest, seek_secs: f64) -> FramecastResult<DecodeProcess> {
        let args = decoder_args(req, seek_secs);
        tracing::debug!(ffmpeg = %self.ffmpeg.display(), args = ?args, "spawning decoder");

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(if self.log_stderr {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            FramecastError::process(format!(
                "failed to spawn decoder '{}': {e}",
                self.ffmpeg.display()
            ))
        })?;
        if self.log_stderr {
            let _ = forward_stderr(&mut child, format!("decode {}", req.source), true);
        }
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FramecastError::process("failed to open decoder stdout (unexpected)"))?;

        Ok(DecodeProcess {
            stdout: Box::new(stdout),
            child: Some(child),
        })
    }
}

struct DecodeEntry {
    id: u64,
    process: Option<Child>,
    demuxer: Arc<StreamDemuxer>,
    cursor_time: f64,
    busy: bool,
}

impl Drop for DecodeEntry {
    fn drop(&mut self) {
        if let Some(child) = self.process.as_mut() {
            // Already-exited children report an error here; nothing to do about it.
            let _ = child.start_kill();
        }
    }
}

#[derive(Default)]
struct Entries {
    by_fingerprint: HashMap<DecodeFingerprint, DecodeEntry>,
    next_id: u64,
}

/// Decoder subprocess table shared by every frame request of one render.
///
/// Callers must not overlap two reads with the same parameters: the second one
/// fails with [`FramecastError::Busy`] instead of waiting.
pub struct FrameSourceCache {
    launcher: Arc<dyn DecodeLauncher>,
    entries: Mutex<Entries>,
}

impl FrameSourceCache {
    pub fn new(launcher: Arc<dyn DecodeLauncher>) -> Self {
        Self {
            launcher,
            entries: Mutex::new(Entries::default()),
        }
    }

    pub async fn get_frame(&self, req: &FrameRequest) -> FramecastResult<FrameBuffer> {
        req.validate()?;
        let key = fingerprint_request(req);
        let (id, demuxer) = self.checkout(&key, req)?;

        let mut guard = Checkout {
            cache: self,
            key,
            id,
            frame_duration: 1.0 / req.fps,
            succeeded: false,
        };
        let data = read_next_frame(&demuxer, req).await.inspect_err(|e| {
            tracing::warn!(source = %req.source, time = req.time, "frame read failed: {e}");
        })?;
        guard.succeeded = true;

        Ok(FrameBuffer {
            data,
            encoding: req.format,
            frame: req.frame_index(),
        })
    }

    pub fn live_decoders(&self) -> usize {
        self.lock().by_fingerprint.len()
    }

    /// Kills every decoder subprocess.
    pub fn cleanup_all(&self) {
        let drained = self.lock().by_fingerprint.drain().collect::<Vec<_>>();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "killing decoder processes");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn checkout(
        &self,
        key: &DecodeFingerprint,
        req: &FrameRequest,
    ) -> FramecastResult<(u64, Arc<StreamDemuxer>)> {
        let mut entries = self.lock();

        if let Some(entry) = entries.by_fingerprint.get_mut(key) {
            if entry.busy {
                return Err(FramecastError::busy(format!(
                    "still processing previous frame of '{}'",
                    req.source
                )));
            }
            if (entry.cursor_time - req.time).abs() < 0.5 / req.fps {
                entry.busy = true;
                entry.cursor_time = req.time;
                return Ok((entry.id, Arc::clone(&entry.demuxer)));
            }
            tracing::debug!(
                source = %req.source,
                cursor = entry.cursor_time,
                requested = req.time,
                "decoder position mismatch, restarting"
            );
        }
        entries.by_fingerprint.remove(key);

        let seek = req.seek_secs();
        let DecodeProcess { stdout, child } = self.launcher.launch(req, seek)?;
        let demuxer = Arc::new(StreamDemuxer::new(stdout, req.split_mode())?);

        entries.next_id += 1;
        let id = entries.next_id;
        entries.by_fingerprint.insert(
            key.clone(),
            DecodeEntry {
                id,
                process: child,
                demuxer: Arc::clone(&demuxer),
                cursor_time: req.time,
                busy: true,
            },
        );
        Ok((id, demuxer))
    }
}

/// Clears the busy flag on success. Any other exit, including cancellation of the
/// request future, drops the entry because the decoder position is unknown.
struct Checkout<'a> {
    cache: &'a FrameSourceCache,
    key: DecodeFingerprint,
    id: u64,
    frame_duration: f64,
    succeeded: bool,
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        let mut entries = self.cache.lock();
        let Some(entry) = entries.by_fingerprint.get_mut(&self.key) else {
            return;
        };
        if entry.id != self.id {
            return;
        }
        if self.succeeded {
            entry.busy = false;
            entry.cursor_time += self.frame_duration;
        } else {
            entries.by_fingerprint.remove(&self.key);
        }
    }
}

async fn read_next_frame(demuxer: &StreamDemuxer, req: &FrameRequest) -> FramecastResult<Vec<u8>> {
    let data = demuxer.next_split().await?.read_to_end().await?;
    if req.format == StreamFormat::Raw {
        let expected = req.width as usize * req.height as usize * 4;
        if data.len() != expected {
            return Err(FramecastError::process(format!(
                "decoder produced a short raw frame ({} of {expected} bytes)",
                data.len()
            )));
        }
    }
    Ok(data)
}

#[cfg(test)]
#[path = "../../tests/unit/media/frame_source.rs"]
mod tests;
