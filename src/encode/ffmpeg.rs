use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader},
    process::{Child, ChildStdin, Command},
    task::JoinHandle,
};

use crate::{
    encode::sink::PartSink,
    foundation::{
        core::{Fps, FrameIndex},
        error::{FramecastError, FramecastResult},
    },
    render::config::CaptureFormat,
};

const STDERR_TAIL_LINES: usize = 20;

#[derive(Clone, Debug)]
pub struct PartEncoderConfig {
    pub ffmpeg: PathBuf,
    pub fps: Fps,
    pub format: CaptureFormat,
    pub out_path: PathBuf,
    /// Output arguments placed before `-y <out>`; `-c copy` when unset.
    pub output_args: Option<Vec<String>>,
    pub log_stderr: bool,
}

impl PartEncoderConfig {
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-f".into(),
            "image2pipe".into(),
            "-r".into(),
            self.fps.to_string(),
            "-c:v".into(),
            self.format.ffmpeg_codec().into(),
            "-i".into(),
            "-".into(),
        ];
        match &self.output_args {
            Some(custom) => args.extend(custom.iter().cloned()),
            None => args.extend(["-c", "copy"].map(String::from)),
        }
        args.push("-y".into());
        args.push(self.out_path.to_string_lossy().into_owned());
        args
    }
}

pub fn is_ffmpeg_on_path(ffmpeg: &Path) -> bool {
    std::process::Command::new(ffmpeg)
        .arg("-version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

pub fn ensure_parent_dir(path: &Path) -> FramecastResult<()> {
    if let Some(parent) = path.parent() {
        use anyhow::Context as _;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory '{}'", parent.display()))?;
    }
    Ok(())
}

/// Drains a child's stderr line by line, logging at debug level when `log` is set.
/// The handle resolves to the last few lines for error reports.
pub(crate) fn forward_stderr(
    child: &mut Child,
    label: String,
    log: bool,
) -> Option<JoinHandle<Vec<String>>> {
    let stderr = child.stderr.take()?;
    Some(tokio::spawn(async move {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if log {
                tracing::debug!(target: "framecast::ffmpeg", "[{label}] {line}");
            }
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        Vec::from(tail)
    }))
}

/// Encoder subprocess for one part, fed compressed frames on stdin.
pub struct PartEncoder {
    cfg: PartEncoderConfig,
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_tail: Option<JoinHandle<Vec<String>>>,
}

impl PartEncoder {
    pub fn spawn(cfg: PartEncoderConfig) -> FramecastResult<Self> {
        ensure_parent_dir(&cfg.out_path)?;

        let args = cfg.args();
        tracing::debug!(ffmpeg = %cfg.ffmpeg.display(), args = ?args, "spawning part encoder");

        let mut child = Command::new(&cfg.ffmpeg)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                FramecastError::process(format!(
                    "failed to spawn '{}' (is it installed and on PATH?): {e}",
                    cfg.ffmpeg.display()
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| FramecastError::process("failed to open ffmpeg stdin (unexpected)"))?;
        let stderr_tail = forward_stderr(
            &mut child,
            format!("encode {}", cfg.out_path.display()),
            cfg.log_stderr,
        );

        Ok(Self {
            cfg,
            child,
            stdin: Some(stdin),
            stderr_tail,
        })
    }

    async fn stderr_tail(&mut self) -> String {
        match self.stderr_tail.take() {
            Some(handle) => handle.await.unwrap_or_default().join("\n"),
            None => String::new(),
        }
    }
}

#[async_trait]
impl PartSink for PartEncoder {
    async fn push_frame(&mut self, idx: FrameIndex, data: &[u8]) -> FramecastResult<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(FramecastError::process("part encoder is already finalized"));
        };
        // Completes only once the pipe accepted every byte.
        stdin.write_all(data).await.map_err(|e| {
            FramecastError::process(format!("failed to write frame {idx} to ffmpeg stdin: {e}"))
        })?;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> FramecastResult<PathBuf> {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }

        let status = self.child.wait().await.map_err(|e| {
            FramecastError::process(format!("failed to wait for ffmpeg to finish: {e}"))
        })?;
        let tail = self.stderr_tail().await;

        if !status.success() {
            return Err(FramecastError::process(format!(
                "ffmpeg exited with status {status}: {}",
                tail.trim()
            )));
        }
        Ok(self.cfg.out_path.clone())
    }

    async fn abort(mut self: Box<Self>) {
        drop(self.stdin.take());
        if let Err(e) = self.child.start_kill() {
            tracing::debug!("part encoder already exited: {e}");
        }
        let _ = self.child.wait().await;
    }
}

#[cfg(test)]
#[path = "../../tests/unit/encode/ffmpeg.rs"]
mod tests;
