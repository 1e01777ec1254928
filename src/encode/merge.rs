use std::path::{Path, PathBuf};

use anyhow::Context as _;
use tokio::process::Command;

use crate::{
    encode::ffmpeg::ensure_parent_dir,
    foundation::error::{FramecastError, FramecastResult},
};

#[derive(Clone, Debug)]
pub struct MergeConfig {
    pub ffmpeg: PathBuf,
    pub manifest_path: PathBuf,
    pub out_path: PathBuf,
    /// Stream-copy the parts instead of re-encoding to H.264.
    pub remux_only: bool,
}

impl MergeConfig {
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "-f",
            "concat",
            "-safe",
            "0",
            "-protocol_whitelist",
            "file,pipe",
            "-i",
        ]
        .map(String::from)
        .into();
        args.push(self.manifest_path.to_string_lossy().into_owned());
        args.extend(["-threads", "0"].map(String::from));
        if self.remux_only {
            args.extend(["-c", "copy"].map(String::from));
        } else {
            args.extend(["-c:v", "libx264", "-crf", "17", "-preset:v", "ultrafast"].map(String::from));
        }
        args.extend(["-movflags", "+faststart", "-y"].map(String::from));
        args.push(self.out_path.to_string_lossy().into_owned());
        args
    }
}

/// One `file '<path>'` line; single quotes are closed, escaped and reopened.
pub fn manifest_line(path: &Path) -> String {
    format!("file '{}'", path.to_string_lossy().replace('\'', r"'\''"))
}

/// Manifest in part order. Paths are made absolute because the concat demuxer
/// resolves relative entries against the manifest's own directory.
pub fn concat_manifest(parts: &[PathBuf]) -> FramecastResult<String> {
    let mut out = String::new();
    for part in parts {
        let abs = std::path::absolute(part)
            .with_context(|| format!("failed to resolve part path '{}'", part.display()))?;
        out.push_str(&manifest_line(&abs));
        out.push('\n');
    }
    Ok(out)
}

#[tracing::instrument(skip_all, fields(out = %cfg.out_path.display(), parts = parts.len()))]
pub async fn merge_parts(cfg: &MergeConfig, parts: &[PathBuf]) -> FramecastResult<PathBuf> {
    if parts.is_empty() {
        return Err(FramecastError::validation("nothing to merge"));
    }
    ensure_parent_dir(&cfg.out_path)?;

    let manifest = concat_manifest(parts)?;
    tokio::fs::write(&cfg.manifest_path, manifest)
        .await
        .with_context(|| format!("failed to write '{}'", cfg.manifest_path.display()))?;

    let args = cfg.args();
    tracing::debug!(args = ?args, "concatenating parts");
    let out = Command::new(&cfg.ffmpeg)
        .args(&args)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| FramecastError::process(format!("failed to run ffmpeg concat: {e}")))?;
    if !out.status.success() {
        return Err(FramecastError::process(format!(
            "ffmpeg concat exited with status {}: {}",
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }

    tracing::info!("merged {} parts", parts.len());
    Ok(cfg.out_path.clone())
}

#[cfg(test)]
#[path = "../../tests/unit/encode/merge.rs"]
mod tests;
