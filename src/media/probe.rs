use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::foundation::error::{FramecastError, FramecastResult};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoStreamInfo {
    pub width: u32,
    pub height: u32,
    /// `None` when the container reports no average frame rate.
    pub fps: Option<f64>,
    pub duration_secs: Option<f64>,
}

#[tracing::instrument(skip(ffprobe, path), fields(path = %path.display()))]
pub async fn probe_video(
    ffprobe: &Path,
    path: &Path,
    stream_index: u32,
) -> FramecastResult<VideoStreamInfo> {
    let out = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            &format!("v:{stream_index}"),
            "-show_entries",
            "stream=width,height,avg_frame_rate,duration",
            "-show_entries",
            "format=duration",
            "-of",
            "json",
        ])
        .arg(path)
        .output()
        .await
        .map_err(|e| FramecastError::process(format!("failed to run ffprobe: {e}")))?;
    if !out.status.success() {
        return Err(FramecastError::process(format!(
            "ffprobe failed for '{}': {}",
            path.display(),
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    parse_probe_json(&out.stdout)
}

/// Counts the packets of one video stream; for intra-only intermediates this is the
/// frame count.
#[tracing::instrument(skip(ffprobe, path), fields(path = %path.display()))]
pub async fn count_frames(ffprobe: &Path, path: &Path, stream_index: u32) -> FramecastResult<u64> {
    let out = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            &format!("v:{stream_index}"),
            "-count_packets",
            "-show_entries",
            "stream=nb_read_packets",
            "-of",
            "csv=p=0",
        ])
        .arg(path)
        .output()
        .await
        .map_err(|e| FramecastError::process(format!("failed to run ffprobe: {e}")))?;
    if !out.status.success() {
        return Err(FramecastError::process(format!(
            "ffprobe frame count failed for '{}': {}",
            path.display(),
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    parse_frame_count(&String::from_utf8_lossy(&out.stdout))
}

pub(crate) fn parse_probe_json(bytes: &[u8]) -> FramecastResult<VideoStreamInfo> {
    #[derive(Deserialize)]
    struct ProbeStream {
        width: Option<u32>,
        height: Option<u32>,
        avg_frame_rate: Option<String>,
        duration: Option<String>,
    }
    #[derive(Deserialize)]
    struct ProbeFormat {
        duration: Option<String>,
    }
    #[derive(Deserialize)]
    struct ProbeOut {
        #[serde(default)]
        streams: Vec<ProbeStream>,
        format: Option<ProbeFormat>,
    }

    let parsed: ProbeOut = serde_json::from_slice(bytes)
        .map_err(|e| FramecastError::serde(format!("ffprobe json parse failed: {e}")))?;
    let stream = parsed
        .streams
        .first()
        .ok_or_else(|| FramecastError::process("no matching video stream found"))?;
    let width = stream
        .width
        .ok_or_else(|| FramecastError::process("missing video width from ffprobe"))?;
    let height = stream
        .height
        .ok_or_else(|| FramecastError::process("missing video height from ffprobe"))?;

    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_ff_ratio)
        .map(|(num, den)| f64::from(num) / f64::from(den))
        .filter(|fps| *fps > 0.0);
    let duration_secs = stream
        .duration
        .as_deref()
        .or(parsed.format.as_ref().and_then(|f| f.duration.as_deref()))
        .and_then(|s| s.parse::<f64>().ok());

    Ok(VideoStreamInfo {
        width,
        height,
        fps,
        duration_secs,
    })
}

pub(crate) fn parse_frame_count(stdout: &str) -> FramecastResult<u64> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty());
    line.and_then(|l| l.trim_end_matches(',').parse::<u64>().ok())
        .ok_or_else(|| {
            FramecastError::process(format!(
                "unexpected ffprobe packet count output: '{}'",
                stdout.trim()
            ))
        })
}

fn parse_ff_ratio(s: &str) -> Option<(u32, u32)> {
    let mut parts = s.split('/');
    let a = parts.next()?.parse::<u32>().ok()?;
    let b = parts.next()?.parse::<u32>().ok()?;
    if b == 0 {
        return None;
    }
    Some((a, b))
}

#[cfg(test)]
#[path = "../../tests/unit/media/probe.rs"]
mod tests;
