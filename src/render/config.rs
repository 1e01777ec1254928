use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    foundation::{
        core::{Canvas, Fps},
        error::{FramecastError, FramecastResult},
    },
    media::frame_source::StreamFormat,
    render::planner::Part,
    server::FrameServerHandle,
};

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMethod {
    /// Wait for the painted frame on the session's broadcast stream.
    Screencast,
    /// Ask a capture relay running alongside the session.
    Extension,
    /// Encode the painted canvas directly.
    #[default]
    Screenshot,
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum CaptureFormat {
    #[default]
    Jpeg,
    Png,
}

impl CaptureFormat {
    pub fn ffmpeg_codec(self) -> &'static str {
        match self {
            Self::Jpeg => "mjpeg",
            Self::Png => "png",
        }
    }

    pub fn image_extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
        }
    }
}

/// Configuration snapshot shared by every part of one render.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderConfig {
    /// Scene document loaded by each session.
    pub scene: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: Fps,
    pub duration_frames: u64,
    pub capture_method: CaptureMethod,
    pub capture_format: CaptureFormat,
    pub jpeg_quality: u8,
    /// Encoding requested from the frame server for video layers.
    pub stream_format: StreamFormat,
    pub num_retries: u32,
    pub frame_render_timeout_ms: u64,
    pub fail_on_web_errors: bool,
    pub settle_delay_ms: u64,
    pub temp_dir: PathBuf,
    pub ffmpeg: PathBuf,
    /// Replaces the per-part `-c copy` output arguments.
    pub output_ffmpeg_args: Option<Vec<String>>,
    pub user_data: serde_json::Value,
    pub frame_server: Option<FrameServerHandle>,
    pub per_frame_log: bool,
    pub ffmpeg_log: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            scene: PathBuf::new(),
            width: 800,
            height: 600,
            fps: Fps::default(),
            duration_frames: 1,
            capture_method: CaptureMethod::default(),
            capture_format: CaptureFormat::default(),
            jpeg_quality: 90,
            stream_format: StreamFormat::default(),
            num_retries: 3,
            frame_render_timeout_ms: 30_000,
            fail_on_web_errors: true,
            settle_delay_ms: 0,
            temp_dir: PathBuf::from("framecast-tmp"),
            ffmpeg: PathBuf::from("ffmpeg"),
            output_ffmpeg_args: None,
            user_data: serde_json::Value::Null,
            frame_server: None,
            per_frame_log: false,
            ffmpeg_log: false,
        }
    }
}

impl RenderConfig {
    pub fn validate(&self) -> FramecastResult<()> {
        self.canvas().validate()?;
        Fps::new(self.fps.num, self.fps.den)?;
        if self.duration_frames == 0 {
            return Err(FramecastError::validation(
                "duration must be at least one frame",
            ));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(FramecastError::validation(
                "jpeg quality must be within 1..=100",
            ));
        }
        if self.frame_render_timeout_ms == 0 {
            return Err(FramecastError::validation(
                "frame render timeout must be non-zero",
            ));
        }
        Ok(())
    }

    pub fn canvas(&self) -> Canvas {
        Canvas {
            width: self.width,
            height: self.height,
        }
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_render_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// One part plus the configuration it renders with. Immutable once dispatched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderJob {
    pub part: Part,
    pub config: RenderConfig,
}

impl RenderJob {
    pub fn output_path(&self) -> PathBuf {
        self.config.temp_dir.join(format!(
            "part {}-{}-{}.mkv",
            self.part.index, self.part.start, self.part.end
        ))
    }

    pub fn profile_dir(&self) -> PathBuf {
        self.config
            .temp_dir
            .join(format!("profile-part-{}", self.part.index))
    }
}

#[cfg(test)]
#[path = "../../tests/unit/render/config.rs"]
mod tests;
