use std::path::Path;

use anyhow::Context;
use image::{Rgba, RgbaImage, imageops};
use serde::{Deserialize, Serialize};

use crate::{
    foundation::{
        core::{Canvas, FrameIndex},
        error::{FramecastError, FramecastResult},
    },
    media::frame_source::StreamFormat,
};

/// Scene document rendered by the built-in surface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Scene {
    #[serde(default = "default_background")]
    pub background: [u8; 4],
    #[serde(default)]
    pub layers: Vec<Layer>,
}

fn default_background() -> [u8; 4] {
    [0, 0, 0, 255]
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Layer {
    Rect(RectLayer),
    Video(VideoLayer),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RectLayer {
    pub x: Motion,
    pub y: Motion,
    pub width: u32,
    pub height: u32,
    pub color: [u8; 4],
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoLayer {
    pub source: String,
    #[serde(default)]
    pub x: i64,
    #[serde(default)]
    pub y: i64,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub stream_index: u32,
    /// Source time shown at the first frame of the render.
    #[serde(default)]
    pub start_secs: f64,
}

/// A coordinate that is either fixed or interpolated across the whole duration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Motion {
    Fixed(f64),
    Linear { from: f64, to: f64 },
}

impl Motion {
    pub fn at(self, progress: f64) -> f64 {
        match self {
            Self::Fixed(v) => v,
            Self::Linear { from, to } => from + (to - from) * progress.clamp(0.0, 1.0),
        }
    }
}

/// Position of `frame` along a timeline of `duration_frames`, in `0.0..=1.0`.
pub fn timeline_progress(frame: FrameIndex, duration_frames: u64) -> f64 {
    if duration_frames <= 1 {
        return 0.0;
    }
    (frame.0 as f64 / (duration_frames - 1) as f64).clamp(0.0, 1.0)
}

impl Scene {
    pub fn from_path(path: &Path) -> FramecastResult<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read scene '{}'", path.display()))?;
        let scene: Self = serde_json::from_str(&raw)
            .map_err(|e| FramecastError::serde(format!("scene '{}': {e}", path.display())))?;
        scene.validate()?;
        Ok(scene)
    }

    pub fn validate(&self) -> FramecastResult<()> {
        for (i, layer) in self.layers.iter().enumerate() {
            match layer {
                Layer::Rect(r) => {
                    if r.width == 0 || r.height == 0 {
                        return Err(FramecastError::validation(format!(
                            "layer {i}: rect width/height must be > 0"
                        )));
                    }
                    for (name, m) in [("x", r.x), ("y", r.y)] {
                        let finite = match m {
                            Motion::Fixed(v) => v.is_finite(),
                            Motion::Linear { from, to } => from.is_finite() && to.is_finite(),
                        };
                        if !finite {
                            return Err(FramecastError::validation(format!(
                                "layer {i}: rect {name} must be finite"
                            )));
                        }
                    }
                }
                Layer::Video(v) => {
                    if v.source.trim().is_empty() {
                        return Err(FramecastError::validation(format!(
                            "layer {i}: video source must be non-empty"
                        )));
                    }
                    if v.width == 0 || v.height == 0 {
                        return Err(FramecastError::validation(format!(
                            "layer {i}: video width/height must be > 0"
                        )));
                    }
                    if !(v.start_secs.is_finite() && v.start_secs >= 0.0) {
                        return Err(FramecastError::validation(format!(
                            "layer {i}: video startSecs must be >= 0"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn video_layers(&self) -> impl Iterator<Item = &VideoLayer> {
        self.layers.iter().filter_map(|l| match l {
            Layer::Video(v) => Some(v),
            Layer::Rect(_) => None,
        })
    }

    /// Composites one frame. `videos` holds the fetched image of each video layer, in
    /// layer order; a missing image leaves that layer blank.
    pub fn paint_frame(
        &self,
        canvas: Canvas,
        background: [u8; 4],
        progress: f64,
        videos: &[Option<RgbaImage>],
    ) -> RgbaImage {
        let mut out = RgbaImage::from_pixel(canvas.width, canvas.height, Rgba(background));
        let mut videos = videos.iter();

        for layer in &self.layers {
            match layer {
                Layer::Rect(r) => {
                    let fill = RgbaImage::from_pixel(r.width, r.height, Rgba(r.color));
                    imageops::overlay(
                        &mut out,
                        &fill,
                        r.x.at(progress).round() as i64,
                        r.y.at(progress).round() as i64,
                    );
                }
                Layer::Video(v) => {
                    let Some(Some(img)) = videos.next() else {
                        continue;
                    };
                    if img.dimensions() == (v.width, v.height) {
                        imageops::overlay(&mut out, img, v.x, v.y);
                    } else {
                        let scaled =
                            imageops::resize(img, v.width, v.height, imageops::FilterType::Triangle);
                        imageops::overlay(&mut out, &scaled, v.x, v.y);
                    }
                }
            }
        }
        out
    }
}

/// Turns a frame-server response body into pixels.
pub fn decode_video_frame(
    bytes: Vec<u8>,
    format: StreamFormat,
    width: u32,
    height: u32,
) -> FramecastResult<RgbaImage> {
    match format {
        StreamFormat::Raw => {
            let len = bytes.len();
            RgbaImage::from_raw(width, height, bytes).ok_or_else(|| {
                FramecastError::content(format!(
                    "raw frame of {len} bytes does not fit {width}x{height}"
                ))
            })
        }
        StreamFormat::Png | StreamFormat::Jpeg => {
            let img = image::load_from_memory(&bytes).context("decode video frame")?;
            Ok(img.to_rgba8())
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/surface/scene.rs"]
mod tests;
