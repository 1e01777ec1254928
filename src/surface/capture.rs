use std::{io::Cursor, sync::Arc, time::Duration};

use async_trait::async_trait;
use image::{
    ImageEncoder, RgbaImage,
    codecs::{jpeg::JpegEncoder, png::PngEncoder},
};
use tokio::sync::{mpsc, oneshot, watch};

use crate::{
    foundation::{
        core::FrameIndex,
        error::{FramecastResult, SessionFault},
    },
    render::config::{CaptureFormat, CaptureMethod},
    surface::FrameCapturer,
};

const SCREENCAST_ATTEMPTS: u32 = 5;
const SCREENCAST_WAIT: Duration = Duration::from_secs(5);

/// Latest image painted by a session.
#[derive(Clone, Debug)]
pub struct PaintedFrame {
    pub frame: FrameIndex,
    pub image: Arc<RgbaImage>,
}

pub type PaintedFrames = watch::Receiver<Option<PaintedFrame>>;

pub fn encode_image(img: &RgbaImage, format: CaptureFormat, quality: u8) -> FramecastResult<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    let (w, h) = img.dimensions();
    let res = match format {
        CaptureFormat::Jpeg => {
            let rgb = image::DynamicImage::ImageRgba8(img.clone()).to_rgb8();
            JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100)).write_image(
                rgb.as_raw(),
                w,
                h,
                image::ExtendedColorType::Rgb8,
            )
        }
        CaptureFormat::Png => PngEncoder::new(&mut buf).write_image(
            img.as_raw(),
            w,
            h,
            image::ExtendedColorType::Rgba8,
        ),
    };
    res.map_err(|e| SessionFault::Capture(format!("encode {format:?} frame: {e}")))?;
    Ok(buf.into_inner())
}

async fn encode_off_thread(
    painted: PaintedFrame,
    format: CaptureFormat,
    quality: u8,
) -> FramecastResult<Vec<u8>> {
    tokio::task::spawn_blocking(move || encode_image(&painted.image, format, quality))
        .await
        .map_err(|e| SessionFault::Capture(format!("encoder task failed: {e}")))?
}

/// Picks the capturer for `method`. The extension method also starts its relay task,
/// which lives until the returned capturer is dropped.
pub fn capturer_for(
    method: CaptureMethod,
    frames: PaintedFrames,
    format: CaptureFormat,
    quality: u8,
) -> Box<dyn FrameCapturer> {
    match method {
        CaptureMethod::Screenshot => Box::new(ScreenshotCapturer {
            frames,
            format,
            quality,
        }),
        CaptureMethod::Screencast => Box::new(ScreencastCapturer {
            frames,
            format,
            quality,
        }),
        CaptureMethod::Extension => Box::new(ExtensionCapturer {
            relay: spawn_extension_relay(frames, format, quality),
        }),
    }
}

/// Encodes whatever is painted right now.
pub struct ScreenshotCapturer {
    frames: PaintedFrames,
    format: CaptureFormat,
    quality: u8,
}

#[async_trait]
impl FrameCapturer for ScreenshotCapturer {
    async fn capture(&mut self, frame: FrameIndex) -> FramecastResult<Vec<u8>> {
        let current = self.frames.borrow().clone();
        match current {
            Some(painted) if painted.frame == frame => {
                encode_off_thread(painted, self.format, self.quality).await
            }
            Some(painted) => Err(SessionFault::Capture(format!(
                "unable to capture screenshot: frame {} is painted, wanted {frame}",
                painted.frame
            ))
            .into()),
            None => Err(SessionFault::Capture(
                "unable to capture screenshot: nothing painted yet".to_string(),
            )
            .into()),
        }
    }
}

/// Waits for the requested frame to show up on the session's paint stream.
pub struct ScreencastCapturer {
    frames: PaintedFrames,
    format: CaptureFormat,
    quality: u8,
}

#[async_trait]
impl FrameCapturer for ScreencastCapturer {
    async fn capture(&mut self, frame: FrameIndex) -> FramecastResult<Vec<u8>> {
        for attempt in 1..=SCREENCAST_ATTEMPTS {
            let waited = tokio::time::timeout(
                SCREENCAST_WAIT,
                self.frames
                    .wait_for(|p| p.as_ref().is_some_and(|p| p.frame == frame)),
            )
            .await
            .map(|res| res.map(|painted| painted.clone()));
            match waited {
                Ok(Ok(Some(painted))) => {
                    return encode_off_thread(painted, self.format, self.quality).await;
                }
                Ok(Ok(None)) => {}
                Ok(Err(_)) => {
                    return Err(SessionFault::Capture("screencast stream closed".to_string()).into());
                }
                Err(_) => {
                    tracing::debug!(%frame, attempt, "screencast frame not received yet");
                }
            }
        }
        Err(SessionFault::Capture(format!(
            "no screencast frame for {frame} after {SCREENCAST_ATTEMPTS} attempts"
        ))
        .into())
    }
}

pub struct CaptureRequest {
    pub frame: FrameIndex,
    pub reply: oneshot::Sender<Vec<u8>>,
}

/// Capture relay running beside the session. Replies with an empty buffer when it
/// has nothing to offer for the requested frame.
pub fn spawn_extension_relay(
    frames: PaintedFrames,
    format: CaptureFormat,
    quality: u8,
) -> mpsc::Sender<CaptureRequest> {
    let (tx, mut rx) = mpsc::channel::<CaptureRequest>(1);
    tokio::spawn(async move {
        while let Some(req) = rx.recv().await {
            let current = frames.borrow().clone();
            let bytes = match current {
                Some(painted) if painted.frame == req.frame => {
                    match encode_off_thread(painted, format, quality).await {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            tracing::warn!(frame = %req.frame, "capture relay failed: {e}");
                            Vec::new()
                        }
                    }
                }
                _ => Vec::new(),
            };
            // The requester may have timed out and gone away.
            let _ = req.reply.send(bytes);
        }
    });
    tx
}

pub struct ExtensionCapturer {
    relay: mpsc::Sender<CaptureRequest>,
}

#[async_trait]
impl FrameCapturer for ExtensionCapturer {
    async fn capture(&mut self, frame: FrameIndex) -> FramecastResult<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.relay
            .send(CaptureRequest { frame, reply })
            .await
            .map_err(|_| SessionFault::Capture("capture relay is gone".to_string()))?;
        let bytes = rx
            .await
            .map_err(|_| SessionFault::Capture("capture relay dropped the request".to_string()))?;
        if bytes.is_empty() {
            return Err(
                SessionFault::Capture(format!("capture relay returned no data for {frame}")).into(),
            );
        }
        Ok(bytes)
    }
}

#[cfg(test)]
#[path = "../../tests/unit/surface/capture.rs"]
mod tests;
