//! Scene-driven implementation of the session contract.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use anyhow::Context as _;
use async_trait::async_trait;
use image::RgbaImage;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::{
    foundation::{
        core::{Canvas, FrameIndex},
        error::{FramecastError, FramecastResult, SessionFault},
    },
    media::{
        fingerprint::{DecodeFingerprint, fingerprint_request},
        frame_source::FrameRequest,
    },
    render::{
        barrier::FrameCompletionBarrier,
        config::{CaptureFormat, CaptureMethod},
        planner::Part,
    },
    server::client::{FetchError, FrameClient},
    surface::{
        FrameCapturer, LaunchOptions, LaunchedSurface, SessionInit, SurfaceLauncher,
        SurfaceSession,
        capture::{PaintedFrame, capturer_for},
        scene::{Scene, decode_video_frame, timeline_progress},
    },
};

pub const SESSION_MARKER: &str = "session.json";

/// Attempts at a frame whose decoder is still held by an abandoned read.
const BUSY_RETRIES: u32 = 20;
const BUSY_BACKOFF: Duration = Duration::from_millis(25);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionMarker {
    part: Part,
    capture_method: CaptureMethod,
    capture_format: CaptureFormat,
}

/// Launches sessions rendering one shared [`Scene`].
#[derive(Clone, Debug)]
pub struct SceneLauncher {
    scene: Arc<Scene>,
    http: reqwest::Client,
}

impl SceneLauncher {
    pub fn new(scene: Scene) -> Self {
        Self {
            scene: Arc::new(scene),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SurfaceLauncher for SceneLauncher {
    async fn launch(&self, opts: &LaunchOptions) -> FramecastResult<LaunchedSurface> {
        tokio::fs::create_dir_all(&opts.profile_dir)
            .await
            .with_context(|| format!("create profile dir '{}'", opts.profile_dir.display()))?;
        let marker = serde_json::to_vec_pretty(&SessionMarker {
            part: opts.part,
            capture_method: opts.capture_method,
            capture_format: opts.capture_format,
        })
        .map_err(|e| FramecastError::serde(e.to_string()))?;
        let marker_path = opts.profile_dir.join(SESSION_MARKER);
        tokio::fs::write(&marker_path, marker)
            .await
            .with_context(|| format!("write '{}'", marker_path.display()))?;

        let (painted_tx, painted_rx) = watch::channel(None);
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let capturer = capturer_for(
            opts.capture_method,
            painted_rx,
            opts.capture_format,
            opts.jpeg_quality,
        );

        tracing::debug!(
            part = opts.part.index,
            method = ?opts.capture_method,
            profile = %opts.profile_dir.display(),
            "scene session launched"
        );
        Ok(LaunchedSurface {
            session: Box::new(SceneSession {
                scene: Arc::clone(&self.scene),
                http: self.http.clone(),
                profile_dir: opts.profile_dir.clone(),
                settle_delay: opts.settle_delay,
                painted: painted_tx,
                faults: faults_tx,
                ready: None,
            }),
            capturer,
            faults: faults_rx,
        })
    }
}

type VideoSlots = Arc<Mutex<Vec<Option<RgbaImage>>>>;

fn lock_slots(slots: &VideoSlots) -> MutexGuard<'_, Vec<Option<RgbaImage>>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State that exists once `initialize` succeeded.
struct Ready {
    init: SessionInit,
    canvas: Canvas,
    background: [u8; 4],
    barrier: FrameCompletionBarrier,
    client: Option<FrameClient>,
    /// Source frame rate per video layer, in layer order.
    layer_fps: Vec<f64>,
    slots: VideoSlots,
    /// Cancelled once this state is dropped, abandoning in-flight frame fetches.
    fetches: CancellationToken,
    _abort_fetches: DropGuard,
}

pub struct SceneSession {
    scene: Arc<Scene>,
    http: reqwest::Client,
    profile_dir: PathBuf,
    settle_delay: Duration,
    painted: watch::Sender<Option<PaintedFrame>>,
    faults: mpsc::UnboundedSender<SessionFault>,
    ready: Option<Ready>,
}

impl SceneSession {
    fn ready(&self) -> FramecastResult<&Ready> {
        self.ready
            .as_ref()
            .ok_or_else(|| FramecastError::validation("scene session used before initialize"))
    }
}

fn background_override(user_data: &serde_json::Value) -> FramecastResult<Option<[u8; 4]>> {
    match user_data.get("background") {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => serde_json::from_value::<[u8; 4]>(v.clone())
            .map(Some)
            .map_err(|e| FramecastError::validation(format!("userData.background: {e}"))),
    }
}

#[async_trait]
impl SurfaceSession for SceneSession {
    async fn initialize(
        &mut self,
        init: &SessionInit,
        barrier: FrameCompletionBarrier,
    ) -> FramecastResult<()> {
        let canvas = Canvas {
            width: init.width,
            height: init.height,
        };
        canvas.validate()?;
        let background = background_override(&init.user_data)?.unwrap_or(self.scene.background);

        let videos = self.scene.video_layers().collect::<Vec<_>>();
        let client = match (&init.frame_server, videos.is_empty()) {
            (_, true) => None,
            (Some(server), false) => Some(FrameClient::new(
                self.http.clone(),
                server.clone(),
                init.render_id,
            )),
            (None, false) => {
                return Err(FramecastError::validation(
                    "scene has video layers but no frame server is configured",
                ));
            }
        };

        let mut layer_fps = Vec::with_capacity(videos.len());
        if let Some(client) = &client {
            for v in &videos {
                let info = client
                    .read_video_metadata(&v.source, v.stream_index)
                    .await
                    .map_err(|e| FramecastError::content(format!("video '{}': {e}", v.source)))?;
                layer_fps.push(info.fps.unwrap_or_else(|| init.fps.as_f64()));
            }
        }

        tracing::debug!(
            render_id = init.render_id,
            video_layers = videos.len(),
            profile = %self.profile_dir.display(),
            "scene session initialized"
        );
        let fetches = CancellationToken::new();
        self.ready = Some(Ready {
            init: init.clone(),
            canvas,
            background,
            barrier,
            client,
            slots: Arc::new(Mutex::new(vec![None; layer_fps.len()])),
            layer_fps,
            _abort_fetches: fetches.clone().drop_guard(),
            fetches,
        });
        Ok(())
    }

    async fn render_frame(&mut self, frame: FrameIndex) -> FramecastResult<()> {
        let ready = self.ready()?;
        let Some(client) = &ready.client else {
            return Ok(());
        };
        lock_slots(&ready.slots).iter_mut().for_each(|s| *s = None);

        let fps = ready.init.fps;
        // Layers decoding the same stream share one decoder, whose reads must not overlap.
        let mut groups: Vec<(DecodeFingerprint, Vec<(usize, FrameRequest)>)> = Vec::new();
        for (i, (layer, file_fps)) in self
            .scene
            .video_layers()
            .zip(ready.layer_fps.iter().copied())
            .enumerate()
        {
            let req = FrameRequest {
                source: layer.source.clone(),
                width: layer.width,
                height: layer.height,
                scale: true,
                fps: fps.as_f64(),
                file_fps,
                stream_index: layer.stream_index,
                format: ready.init.stream_format,
                quality: ready.init.jpeg_quality,
                render_id: Some(ready.init.render_id),
                time: layer.start_secs + fps.frames_to_secs(frame.0),
            };
            let key = fingerprint_request(&req);
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push((i, req)),
                None => groups.push((key, vec![(i, req)])),
            }
        }

        for (_, members) in groups {
            let label = members
                .iter()
                .map(|(i, _)| format!("video layer {i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let fetch = fetch_layers(
                client.clone(),
                members,
                Arc::clone(&ready.slots),
                self.faults.clone(),
            );
            let abandoned = ready.fetches.clone();
            ready.barrier.wait_for(label, async move {
                tokio::select! {
                    res = fetch => res,
                    () = abandoned.cancelled() => Err("scene session closed".to_string()),
                }
            })?;
        }
        Ok(())
    }

    async fn await_settled(&mut self, frame: FrameIndex) -> FramecastResult<()> {
        let ready = self.ready()?;
        let progress = timeline_progress(frame, ready.init.duration_frames);
        let image = {
            let slots = lock_slots(&ready.slots);
            self.scene
                .paint_frame(ready.canvas, ready.background, progress, &slots)
        };
        self.painted.send_replace(Some(PaintedFrame {
            frame,
            image: Arc::new(image),
        }));

        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }
        Ok(())
    }

    async fn close(&mut self) {
        // Dropping the state cancels fetches still in flight.
        self.ready = None;
        self.painted.send_replace(None);
        tracing::debug!(profile = %self.profile_dir.display(), "scene session closed");
    }
}

/// Fetches the frames of layers sharing one decoder, one read at a time. Layers
/// showing the same timestamp reuse the decoded image.
async fn fetch_layers(
    client: FrameClient,
    members: Vec<(usize, FrameRequest)>,
    slots: VideoSlots,
    faults: mpsc::UnboundedSender<SessionFault>,
) -> Result<(), String> {
    let mut decoded: Vec<(u64, RgbaImage)> = Vec::new();
    for (i, req) in members {
        let time = req.time.to_bits();
        let img = match decoded.iter().find(|(t, _)| *t == time) {
            Some((_, img)) => img.clone(),
            None => {
                let bytes = fetch_frame(&client, &req, &faults).await?;
                let img = decode_video_frame(bytes, req.format, req.width, req.height)
                    .map_err(|e| e.to_string())?;
                decoded.push((time, img.clone()));
                img
            }
        };
        if let Some(slot) = lock_slots(&slots).get_mut(i) {
            *slot = Some(img);
        }
    }
    Ok(())
}

async fn fetch_frame(
    client: &FrameClient,
    req: &FrameRequest,
    faults: &mpsc::UnboundedSender<SessionFault>,
) -> Result<Vec<u8>, String> {
    let mut busy = 0;
    loop {
        match client.fetch_frame(req).await {
            Ok(bytes) => return Ok(bytes),
            // The server releases a decoder once it notices the previous session's
            // request was dropped.
            Err(FetchError::Rejected { status: 409, .. }) if busy < BUSY_RETRIES => {
                busy += 1;
                tokio::time::sleep(BUSY_BACKOFF).await;
            }
            Err(e) => {
                if matches!(e, FetchError::Network(_)) {
                    // Nobody listens once the session is torn down.
                    let _ = faults.send(SessionFault::RequestFailed(e.to_string()));
                }
                return Err(e.to_string());
            }
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/surface/host.rs"]
mod tests;
