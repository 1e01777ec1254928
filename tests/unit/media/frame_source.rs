use std::{
    io::Cursor,
    sync::atomic::{AtomicUsize, Ordering},
};

use tokio::{io::AsyncWriteExt as _, sync::Notify};

use super::*;

/// Serves `frames` raw frames per launch; frame k is filled with byte k.
struct FakeLauncher {
    launches: AtomicUsize,
    seeks: std::sync::Mutex<Vec<f64>>,
    frames: usize,
    short_frames: bool,
}

impl FakeLauncher {
    fn new(frames: usize) -> Self {
        Self {
            launches: AtomicUsize::new(0),
            seeks: std::sync::Mutex::new(Vec::new()),
            frames,
            short_frames: false,
        }
    }

    fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl DecodeLauncher for FakeLauncher {
    fn launch(&self, req: &FrameRequest, seek_secs: f64) -> FramecastResult<DecodeProcess> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.seeks.lock().unwrap().push(seek_secs);
        let mut frame_len = req.width as usize * req.height as usize * 4;
        if self.short_frames {
            frame_len -= 1;
        }
        let mut bytes = Vec::new();
        for k in 0..self.frames {
            bytes.extend(std::iter::repeat_n(k as u8, frame_len));
        }
        Ok(DecodeProcess {
            stdout: Box::new(Cursor::new(bytes)),
            child: None,
        })
    }
}

/// Hands out the reading half of a duplex pipe and keeps the writer for the test.
struct PipeLauncher {
    writers: std::sync::Mutex<Vec<tokio::io::DuplexStream>>,
    launched: Notify,
}

impl DecodeLauncher for PipeLauncher {
    fn launch(&self, _req: &FrameRequest, _seek_secs: f64) -> FramecastResult<DecodeProcess> {
        let (writer, reader) = tokio::io::duplex(1024);
        self.writers.lock().unwrap().push(writer);
        self.launched.notify_one();
        Ok(DecodeProcess {
            stdout: Box::new(reader),
            child: None,
        })
    }
}

fn request(time: f64) -> FrameRequest {
    FrameRequest {
        source: "clip.mp4".to_string(),
        width: 2,
        height: 1,
        scale: true,
        fps: 30.0,
        file_fps: 25.0,
        stream_index: 0,
        format: StreamFormat::Raw,
        quality: 90,
        render_id: None,
        time,
    }
}

#[tokio::test]
async fn sequential_frames_reuse_one_decoder() {
    let launcher = Arc::new(FakeLauncher::new(5));
    let cache = FrameSourceCache::new(launcher.clone());

    for k in 0..3u8 {
        let frame = cache.get_frame(&request(f64::from(k) / 30.0)).await.unwrap();
        assert_eq!(frame.data, vec![k; 8]);
        assert_eq!(frame.encoding, StreamFormat::Raw);
        assert_eq!(frame.frame, FrameIndex(u64::from(k)));
    }
    assert_eq!(launcher.launches(), 1);
    assert_eq!(cache.live_decoders(), 1);
}

#[tokio::test]
async fn jitter_below_half_a_frame_still_reuses() {
    let launcher = Arc::new(FakeLauncher::new(5));
    let cache = FrameSourceCache::new(launcher.clone());

    cache.get_frame(&request(0.0)).await.unwrap();
    let second = cache.get_frame(&request(1.0 / 30.0 + 0.01)).await.unwrap();
    assert_eq!(second.data, vec![1u8; 8]);
    assert_eq!(launcher.launches(), 1);
}

#[tokio::test]
async fn time_jump_restarts_with_epsilon_seek() {
    let launcher = Arc::new(FakeLauncher::new(5));
    let cache = FrameSourceCache::new(launcher.clone());

    cache.get_frame(&request(0.0)).await.unwrap();
    let jumped = cache.get_frame(&request(1.0)).await.unwrap();
    assert_eq!(jumped.data, vec![0u8; 8]);
    assert_eq!(launcher.launches(), 2);

    let seeks = launcher.seeks.lock().unwrap().clone();
    assert_eq!(seeks[0], 0.0);
    assert!((seeks[1] - (1.0 - 0.1 / 25.0)).abs() < 1e-9);
}

#[tokio::test]
async fn backwards_request_restarts() {
    let launcher = Arc::new(FakeLauncher::new(5));
    let cache = FrameSourceCache::new(launcher.clone());

    cache.get_frame(&request(2.0 / 30.0)).await.unwrap();
    cache.get_frame(&request(1.0 / 30.0)).await.unwrap();
    assert_eq!(launcher.launches(), 2);
    assert_eq!(cache.live_decoders(), 1);
}

#[tokio::test]
async fn parameter_change_uses_separate_decoder() {
    let launcher = Arc::new(FakeLauncher::new(5));
    let cache = FrameSourceCache::new(launcher.clone());

    cache.get_frame(&request(0.0)).await.unwrap();
    cache
        .get_frame(&FrameRequest {
            width: 4,
            ..request(1.0 / 30.0)
        })
        .await
        .unwrap();
    assert_eq!(launcher.launches(), 2);
    assert_eq!(cache.live_decoders(), 2);
}

#[tokio::test]
async fn overlapping_read_fails_fast_with_busy() {
    let launcher = Arc::new(PipeLauncher {
        writers: std::sync::Mutex::new(Vec::new()),
        launched: Notify::new(),
    });
    let cache = Arc::new(FrameSourceCache::new(launcher.clone()));

    let first = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.get_frame(&request(0.0)).await })
    };
    launcher.launched.notified().await;

    let err = cache.get_frame(&request(0.0)).await.unwrap_err();
    assert!(matches!(err, FramecastError::Busy(_)), "{err}");

    let mut writer = launcher.writers.lock().unwrap().pop().unwrap();
    writer.write_all(&[7u8; 8]).await.unwrap();
    let frame = first.await.unwrap().unwrap();
    assert_eq!(frame.data, vec![7u8; 8]);
}

#[tokio::test]
async fn failed_read_drops_entry_and_next_request_restarts() {
    let launcher = Arc::new(FakeLauncher {
        short_frames: true,
        ..FakeLauncher::new(1)
    });
    let cache = FrameSourceCache::new(launcher.clone());

    let err = cache.get_frame(&request(0.0)).await.unwrap_err();
    assert!(matches!(err, FramecastError::Process(_)), "{err}");
    assert_eq!(cache.live_decoders(), 0);

    let _ = cache.get_frame(&request(1.0 / 30.0)).await;
    assert_eq!(launcher.launches(), 2);
}

#[tokio::test]
async fn exhausted_decoder_reports_stream_end() {
    let launcher = Arc::new(FakeLauncher::new(1));
    let cache = FrameSourceCache::new(launcher.clone());

    cache.get_frame(&request(0.0)).await.unwrap();
    let err = cache.get_frame(&request(1.0 / 30.0)).await.unwrap_err();
    assert!(err.to_string().contains("stream has ended"), "{err}");
}

#[tokio::test]
async fn cleanup_all_empties_the_table() {
    let launcher = Arc::new(FakeLauncher::new(3));
    let cache = FrameSourceCache::new(launcher.clone());
    cache.get_frame(&request(0.0)).await.unwrap();
    cache
        .get_frame(&FrameRequest {
            source: "other.mp4".into(),
            ..request(0.0)
        })
        .await
        .unwrap();
    assert_eq!(cache.live_decoders(), 2);
    cache.cleanup_all();
    assert_eq!(cache.live_decoders(), 0);
}

#[tokio::test]
async fn invalid_request_is_rejected_before_launch() {
    let launcher = Arc::new(FakeLauncher::new(1));
    let cache = FrameSourceCache::new(launcher.clone());
    let err = cache
        .get_frame(&FrameRequest {
            fps: 0.0,
            ..request(0.0)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, FramecastError::Validation(_)));
    assert_eq!(launcher.launches(), 0);
}

#[test]
fn jpeg_quality_maps_onto_qscale_range() {
    assert_eq!(jpeg_qscale(100), 2);
    assert_eq!(jpeg_qscale(0), 31);
    assert_eq!(jpeg_qscale(90), 5);
    assert_eq!(jpeg_qscale(50), 17);
}

#[test]
fn decoder_args_follow_format() {
    let raw = decoder_args(&request(0.0), 0.5);
    assert_eq!(&raw[..3], &["-hide_banner", "-ss", "0.5"]);
    assert!(raw.windows(2).any(|w| w == ["-vf", "fps=30,scale=2:1"]));
    assert!(raw.windows(2).any(|w| w == ["-map", "0:v:0"]));
    assert!(raw.windows(2).any(|w| w == ["-vcodec", "rawvideo"]));
    assert_eq!(&raw[raw.len() - 3..], &["-f", "image2pipe", "-"]);

    let jpeg = decoder_args(
        &FrameRequest {
            format: StreamFormat::Jpeg,
            scale: false,
            ..request(0.0)
        },
        0.0,
    );
    assert!(jpeg.windows(2).any(|w| w == ["-vf", "fps=30"]));
    assert!(jpeg.windows(2).any(|w| w == ["-q:v", "5"]));
    assert!(jpeg.windows(2).any(|w| w == ["-vcodec", "mjpeg"]));
}

#[test]
fn split_mode_matches_encoding() {
    assert_eq!(request(0.0).split_mode(), SplitMode::Length(8));
    assert_eq!(
        FrameRequest {
            format: StreamFormat::Png,
            ..request(0.0)
        }
        .split_mode(),
        SplitMode::Delimiter(PNG_SIGNATURE.to_vec())
    );
}
