use super::*;

#[test]
fn output_extension_follows_duration_and_format() {
    let mut cfg = RenderConfig::default();
    assert_eq!(default_output_path(&cfg, true), PathBuf::from("framecast.jpg"));

    cfg.capture_format = CaptureFormat::Png;
    assert_eq!(default_output_path(&cfg, false), PathBuf::from("framecast.png"));

    cfg.duration_frames = 90;
    assert_eq!(default_output_path(&cfg, true), PathBuf::from("framecast.mkv"));
    assert_eq!(default_output_path(&cfg, false), PathBuf::from("framecast.mp4"));

    cfg.capture_format = CaptureFormat::Jpeg;
    assert_eq!(default_output_path(&cfg, true), PathBuf::from("framecast.mov"));
}

#[test]
fn jobs_cover_the_range_and_share_the_config() {
    let cfg = RenderConfig {
        duration_frames: 10,
        num_retries: 7,
        ..RenderConfig::default()
    };
    let jobs = plan_jobs(&cfg, 100, 3).unwrap();

    assert_eq!(jobs.len(), 3);
    assert_eq!(jobs[0].part.start, FrameIndex(100));
    assert_eq!(jobs[2].part.end, FrameIndex(110));
    assert!(jobs.windows(2).all(|w| w[0].part.end == w[1].part.start));
    assert!(jobs.iter().all(|j| j.config.num_retries == 7));
    assert_eq!(
        jobs.iter().map(|j| j.part.len_frames()).collect::<Vec<_>>(),
        vec![3, 3, 4]
    );
}

#[test]
fn concurrency_is_capped_by_frame_count() {
    let cfg = RenderConfig {
        duration_frames: 2,
        ..RenderConfig::default()
    };
    assert_eq!(plan_jobs(&cfg, 0, 16).unwrap().len(), 2);
}

struct NeverRunner;

#[async_trait::async_trait]
impl PartRunner for NeverRunner {
    async fn run_part(
        &self,
        _job: RenderJob,
        _events: crate::render::pool::PartEvents,
        _cancel: tokio_util::sync::CancellationToken,
    ) -> FramecastResult<PathBuf> {
        panic!("invalid renders must not dispatch parts");
    }
}

#[tokio::test]
async fn invalid_options_fail_before_any_work() {
    let dir = tempfile::tempdir().unwrap();
    let temp_dir = dir.path().join("tmp");

    let opts = RenderOptions {
        config: RenderConfig {
            duration_frames: 0,
            temp_dir: temp_dir.clone(),
            ..RenderConfig::default()
        },
        ..RenderOptions::default()
    };
    let err = render_video(&opts, Arc::new(NeverRunner), None)
        .await
        .unwrap_err();
    assert!(matches!(err, FramecastError::Validation(_)), "{err}");

    let opts = RenderOptions {
        config: RenderConfig {
            temp_dir: temp_dir.clone(),
            ..RenderConfig::default()
        },
        concurrency: 0,
        ..RenderOptions::default()
    };
    let err = render_video(&opts, Arc::new(NeverRunner), None)
        .await
        .unwrap_err();
    assert!(matches!(err, FramecastError::Validation(_)), "{err}");
    assert!(!temp_dir.exists());
}

/// Fails every part, so no ffmpeg is needed to observe the error path.
struct FailingRunner;

#[async_trait::async_trait]
impl PartRunner for FailingRunner {
    async fn run_part(
        &self,
        job: RenderJob,
        _events: crate::render::pool::PartEvents,
        _cancel: tokio_util::sync::CancellationToken,
    ) -> FramecastResult<PathBuf> {
        assert!(job.config.frame_server.is_some());
        Err(FramecastError::content(format!(
            "part {} failed",
            job.part.index
        )))
    }
}

#[tokio::test]
async fn part_failures_surface_and_the_server_is_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let opts = RenderOptions {
        config: RenderConfig {
            duration_frames: 4,
            temp_dir: dir.path().join("tmp"),
            ..RenderConfig::default()
        },
        concurrency: 2,
        ..RenderOptions::default()
    };

    let err = render_video(&opts, Arc::new(FailingRunner), None)
        .await
        .unwrap_err();
    assert!(matches!(err, FramecastError::Content(_)), "{err}");
    assert!(dir.path().join("tmp").is_dir());
}
