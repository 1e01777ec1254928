use super::*;

fn parse(json: &str) -> Scene {
    serde_json::from_str(json).unwrap()
}

#[test]
fn parses_rect_and_video_layers() {
    let scene = parse(
        r#"{
            "background": [10, 20, 30, 255],
            "layers": [
                {"type": "rect", "x": 0, "y": {"from": 0, "to": 8}, "width": 2, "height": 2, "color": [255, 0, 0, 255]},
                {"type": "video", "source": "clip.mp4", "width": 4, "height": 4, "startSecs": 1.5}
            ]
        }"#,
    );
    assert_eq!(scene.background, [10, 20, 30, 255]);
    assert_eq!(scene.layers.len(), 2);
    match &scene.layers[0] {
        Layer::Rect(r) => {
            assert_eq!(r.x, Motion::Fixed(0.0));
            assert_eq!(r.y, Motion::Linear { from: 0.0, to: 8.0 });
        }
        other => panic!("unexpected {other:?}"),
    }
    let videos = scene.video_layers().collect::<Vec<_>>();
    assert_eq!(videos.len(), 1);
    assert_eq!(videos[0].start_secs, 1.5);
    assert_eq!(videos[0].stream_index, 0);
    scene.validate().unwrap();
}

#[test]
fn defaults_to_opaque_black_without_layers() {
    let scene = parse("{}");
    assert_eq!(scene.background, [0, 0, 0, 255]);
    assert!(scene.layers.is_empty());
}

#[test]
fn unknown_top_level_fields_are_rejected() {
    assert!(serde_json::from_str::<Scene>(r#"{"backdrop": [0,0,0,0]}"#).is_err());
}

#[test]
fn validate_rejects_degenerate_layers() {
    let empty_rect = parse(
        r#"{"layers": [{"type": "rect", "x": 0, "y": 0, "width": 0, "height": 2, "color": [0,0,0,255]}]}"#,
    );
    assert!(empty_rect.validate().is_err());

    let blank_source = parse(
        r#"{"layers": [{"type": "video", "source": " ", "width": 2, "height": 2}]}"#,
    );
    assert!(blank_source.validate().is_err());
}

#[test]
fn progress_spans_first_to_last_frame() {
    assert_eq!(timeline_progress(FrameIndex(0), 1), 0.0);
    assert_eq!(timeline_progress(FrameIndex(0), 5), 0.0);
    assert_eq!(timeline_progress(FrameIndex(2), 5), 0.5);
    assert_eq!(timeline_progress(FrameIndex(4), 5), 1.0);
    assert_eq!(timeline_progress(FrameIndex(9), 5), 1.0);
}

#[test]
fn linear_motion_moves_rect_across_frames() {
    let scene = parse(
        r#"{"background": [0,0,0,255], "layers": [
            {"type": "rect", "x": {"from": 0, "to": 3}, "y": 0, "width": 1, "height": 1, "color": [255,255,255,255]}
        ]}"#,
    );
    let canvas = Canvas {
        width: 4,
        height: 1,
    };

    let first = scene.paint_frame(canvas, scene.background, 0.0, &[]);
    assert_eq!(first.get_pixel(0, 0).0, [255, 255, 255, 255]);
    assert_eq!(first.get_pixel(3, 0).0, [0, 0, 0, 255]);

    let last = scene.paint_frame(canvas, scene.background, 1.0, &[]);
    assert_eq!(last.get_pixel(0, 0).0, [0, 0, 0, 255]);
    assert_eq!(last.get_pixel(3, 0).0, [255, 255, 255, 255]);
}

#[test]
fn video_layers_draw_fetched_pixels_and_skip_missing_ones() {
    let scene = parse(
        r#"{"background": [0,0,0,255], "layers": [
            {"type": "video", "source": "a.mp4", "x": 0, "y": 0, "width": 1, "height": 1},
            {"type": "video", "source": "b.mp4", "x": 1, "y": 0, "width": 1, "height": 1}
        ]}"#,
    );
    let canvas = Canvas {
        width: 2,
        height: 1,
    };
    let red = RgbaImage::from_pixel(1, 1, Rgba([255, 0, 0, 255]));

    let img = scene.paint_frame(canvas, [0, 0, 0, 255], 0.0, &[Some(red), None]);
    assert_eq!(img.get_pixel(0, 0).0, [255, 0, 0, 255]);
    assert_eq!(img.get_pixel(1, 0).0, [0, 0, 0, 255]);
}

#[test]
fn mismatched_video_frames_are_resized_to_the_layer() {
    let scene = parse(
        r#"{"layers": [{"type": "video", "source": "a.mp4", "width": 2, "height": 2}]}"#,
    );
    let canvas = Canvas {
        width: 2,
        height: 2,
    };
    let green = RgbaImage::from_pixel(1, 1, Rgba([0, 255, 0, 255]));
    let img = scene.paint_frame(canvas, scene.background, 0.0, &[Some(green)]);
    for p in img.pixels() {
        assert_eq!(p.0, [0, 255, 0, 255]);
    }
}

#[test]
fn decode_video_frame_checks_raw_length() {
    let ok = decode_video_frame(vec![7u8; 8], StreamFormat::Raw, 2, 1).unwrap();
    assert_eq!(ok.dimensions(), (2, 1));

    let err = decode_video_frame(vec![7u8; 4], StreamFormat::Raw, 2, 1).unwrap_err();
    assert!(matches!(err, FramecastError::Content(_)));
}

#[test]
fn decode_video_frame_reads_png() {
    let img = RgbaImage::from_pixel(3, 2, Rgba([1, 2, 3, 255]));
    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png).unwrap();

    let decoded = decode_video_frame(buf.into_inner(), StreamFormat::Png, 3, 2).unwrap();
    assert_eq!(decoded, img);
}

#[test]
fn from_path_reports_bad_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scene.json");
    std::fs::write(&path, "{ not json").unwrap();
    assert!(matches!(
        Scene::from_path(&path).unwrap_err(),
        FramecastError::Serde(_)
    ));

    std::fs::write(&path, r#"{"background": [1,2,3,4]}"#).unwrap();
    assert_eq!(Scene::from_path(&path).unwrap().background, [1, 2, 3, 4]);
}
