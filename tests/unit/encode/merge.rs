use super::*;

#[test]
fn manifest_line_escapes_single_quotes() {
    assert_eq!(
        manifest_line(Path::new("/tmp/it's here/part 0-0-2.mkv")),
        r"file '/tmp/it'\''s here/part 0-0-2.mkv'"
    );
}

#[test]
fn manifest_keeps_part_order_and_absolutizes() {
    let manifest = concat_manifest(&[
        PathBuf::from("/a/part 0-0-2.mkv"),
        PathBuf::from("rel/part 1-2-4.mkv"),
    ])
    .unwrap();
    let lines = manifest.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "file '/a/part 0-0-2.mkv'");
    assert!(lines[1].starts_with("file '/"));
    assert!(lines[1].ends_with("rel/part 1-2-4.mkv'"));
}

#[test]
fn remux_uses_stream_copy_and_reencode_uses_x264() {
    let base = MergeConfig {
        ffmpeg: PathBuf::from("ffmpeg"),
        manifest_path: PathBuf::from("tmp/concat.txt"),
        out_path: PathBuf::from("out.mov"),
        remux_only: true,
    };
    let remux = base.args();
    assert_eq!(&remux[..8], &[
        "-f",
        "concat",
        "-safe",
        "0",
        "-protocol_whitelist",
        "file,pipe",
        "-i",
        "tmp/concat.txt"
    ]);
    assert!(remux.windows(2).any(|w| w == ["-c", "copy"]));
    assert_eq!(&remux[remux.len() - 4..], &["-movflags", "+faststart", "-y", "out.mov"]);

    let reencode = MergeConfig {
        remux_only: false,
        ..base
    }
    .args();
    assert!(reencode.windows(2).any(|w| w == ["-c:v", "libx264"]));
    assert!(reencode.windows(2).any(|w| w == ["-crf", "17"]));
    assert!(!reencode.iter().any(|a| a == "copy"));
}

#[tokio::test]
async fn merging_nothing_is_rejected() {
    let cfg = MergeConfig {
        ffmpeg: PathBuf::from("ffmpeg"),
        manifest_path: PathBuf::from("concat.txt"),
        out_path: PathBuf::from("out.mp4"),
        remux_only: true,
    };
    assert!(matches!(
        merge_parts(&cfg, &[]).await,
        Err(FramecastError::Validation(_))
    ));
}
