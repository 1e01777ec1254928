use super::*;

#[test]
fn display_prefixes_are_stable() {
    assert!(
        FramecastError::validation("x")
            .to_string()
            .contains("validation error:")
    );
    assert!(FramecastError::timeout("x").to_string().contains("timed out:"));
    assert!(
        FramecastError::content("x")
            .to_string()
            .contains("content error:")
    );
    assert!(FramecastError::busy("x").to_string().contains("busy:"));
    assert!(
        FramecastError::serde("x")
            .to_string()
            .contains("serialization error:")
    );
    assert_eq!(FramecastError::Cancelled.to_string(), "render cancelled");
}

#[test]
fn only_session_faults_and_timeouts_are_recoverable() {
    assert!(FramecastError::from(SessionFault::Script("boom".into())).is_recoverable());
    assert!(FramecastError::from(SessionFault::Capture("blank".into())).is_recoverable());
    assert!(FramecastError::timeout("frame 3").is_recoverable());

    assert!(!FramecastError::validation("bad width").is_recoverable());
    assert!(!FramecastError::content("video layer 404").is_recoverable());
    assert!(!FramecastError::Cancelled.is_recoverable());
    assert!(!FramecastError::process("ffmpeg exited 1").is_recoverable());
}

#[test]
fn verification_message_names_both_counts() {
    let msg = FramecastError::Verification {
        expected: 10,
        actual: 9,
    }
    .to_string();
    assert!(msg.contains("expected 10"));
    assert!(msg.contains("found 9"));
}

#[test]
fn other_preserves_source() {
    let base = std::io::Error::other("boom");
    let err = FramecastError::Other(anyhow::Error::new(base));
    assert!(err.to_string().contains("boom"));
}

#[test]
fn session_fault_serializes_with_tag() {
    let json = serde_json::to_value(SessionFault::RequestFailed("conn reset".into())).unwrap();
    assert_eq!(json["fault"], "request_failed");
    assert_eq!(json["detail"], "conn reset");
}
