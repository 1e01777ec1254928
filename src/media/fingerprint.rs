use crate::media::frame_source::{FrameRequest, StreamFormat};

/// Identity of a decode configuration: every request parameter except the timestamp.
///
/// Frame rates are compared by bit pattern, so `30.0` and `29.999999` get separate
/// decoders.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DecodeFingerprint {
    source: String,
    width: u32,
    height: u32,
    scale: bool,
    fps_bits: u64,
    file_fps_bits: u64,
    stream_index: u32,
    format: StreamFormat,
    quality: u8,
    render_id: Option<u64>,
}

pub fn fingerprint_request(req: &FrameRequest) -> DecodeFingerprint {
    DecodeFingerprint {
        source: req.source.clone(),
        width: req.width,
        height: req.height,
        scale: req.scale,
        fps_bits: req.fps.to_bits(),
        file_fps_bits: req.file_fps.to_bits(),
        stream_index: req.stream_index,
        format: req.format,
        quality: req.quality,
        render_id: req.render_id,
    }
}

#[cfg(test)]
#[path = "../../tests/unit/media/fingerprint.rs"]
mod tests;
