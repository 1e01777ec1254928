pub(crate) mod ffmpeg;
pub(crate) mod merge;
pub(crate) mod sink;
