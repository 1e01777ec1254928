pub(crate) mod demux;
pub(crate) mod fingerprint;
pub(crate) mod frame_source;
pub(crate) mod probe;
