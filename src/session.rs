//! Parsed session-description model.
//!
//! A live source announces its streams with a session description; by the
//! time it reaches the muxing stage it has already been parsed into the
//! structured form below. One [`MediaDescription`] per elementary stream,
//! in announcement order — the box builder assigns track ids from that
//! order.

use bytes::Bytes;

/// Media class of a described stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

/// Codec-specific configuration carried by a media entry.
#[derive(Debug, Clone, PartialEq)]
pub enum CodecParams {
    /// H.264: parameter sets (without start codes) and coded dimensions.
    H264 {
        sps: Bytes,
        pps: Bytes,
        width: u32,
        height: u32,
    },
    /// AAC: the AudioSpecificConfig bytes and channel count.
    Aac {
        audio_specific_config: Bytes,
        channels: u16,
    },
}

impl CodecParams {
    /// Short codec name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            CodecParams::H264 { .. } => "H264",
            CodecParams::Aac { .. } => "AAC",
        }
    }
}

/// One elementary stream announced by the session description.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaDescription {
    pub kind: MediaKind,
    /// Dynamic payload identifier elementary packets are tagged with.
    pub payload_type: u8,
    /// Encoding name as announced (e.g. "H264", "MPEG4-GENERIC").
    pub encoding: String,
    /// Timestamp clock rate in Hz (e.g. 90000 for video, 48000 for AAC).
    pub clock_rate: u32,
    /// Announced bandwidth in kbit/s, if present.
    pub bitrate: Option<u32>,
    /// Announced frame rate, if present.
    pub framerate: Option<f64>,
    pub codec: CodecParams,
}

/// A parsed session description: the streams of one movie.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionDescription {
    pub media: Vec<MediaDescription>,
}

impl SessionDescription {
    pub fn new(media: Vec<MediaDescription>) -> Self {
        Self { media }
    }
}
