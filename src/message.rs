//! Messages flowing through the muxing pipeline.
//!
//! The stage consumes and produces one tagged message type. Session
//! descriptions and elementary frames come in; initialization segments and
//! media fragments go out; anything else passes through untouched.

use bytes::Bytes;

use crate::session::SessionDescription;

/// One elementary-stream access unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementaryFrame {
    /// Payload identifier, resolved to a track via the session description.
    pub payload_type: u8,
    /// Media timestamp in the track's clock rate.
    pub timestamp: u32,
    /// Source NTP wall-clock timestamp in milliseconds, when the transport
    /// provided one.
    pub ntp_timestamp: Option<f64>,
    /// Raw codec payload.
    pub payload: Bytes,
}

/// Movie initialization segment: the ftyp and moov boxes of a new movie.
#[derive(Debug, Clone, PartialEq)]
pub struct InitSegment {
    /// ftyp immediately followed by moov, one contiguous buffer.
    pub payload: Bytes,
    pub ftyp: Bytes,
    pub moov: Bytes,
}

/// One movie fragment: a moof header and its mdat payload.
///
/// `payload` keeps moof first and contiguous with mdat — the ordering the
/// ISO-BMFF byte-stream profile requires, and a single buffer for the
/// transport to hand downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaFragment {
    pub payload: Bytes,
    pub moof: Bytes,
    pub mdat: Bytes,
    /// NTP timestamp of the source frame, forwarded when present.
    pub ntp_timestamp: Option<f64>,
}

/// A message the muxer does not interpret.
#[derive(Debug, Clone, PartialEq)]
pub struct OpaqueMessage {
    /// Tag identifying the message to other pipeline stages.
    pub kind: String,
    pub payload: Bytes,
}

/// The tagged union carried between pipeline stages.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A parsed session description announcing the tracks of a new movie.
    Session(SessionDescription),
    /// One elementary-stream access unit.
    Elementary(ElementaryFrame),
    /// Movie initialization boxes, emitted once per movie.
    InitSegment(InitSegment),
    /// A movie fragment, emitted per muxed access unit.
    MediaFragment(MediaFragment),
    /// Anything else; forwarded verbatim, in place.
    Opaque(OpaqueMessage),
}
