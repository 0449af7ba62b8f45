//! The muxing stage: a sequential message processor producing an ISO-BMFF
//! byte stream from session descriptions and elementary frames.
//!
//! Arrival of a session description begins a new movie: the stage re-emits
//! the description and follows it with the movie's initialization boxes.
//! Each elementary frame that resolves to an announced track becomes one
//! movie fragment. Everything else passes through untouched.
//!
//! The only state the stage holds itself is the NTP presentation-time
//! anchor: the wall-clock instant corresponding to decode time zero of the
//! current movie, back-projected from the first video frame that carries an
//! NTP timestamp. Downstream consumers use it to map decode times onto
//! real time.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use tracing::debug;

use crate::boxes::{BoxBuilder, MP4_EPOCH_OFFSET};
use crate::error::MuxError;
use crate::message::{InitSegment, MediaFragment, Message};

/// Stateful fragmented-MP4 muxer.
///
/// [`Muxer::process`] must be called once per input message, strictly in
/// arrival order; each call's outputs belong to the byte stream before the
/// next call's. One movie is active at a time; a new session description
/// supersedes the previous movie and clears the presentation-time anchor.
#[derive(Debug)]
pub struct Muxer {
    builder: BoxBuilder,
    ntp_presentation_time: Option<f64>,
    dropped_frames: u64,
}

impl Default for Muxer {
    fn default() -> Self {
        Self::new()
    }
}

impl Muxer {
    pub fn new() -> Self {
        Self {
            builder: BoxBuilder::new(),
            ntp_presentation_time: None,
            dropped_frames: 0,
        }
    }

    /// Process one message, producing zero or more output messages.
    ///
    /// Fails only when the box builder cannot express a session
    /// description; that error is fatal for the movie (a corrupt
    /// initialization segment would invalidate everything after it).
    pub fn process(&mut self, msg: Message) -> Result<Vec<Message>, MuxError> {
        match msg {
            Message::Session(description) => {
                // A new movie: any previously established presentation
                // timing no longer applies.
                self.ntp_presentation_time = None;

                let (ftyp, moov) = self
                    .builder
                    .build_movie_init(&description, mp4_time_now())?;
                debug!(
                    ftyp_len = ftyp.len(),
                    moov_len = moov.len(),
                    tracks = self.builder.track_table().len(),
                    "movie initialization boxes built"
                );

                let mut payload = BytesMut::with_capacity(ftyp.len() + moov.len());
                payload.extend_from_slice(&ftyp);
                payload.extend_from_slice(&moov);

                Ok(vec![
                    Message::Session(description),
                    Message::InitSegment(InitSegment {
                        payload: payload.freeze(),
                        ftyp,
                        moov,
                    }),
                ])
            }
            Message::Elementary(frame) => {
                let Some(track_id) = self.builder.lookup_track_id(frame.payload_type) else {
                    self.dropped_frames += 1;
                    debug!(
                        payload_type = frame.payload_type,
                        dropped = self.dropped_frames,
                        "no track for payload type, dropping frame"
                    );
                    return Ok(Vec::new());
                };

                // Establish the presentation-time anchor from the first
                // video frame that carries an NTP timestamp, before this
                // fragment advances the decode time.
                if self.ntp_presentation_time.is_none()
                    && self.builder.video_track_id() == Some(track_id)
                {
                    if let (Some(ntp), Some(track)) =
                        (frame.ntp_timestamp, self.builder.track(track_id))
                    {
                        let anchor =
                            ntp - 1000.0 * (track.base_decode_time as f64 / track.clock_rate as f64);
                        debug!(anchor, "presentation-time anchor established");
                        self.ntp_presentation_time = Some(anchor);
                    }
                }

                let moof =
                    self.builder
                        .build_fragment_header(track_id, frame.timestamp, frame.payload.len());
                let mdat = self.builder.build_media_data(&frame.payload);

                // moof first, contiguous with mdat: the ordering the
                // ISO-BMFF byte-stream profile requires.
                let mut payload = BytesMut::with_capacity(moof.len() + mdat.len());
                payload.extend_from_slice(&moof);
                payload.extend_from_slice(&mdat);

                Ok(vec![Message::MediaFragment(MediaFragment {
                    payload: payload.freeze(),
                    moof,
                    mdat,
                    ntp_timestamp: frame.ntp_timestamp,
                })])
            }
            other => Ok(vec![other]),
        }
    }

    /// Announced bitrates in kbit/s, one per track in track-id order.
    pub fn bitrates(&self) -> Vec<u32> {
        self.builder.track_table().iter().map(|t| t.bitrate).collect()
    }

    /// Announced frame rates, one per track in track-id order.
    pub fn framerates(&self) -> Vec<f64> {
        self.builder.track_table().iter().map(|t| t.framerate).collect()
    }

    /// NTP timestamp (milliseconds) of decode time zero for the current
    /// movie, once established.
    pub fn ntp_presentation_time(&self) -> Option<f64> {
        self.ntp_presentation_time
    }

    /// Elementary frames dropped because their payload type resolved to no
    /// track.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }
}

/// Current time in seconds since the ISO-BMFF epoch (1904-01-01).
fn mp4_time_now() -> u64 {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    unix + MP4_EPOCH_OFFSET
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ElementaryFrame, OpaqueMessage};
    use crate::session::{CodecParams, MediaDescription, MediaKind, SessionDescription};
    use bytes::Bytes;

    fn session() -> SessionDescription {
        SessionDescription::new(vec![
            MediaDescription {
                kind: MediaKind::Video,
                payload_type: 96,
                encoding: "H264".to_string(),
                clock_rate: 90000,
                bitrate: Some(2000),
                framerate: Some(25.0),
                codec: CodecParams::H264 {
                    sps: Bytes::from_static(&[0x67, 0x64, 0x00, 0x1f, 0xac]),
                    pps: Bytes::from_static(&[0x68, 0xee, 0x3c, 0x80]),
                    width: 1280,
                    height: 720,
                },
            },
            MediaDescription {
                kind: MediaKind::Audio,
                payload_type: 97,
                encoding: "MPEG4-GENERIC".to_string(),
                clock_rate: 48000,
                bitrate: Some(128),
                framerate: None,
                codec: CodecParams::Aac {
                    audio_specific_config: Bytes::from_static(&[0x11, 0x90]),
                    channels: 2,
                },
            },
        ])
    }

    fn video_frame(timestamp: u32, ntp: Option<f64>) -> Message {
        Message::Elementary(ElementaryFrame {
            payload_type: 96,
            timestamp,
            ntp_timestamp: ntp,
            payload: Bytes::from_static(&[0x65, 0x88, 0x80, 0x40]),
        })
    }

    #[test]
    fn test_session_emits_original_then_init() {
        let mut muxer = Muxer::new();
        let out = muxer.process(Message::Session(session())).unwrap();

        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Message::Session(_)));
        let Message::InitSegment(init) = &out[1] else {
            panic!("expected init segment");
        };
        assert_eq!(init.payload.len(), init.ftyp.len() + init.moov.len());
        assert_eq!(&init.payload[..init.ftyp.len()], &init.ftyp[..]);
        assert_eq!(&init.payload[init.ftyp.len()..], &init.moov[..]);
    }

    #[test]
    fn test_fragment_payload_is_moof_then_mdat() {
        let mut muxer = Muxer::new();
        muxer.process(Message::Session(session())).unwrap();

        let out = muxer.process(video_frame(0, None)).unwrap();
        assert_eq!(out.len(), 1);
        let Message::MediaFragment(frag) = &out[0] else {
            panic!("expected media fragment");
        };
        assert_eq!(frag.payload.len(), frag.moof.len() + frag.mdat.len());
        assert_eq!(&frag.payload[..frag.moof.len()], &frag.moof[..]);
        assert_eq!(&frag.payload[frag.moof.len()..], &frag.mdat[..]);
        assert_eq!(&frag.moof[4..8], b"moof");
        assert_eq!(&frag.mdat[4..8], b"mdat");
    }

    #[test]
    fn test_unknown_payload_type_drops_silently() {
        let mut muxer = Muxer::new();
        muxer.process(Message::Session(session())).unwrap();

        let out = muxer
            .process(Message::Elementary(ElementaryFrame {
                payload_type: 33,
                timestamp: 0,
                ntp_timestamp: None,
                payload: Bytes::from_static(&[0x00]),
            }))
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(muxer.dropped_frames(), 1);
    }

    #[test]
    fn test_elementary_before_session_drops() {
        let mut muxer = Muxer::new();
        let out = muxer.process(video_frame(0, Some(5000.0))).unwrap();
        assert!(out.is_empty());
        assert_eq!(muxer.dropped_frames(), 1);
        assert_eq!(muxer.ntp_presentation_time(), None);
    }

    #[test]
    fn test_opaque_forwarded_unchanged() {
        let mut muxer = Muxer::new();
        let msg = Message::Opaque(OpaqueMessage {
            kind: "rtcp".to_string(),
            payload: Bytes::from_static(&[0x80, 0xc8]),
        });
        let out = muxer.process(msg.clone()).unwrap();
        assert_eq!(out, vec![msg]);
    }

    #[test]
    fn test_anchor_scenario() {
        let mut muxer = Muxer::new();

        let out = muxer.process(Message::Session(session())).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(muxer.ntp_presentation_time(), None);

        // First video frame with an NTP timestamp and decode time zero
        let out = muxer.process(video_frame(0, Some(5000.0))).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(muxer.ntp_presentation_time(), Some(5000.0));

        // A later qualifying frame does not move the anchor
        muxer.process(video_frame(3600, Some(9999.0))).unwrap();
        assert_eq!(muxer.ntp_presentation_time(), Some(5000.0));

        // A new session clears it
        muxer.process(Message::Session(session())).unwrap();
        assert_eq!(muxer.ntp_presentation_time(), None);
    }

    #[test]
    fn test_anchor_back_projects_decode_time() {
        let mut muxer = Muxer::new();
        muxer.process(Message::Session(session())).unwrap();

        // Two frames without NTP timestamps advance the decode time:
        // default duration (25 fps @ 90 kHz = 3600) + one 3600 delta.
        muxer.process(video_frame(0, None)).unwrap();
        muxer.process(video_frame(3600, None)).unwrap();

        muxer.process(video_frame(7200, Some(10_000.0))).unwrap();
        // anchor = 10000 - 1000 * (7200 / 90000) = 9920
        assert_eq!(muxer.ntp_presentation_time(), Some(9920.0));
    }

    #[test]
    fn test_audio_frame_does_not_seed_anchor() {
        let mut muxer = Muxer::new();
        muxer.process(Message::Session(session())).unwrap();

        let out = muxer
            .process(Message::Elementary(ElementaryFrame {
                payload_type: 97,
                timestamp: 0,
                ntp_timestamp: Some(5000.0),
                payload: Bytes::from_static(&[0x21, 0x10]),
            }))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(muxer.ntp_presentation_time(), None);

        // The video track still seeds it afterwards
        muxer.process(video_frame(0, Some(6000.0))).unwrap();
        assert_eq!(muxer.ntp_presentation_time(), Some(6000.0));
    }

    #[test]
    fn test_fragment_forwards_ntp_timestamp() {
        let mut muxer = Muxer::new();
        muxer.process(Message::Session(session())).unwrap();

        let out = muxer.process(video_frame(0, Some(1234.5))).unwrap();
        let Message::MediaFragment(frag) = &out[0] else {
            panic!("expected media fragment");
        };
        assert_eq!(frag.ntp_timestamp, Some(1234.5));
    }

    #[test]
    fn test_accessors_follow_track_order() {
        let mut muxer = Muxer::new();
        assert!(muxer.bitrates().is_empty());
        assert!(muxer.framerates().is_empty());

        muxer.process(Message::Session(session())).unwrap();
        assert_eq!(muxer.bitrates(), vec![2000, 128]);
        assert_eq!(muxer.framerates(), vec![25.0, 0.0]);
    }

    #[test]
    fn test_empty_session_is_fatal() {
        let mut muxer = Muxer::new();
        let err = muxer
            .process(Message::Session(SessionDescription::default()))
            .unwrap_err();
        assert!(matches!(err, MuxError::EmptySession));
    }
}
