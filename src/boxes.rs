//! ISO-BMFF box construction and the track registry.
//!
//! The [`BoxBuilder`] turns a parsed session description into movie
//! initialization boxes (ftyp + moov) and each elementary access unit into
//! fragment boxes (moof + mdat). It owns the per-track muxing state: track
//! ids are assigned 1..=n in media announcement order, and every fragment
//! header advances that track's base decode time.
//!
//! ```text
//! Initialization:   ftyp
//!                   moov (mvhd, one trak per stream, mvex)
//!
//! Per access unit:  moof (mfhd, traf { tfhd, tfdt, trun })
//!                   mdat (raw payload)
//! ```

use bytes::Bytes;

use crate::error::MuxError;
use crate::session::{CodecParams, MediaDescription, MediaKind, SessionDescription};

/// Seconds between the Unix epoch and the ISO-BMFF epoch (1904-01-01).
pub const MP4_EPOCH_OFFSET: u64 = 2_082_852_000;

/// Movie-header timescale. Track timestamps use each track's clock rate.
const MOVIE_TIMESCALE: u32 = 1000;

/// Timestamp steps beyond this many seconds (reordering, source restarts)
/// fall back to the track's default sample duration.
const MAX_TIMESTAMP_STEP_SECS: u32 = 10;

/// Per-track muxing state, owned by the box builder.
#[derive(Debug, Clone)]
pub struct Track {
    pub track_id: u32,
    /// Running total of decoded time units, written to each tfdt.
    pub base_decode_time: u64,
    pub clock_rate: u32,
    /// Announced bandwidth in kbit/s (0 when the description had none).
    pub bitrate: u32,
    /// Announced frame rate (0.0 when the description had none).
    pub framerate: f64,
    kind: MediaKind,
    codec: CodecParams,
    payload_type: u8,
    last_timestamp: Option<u32>,
    default_duration: u32,
}

/// Builds movie and fragment boxes and keeps the track registry.
#[derive(Debug)]
pub struct BoxBuilder {
    tracks: Vec<Track>,
    video_track_id: Option<u32>,
    sequence_number: u32,
}

impl Default for BoxBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BoxBuilder {
    pub fn new() -> Self {
        Self {
            tracks: Vec::new(),
            video_track_id: None,
            sequence_number: 1,
        }
    }

    /// Build the initialization boxes for a new movie.
    ///
    /// Replaces the track registry with one entry per media description and
    /// restarts the fragment sequence. `creation_time` is in seconds since
    /// the ISO-BMFF epoch (see [`MP4_EPOCH_OFFSET`]).
    pub fn build_movie_init(
        &mut self,
        description: &SessionDescription,
        creation_time: u64,
    ) -> Result<(Bytes, Bytes), MuxError> {
        if description.media.is_empty() {
            return Err(MuxError::EmptySession);
        }

        let mut tracks = Vec::with_capacity(description.media.len());
        for (index, media) in description.media.iter().enumerate() {
            validate_codec(media)?;
            tracks.push(Track {
                track_id: index as u32 + 1,
                base_decode_time: 0,
                clock_rate: media.clock_rate,
                bitrate: media.bitrate.unwrap_or(0),
                framerate: media.framerate.unwrap_or(0.0),
                kind: media.kind,
                codec: media.codec.clone(),
                payload_type: media.payload_type,
                last_timestamp: None,
                default_duration: default_duration(media),
            });
        }
        self.tracks = tracks;
        self.video_track_id = self
            .tracks
            .iter()
            .find(|t| t.kind == MediaKind::Video)
            .map(|t| t.track_id);
        self.sequence_number = 1;

        let mut ftyp = Vec::new();
        self.write_ftyp(&mut ftyp);
        let mut moov = Vec::new();
        self.write_moov(&mut moov, creation_time);
        Ok((ftyp.into(), moov.into()))
    }

    /// Build a fragment header (moof) for one access unit.
    ///
    /// Side effect: derives the sample duration from the timestamp delta to
    /// the track's previous access unit and advances the track's base
    /// decode time past this sample.
    ///
    /// `track_id` must come from [`BoxBuilder::lookup_track_id`]; an id
    /// outside the registry panics.
    pub fn build_fragment_header(
        &mut self,
        track_id: u32,
        timestamp: u32,
        byte_length: usize,
    ) -> Bytes {
        let index = (track_id - 1) as usize;
        let track = &mut self.tracks[index];

        let duration = match track.last_timestamp {
            Some(last) => {
                let delta = timestamp.wrapping_sub(last);
                if delta == 0 || delta > track.clock_rate.saturating_mul(MAX_TIMESTAMP_STEP_SECS) {
                    track.default_duration
                } else {
                    delta
                }
            }
            None => track.default_duration,
        };
        track.last_timestamp = Some(timestamp);
        let base_decode_time = track.base_decode_time;

        let mut buf = Vec::new();
        self.write_moof(
            &mut buf,
            track_id,
            base_decode_time,
            duration,
            byte_length as u32,
        );

        self.tracks[index].base_decode_time += u64::from(duration);
        self.sequence_number += 1;
        buf.into()
    }

    /// Build a media-data box (mdat) wrapping the raw payload.
    pub fn build_media_data(&self, payload: &[u8]) -> Bytes {
        let mut buf = Vec::with_capacity(8 + payload.len());
        let size = 8 + payload.len();
        buf.extend_from_slice(&(size as u32).to_be_bytes());
        buf.extend_from_slice(b"mdat");
        buf.extend_from_slice(payload);
        buf.into()
    }

    /// Resolve a payload identifier to its track id, if announced.
    pub fn lookup_track_id(&self, payload_type: u8) -> Option<u32> {
        self.tracks
            .iter()
            .find(|t| t.payload_type == payload_type)
            .map(|t| t.track_id)
    }

    /// The track registry, in track-id order.
    pub fn track_table(&self) -> &[Track] {
        &self.tracks
    }

    /// Look up a track by id.
    pub fn track(&self, track_id: u32) -> Option<&Track> {
        self.tracks.get(track_id.checked_sub(1)? as usize)
    }

    /// Id of the first video track, used to seed presentation timing.
    pub fn video_track_id(&self) -> Option<u32> {
        self.video_track_id
    }

    // ========================================
    // Box writing helpers
    // ========================================

    fn write_ftyp(&self, buf: &mut Vec<u8>) {
        let brands = [
            b"isom", // ISO Base Media
            b"iso6", // ISO with fragments
            b"avc1", // H.264
            b"mp41", // MP4 v1
        ];

        let size = 8 + 4 + 4 + (brands.len() * 4);
        buf.extend_from_slice(&(size as u32).to_be_bytes());
        buf.extend_from_slice(b"ftyp");
        buf.extend_from_slice(b"isom"); // major brand
        buf.extend_from_slice(&0u32.to_be_bytes()); // minor version
        for brand in &brands {
            buf.extend_from_slice(*brand);
        }
    }

    fn write_moov(&self, buf: &mut Vec<u8>, creation_time: u64) {
        let mut moov_content = Vec::new();

        self.write_mvhd(&mut moov_content, creation_time);
        for track in &self.tracks {
            self.write_trak(&mut moov_content, track, creation_time);
        }
        self.write_mvex(&mut moov_content);

        let size = 8 + moov_content.len();
        buf.extend_from_slice(&(size as u32).to_be_bytes());
        buf.extend_from_slice(b"moov");
        buf.extend_from_slice(&moov_content);
    }

    fn write_mvhd(&self, buf: &mut Vec<u8>, creation_time: u64) {
        let mut content = Vec::new();

        content.push(0); // version
        content.extend_from_slice(&[0, 0, 0]); // flags

        content.extend_from_slice(&(creation_time as u32).to_be_bytes());
        content.extend_from_slice(&(creation_time as u32).to_be_bytes()); // modification time
        content.extend_from_slice(&MOVIE_TIMESCALE.to_be_bytes());
        content.extend_from_slice(&0u32.to_be_bytes()); // duration (unknown for live)

        content.extend_from_slice(&0x00010000u32.to_be_bytes()); // rate (1.0)
        content.extend_from_slice(&0x0100u16.to_be_bytes()); // volume (1.0)
        content.extend_from_slice(&[0; 2]); // reserved
        content.extend_from_slice(&[0; 8]); // reserved

        // Matrix (identity)
        let matrix: [u32; 9] = [0x00010000, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000];
        for m in &matrix {
            content.extend_from_slice(&m.to_be_bytes());
        }

        content.extend_from_slice(&[0; 24]); // pre_defined
        content.extend_from_slice(&(self.tracks.len() as u32 + 1).to_be_bytes()); // next_track_id

        let size = 8 + content.len();
        buf.extend_from_slice(&(size as u32).to_be_bytes());
        buf.extend_from_slice(b"mvhd");
        buf.extend_from_slice(&content);
    }

    fn write_trak(&self, buf: &mut Vec<u8>, track: &Track, creation_time: u64) {
        let mut trak_content = Vec::new();

        self.write_tkhd(&mut trak_content, track, creation_time);
        self.write_mdia(&mut trak_content, track, creation_time);

        let size = 8 + trak_content.len();
        buf.extend_from_slice(&(size as u32).to_be_bytes());
        buf.extend_from_slice(b"trak");
        buf.extend_from_slice(&trak_content);
    }

    fn write_tkhd(&self, buf: &mut Vec<u8>, track: &Track, creation_time: u64) {
        let (width, height) = match track.codec {
            CodecParams::H264 { width, height, .. } => (width, height),
            CodecParams::Aac { .. } => (0, 0),
        };
        let volume: u16 = match track.kind {
            MediaKind::Audio => 0x0100,
            MediaKind::Video => 0,
        };

        let mut content = Vec::new();

        content.push(0); // version
        content.extend_from_slice(&[0, 0, 3]); // flags (track enabled, in movie)

        content.extend_from_slice(&(creation_time as u32).to_be_bytes());
        content.extend_from_slice(&(creation_time as u32).to_be_bytes()); // modification time
        content.extend_from_slice(&track.track_id.to_be_bytes());
        content.extend_from_slice(&0u32.to_be_bytes()); // reserved
        content.extend_from_slice(&0u32.to_be_bytes()); // duration (unknown)

        content.extend_from_slice(&[0; 8]); // reserved
        content.extend_from_slice(&0i16.to_be_bytes()); // layer
        content.extend_from_slice(&0i16.to_be_bytes()); // alternate_group
        content.extend_from_slice(&volume.to_be_bytes());
        content.extend_from_slice(&0u16.to_be_bytes()); // reserved

        // Matrix
        let matrix: [u32; 9] = [0x00010000, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000];
        for m in &matrix {
            content.extend_from_slice(&m.to_be_bytes());
        }

        // Width and height as 16.16 fixed point
        content.extend_from_slice(&(width << 16).to_be_bytes());
        content.extend_from_slice(&(height << 16).to_be_bytes());

        let size = 8 + content.len();
        buf.extend_from_slice(&(size as u32).to_be_bytes());
        buf.extend_from_slice(b"tkhd");
        buf.extend_from_slice(&content);
    }

    fn write_mdia(&self, buf: &mut Vec<u8>, track: &Track, creation_time: u64) {
        let mut mdia_content = Vec::new();

        self.write_mdhd(&mut mdia_content, track, creation_time);
        self.write_hdlr(&mut mdia_content, track);
        self.write_minf(&mut mdia_content, track);

        let size = 8 + mdia_content.len();
        buf.extend_from_slice(&(size as u32).to_be_bytes());
        buf.extend_from_slice(b"mdia");
        buf.extend_from_slice(&mdia_content);
    }

    fn write_mdhd(&self, buf: &mut Vec<u8>, track: &Track, creation_time: u64) {
        let mut content = Vec::new();

        content.push(0); // version
        content.extend_from_slice(&[0, 0, 0]); // flags

        content.extend_from_slice(&(creation_time as u32).to_be_bytes());
        content.extend_from_slice(&(creation_time as u32).to_be_bytes()); // modification time
        content.extend_from_slice(&track.clock_rate.to_be_bytes()); // timescale
        content.extend_from_slice(&0u32.to_be_bytes()); // duration

        content.extend_from_slice(&0x55c4u16.to_be_bytes()); // language (und)
        content.extend_from_slice(&0u16.to_be_bytes()); // pre_defined

        let size = 8 + content.len();
        buf.extend_from_slice(&(size as u32).to_be_bytes());
        buf.extend_from_slice(b"mdhd");
        buf.extend_from_slice(&content);
    }

    fn write_hdlr(&self, buf: &mut Vec<u8>, track: &Track) {
        let (handler, name): (&[u8; 4], &[u8]) = match track.kind {
            MediaKind::Video => (b"vide", b"VideoHandler\0"),
            MediaKind::Audio => (b"soun", b"SoundHandler\0"),
        };

        let mut content = Vec::new();

        content.push(0); // version
        content.extend_from_slice(&[0, 0, 0]); // flags
        content.extend_from_slice(&0u32.to_be_bytes()); // pre_defined
        content.extend_from_slice(handler); // handler_type
        content.extend_from_slice(&[0; 12]); // reserved
        content.extend_from_slice(name);

        let size = 8 + content.len();
        buf.extend_from_slice(&(size as u32).to_be_bytes());
        buf.extend_from_slice(b"hdlr");
        buf.extend_from_slice(&content);
    }

    fn write_minf(&self, buf: &mut Vec<u8>, track: &Track) {
        let mut minf_content = Vec::new();

        match track.kind {
            MediaKind::Video => self.write_vmhd(&mut minf_content),
            MediaKind::Audio => self.write_smhd(&mut minf_content),
        }
        self.write_dinf(&mut minf_content);
        self.write_stbl(&mut minf_content, track);

        let size = 8 + minf_content.len();
        buf.extend_from_slice(&(size as u32).to_be_bytes());
        buf.extend_from_slice(b"minf");
        buf.extend_from_slice(&minf_content);
    }

    fn write_vmhd(&self, buf: &mut Vec<u8>) {
        let mut content = Vec::new();

        content.push(0); // version
        content.extend_from_slice(&[0, 0, 1]); // flags
        content.extend_from_slice(&0u16.to_be_bytes()); // graphics_mode
        content.extend_from_slice(&[0; 6]); // opcolor

        let size = 8 + content.len();
        buf.extend_from_slice(&(size as u32).to_be_bytes());
        buf.extend_from_slice(b"vmhd");
        buf.extend_from_slice(&content);
    }

    fn write_smhd(&self, buf: &mut Vec<u8>) {
        let mut content = Vec::new();

        content.push(0); // version
        content.extend_from_slice(&[0, 0, 0]); // flags
        content.extend_from_slice(&0i16.to_be_bytes()); // balance
        content.extend_from_slice(&0u16.to_be_bytes()); // reserved

        let size = 8 + content.len();
        buf.extend_from_slice(&(size as u32).to_be_bytes());
        buf.extend_from_slice(b"smhd");
        buf.extend_from_slice(&content);
    }

    fn write_dinf(&self, buf: &mut Vec<u8>) {
        let mut dinf_content = Vec::new();

        // dref box
        let mut dref_content = Vec::new();
        dref_content.push(0); // version
        dref_content.extend_from_slice(&[0, 0, 0]); // flags
        dref_content.extend_from_slice(&1u32.to_be_bytes()); // entry_count

        // url entry (self-contained)
        dref_content.extend_from_slice(&12u32.to_be_bytes()); // size
        dref_content.extend_from_slice(b"url ");
        dref_content.push(0); // version
        dref_content.extend_from_slice(&[0, 0, 1]); // flags (self-contained)

        let dref_size = 8 + dref_content.len();
        dinf_content.extend_from_slice(&(dref_size as u32).to_be_bytes());
        dinf_content.extend_from_slice(b"dref");
        dinf_content.extend_from_slice(&dref_content);

        let size = 8 + dinf_content.len();
        buf.extend_from_slice(&(size as u32).to_be_bytes());
        buf.extend_from_slice(b"dinf");
        buf.extend_from_slice(&dinf_content);
    }

    fn write_stbl(&self, buf: &mut Vec<u8>, track: &Track) {
        let mut stbl_content = Vec::new();

        self.write_stsd(&mut stbl_content, track);
        self.write_empty_stts(&mut stbl_content);
        self.write_empty_stsc(&mut stbl_content);
        self.write_empty_stsz(&mut stbl_content);
        self.write_empty_stco(&mut stbl_content);

        let size = 8 + stbl_content.len();
        buf.extend_from_slice(&(size as u32).to_be_bytes());
        buf.extend_from_slice(b"stbl");
        buf.extend_from_slice(&stbl_content);
    }

    fn write_stsd(&self, buf: &mut Vec<u8>, track: &Track) {
        let mut stsd_content = Vec::new();

        stsd_content.push(0); // version
        stsd_content.extend_from_slice(&[0, 0, 0]); // flags
        stsd_content.extend_from_slice(&1u32.to_be_bytes()); // entry_count

        match &track.codec {
            CodecParams::H264 {
                sps,
                pps,
                width,
                height,
            } => self.write_avc1(&mut stsd_content, sps, pps, *width, *height),
            CodecParams::Aac {
                audio_specific_config,
                channels,
            } => self.write_mp4a(&mut stsd_content, track, audio_specific_config, *channels),
        }

        let size = 8 + stsd_content.len();
        buf.extend_from_slice(&(size as u32).to_be_bytes());
        buf.extend_from_slice(b"stsd");
        buf.extend_from_slice(&stsd_content);
    }

    fn write_avc1(&self, buf: &mut Vec<u8>, sps: &[u8], pps: &[u8], width: u32, height: u32) {
        let mut avc1_content = Vec::new();

        avc1_content.extend_from_slice(&[0; 6]); // reserved
        avc1_content.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index

        avc1_content.extend_from_slice(&0u16.to_be_bytes()); // pre_defined
        avc1_content.extend_from_slice(&0u16.to_be_bytes()); // reserved
        avc1_content.extend_from_slice(&[0; 12]); // pre_defined

        avc1_content.extend_from_slice(&(width as u16).to_be_bytes());
        avc1_content.extend_from_slice(&(height as u16).to_be_bytes());

        avc1_content.extend_from_slice(&0x00480000u32.to_be_bytes()); // horiz resolution 72 dpi
        avc1_content.extend_from_slice(&0x00480000u32.to_be_bytes()); // vert resolution 72 dpi
        avc1_content.extend_from_slice(&0u32.to_be_bytes()); // reserved
        avc1_content.extend_from_slice(&1u16.to_be_bytes()); // frame_count

        // Compressor name (32 bytes)
        let mut compressor = [0u8; 32];
        let name = b"livemux";
        compressor[0] = name.len() as u8;
        compressor[1..1 + name.len()].copy_from_slice(name);
        avc1_content.extend_from_slice(&compressor);

        avc1_content.extend_from_slice(&0x0018u16.to_be_bytes()); // depth (24-bit)
        avc1_content.extend_from_slice(&(-1i16).to_be_bytes()); // pre_defined

        self.write_avcc(&mut avc1_content, sps, pps);

        let size = 8 + avc1_content.len();
        buf.extend_from_slice(&(size as u32).to_be_bytes());
        buf.extend_from_slice(b"avc1");
        buf.extend_from_slice(&avc1_content);
    }

    fn write_avcc(&self, buf: &mut Vec<u8>, sps: &[u8], pps: &[u8]) {
        let mut avcc_content = Vec::new();

        avcc_content.push(1); // configuration_version

        // Profile, compatibility, and level from SPS
        avcc_content.push(sps[1]); // profile_idc
        avcc_content.push(sps[2]); // profile_compatibility
        avcc_content.push(sps[3]); // level_idc

        avcc_content.push(0xFF); // length_size_minus_one (3 = 4 bytes) | reserved (0b111111)

        // SPS
        avcc_content.push(0xE1); // num_sps | reserved (0b111)
        avcc_content.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        avcc_content.extend_from_slice(sps);

        // PPS
        avcc_content.push(1); // num_pps
        avcc_content.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        avcc_content.extend_from_slice(pps);

        let size = 8 + avcc_content.len();
        buf.extend_from_slice(&(size as u32).to_be_bytes());
        buf.extend_from_slice(b"avcC");
        buf.extend_from_slice(&avcc_content);
    }

    fn write_mp4a(&self, buf: &mut Vec<u8>, track: &Track, config: &[u8], channels: u16) {
        let mut mp4a_content = Vec::new();

        mp4a_content.extend_from_slice(&[0; 6]); // reserved
        mp4a_content.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index

        mp4a_content.extend_from_slice(&[0; 8]); // reserved
        mp4a_content.extend_from_slice(&channels.to_be_bytes());
        mp4a_content.extend_from_slice(&16u16.to_be_bytes()); // sample size
        mp4a_content.extend_from_slice(&0u16.to_be_bytes()); // pre_defined
        mp4a_content.extend_from_slice(&0u16.to_be_bytes()); // reserved

        // Sample rate as 16.16 fixed point
        mp4a_content.extend_from_slice(&(track.clock_rate << 16).to_be_bytes());

        self.write_esds(&mut mp4a_content, track, config);

        let size = 8 + mp4a_content.len();
        buf.extend_from_slice(&(size as u32).to_be_bytes());
        buf.extend_from_slice(b"mp4a");
        buf.extend_from_slice(&mp4a_content);
    }

    fn write_esds(&self, buf: &mut Vec<u8>, track: &Track, config: &[u8]) {
        let bitrate = track.bitrate * 1000; // kbit/s to bit/s

        let decoder_config_len = 13 + 2 + config.len();
        let es_len = 3 + (2 + decoder_config_len) + 3;

        let mut content = Vec::new();

        content.push(0); // version
        content.extend_from_slice(&[0, 0, 0]); // flags

        // ES_Descriptor
        content.push(0x03);
        content.push(es_len as u8);
        content.extend_from_slice(&(track.track_id as u16).to_be_bytes()); // ES_ID
        content.push(0); // stream dependence / URL / OCR flags

        // DecoderConfigDescriptor
        content.push(0x04);
        content.push(decoder_config_len as u8);
        content.push(0x40); // object_type: MPEG-4 AAC
        content.push(0x15); // stream_type: audio, upStream 0, reserved 1
        content.extend_from_slice(&[0, 0, 0]); // buffer_size_db
        content.extend_from_slice(&bitrate.to_be_bytes()); // max_bitrate
        content.extend_from_slice(&bitrate.to_be_bytes()); // avg_bitrate

        // DecoderSpecificInfo (AudioSpecificConfig)
        content.push(0x05);
        content.push(config.len() as u8);
        content.extend_from_slice(config);

        // SLConfigDescriptor (MP4 predefined)
        content.push(0x06);
        content.push(0x01);
        content.push(0x02);

        let size = 8 + content.len();
        buf.extend_from_slice(&(size as u32).to_be_bytes());
        buf.extend_from_slice(b"esds");
        buf.extend_from_slice(&content);
    }

    fn write_mvex(&self, buf: &mut Vec<u8>) {
        let mut mvex_content = Vec::new();
        for track in &self.tracks {
            let mut c = Vec::new();
            c.push(0); // version
            c.extend_from_slice(&[0, 0, 0]); // flags
            c.extend_from_slice(&track.track_id.to_be_bytes());
            c.extend_from_slice(&1u32.to_be_bytes()); // default_sample_description_index
            c.extend_from_slice(&0u32.to_be_bytes()); // default_sample_duration
            c.extend_from_slice(&0u32.to_be_bytes()); // default_sample_size
            c.extend_from_slice(&0u32.to_be_bytes()); // default_sample_flags
            let s = 8 + c.len();
            mvex_content.extend_from_slice(&(s as u32).to_be_bytes());
            mvex_content.extend_from_slice(b"trex");
            mvex_content.extend_from_slice(&c);
        }
        let size = 8 + mvex_content.len();
        buf.extend_from_slice(&(size as u32).to_be_bytes());
        buf.extend_from_slice(b"mvex");
        buf.extend_from_slice(&mvex_content);
    }

    fn write_moof(
        &self,
        buf: &mut Vec<u8>,
        track_id: u32,
        base_decode_time: u64,
        duration: u32,
        sample_size: u32,
    ) {
        // One sample per fragment - sizes are fixed, so data_offset can be
        // computed up front.
        let tfhd_size = 8 + 8; // version/flags + track_id
        let tfdt_size = 8 + 12; // version/flags + 64-bit time
        let trun_size = 8 + 4 + 4 + 4 + 8; // version/flags + count + offset + (duration, size)
        let traf_size = 8 + tfhd_size + tfdt_size + trun_size;
        let mfhd_size = 8 + 8;
        let moof_size = 8 + mfhd_size + traf_size;

        // data_offset is from start of moof to the first mdat payload byte
        let data_offset = (moof_size + 8) as u32;

        buf.extend_from_slice(&(moof_size as u32).to_be_bytes());
        buf.extend_from_slice(b"moof");

        // mfhd
        {
            let mut c = Vec::new();
            c.push(0); // version
            c.extend_from_slice(&[0, 0, 0]); // flags
            c.extend_from_slice(&self.sequence_number.to_be_bytes());
            buf.extend_from_slice(&(mfhd_size as u32).to_be_bytes());
            buf.extend_from_slice(b"mfhd");
            buf.extend_from_slice(&c);
        }

        // traf
        buf.extend_from_slice(&(traf_size as u32).to_be_bytes());
        buf.extend_from_slice(b"traf");

        // tfhd
        {
            let mut c = Vec::new();
            c.push(0); // version
            c.extend_from_slice(&[0x02, 0x00, 0x00]); // default-base-is-moof
            c.extend_from_slice(&track_id.to_be_bytes());
            buf.extend_from_slice(&(tfhd_size as u32).to_be_bytes());
            buf.extend_from_slice(b"tfhd");
            buf.extend_from_slice(&c);
        }

        // tfdt
        {
            let mut c = Vec::new();
            c.push(1); // version 1 for 64-bit time
            c.extend_from_slice(&[0, 0, 0]);
            c.extend_from_slice(&base_decode_time.to_be_bytes());
            buf.extend_from_slice(&(tfdt_size as u32).to_be_bytes());
            buf.extend_from_slice(b"tfdt");
            buf.extend_from_slice(&c);
        }

        // trun
        {
            let mut c = Vec::new();
            c.push(0); // version
            c.extend_from_slice(&[0x00, 0x03, 0x01]); // flags: data-offset + duration + size
            c.extend_from_slice(&1u32.to_be_bytes()); // sample_count
            c.extend_from_slice(&data_offset.to_be_bytes());
            c.extend_from_slice(&duration.to_be_bytes());
            c.extend_from_slice(&sample_size.to_be_bytes());
            buf.extend_from_slice(&(trun_size as u32).to_be_bytes());
            buf.extend_from_slice(b"trun");
            buf.extend_from_slice(&c);
        }
    }
}

fn validate_codec(media: &MediaDescription) -> Result<(), MuxError> {
    match &media.codec {
        CodecParams::H264 { sps, pps, .. } => {
            // avcC pulls profile/compatibility/level from SPS bytes 1..4
            if sps.len() < 4 {
                return Err(MuxError::InvalidCodecConfig {
                    encoding: media.encoding.clone(),
                    reason: "SPS shorter than 4 bytes",
                });
            }
            if pps.is_empty() {
                return Err(MuxError::InvalidCodecConfig {
                    encoding: media.encoding.clone(),
                    reason: "empty PPS",
                });
            }
        }
        CodecParams::Aac {
            audio_specific_config,
            ..
        } => {
            if audio_specific_config.is_empty() {
                return Err(MuxError::InvalidCodecConfig {
                    encoding: media.encoding.clone(),
                    reason: "empty AudioSpecificConfig",
                });
            }
        }
    }
    Ok(())
}

fn default_duration(media: &MediaDescription) -> u32 {
    match media.framerate {
        Some(rate) if rate > 0.0 => (media.clock_rate as f64 / rate).round() as u32,
        _ => match media.kind {
            // AAC access units span 1024 samples
            MediaKind::Audio => 1024,
            // assume 30 fps until timestamp deltas are observed
            MediaKind::Video => media.clock_rate / 30,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn video_media(payload_type: u8) -> MediaDescription {
        MediaDescription {
            kind: MediaKind::Video,
            payload_type,
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
        }
    }

    fn audio_media(payload_type: u8) -> MediaDescription {
        MediaDescription {
            kind: MediaKind::Audio,
            payload_type,
            encoding: "MPEG4-GENERIC".to_string(),
            clock_rate: 48000,
            bitrate: Some(128),
            framerate: None,
            codec: CodecParams::Aac {
                audio_specific_config: Bytes::from_static(&[0x11, 0x90]),
                channels: 2,
            },
        }
    }

    fn session() -> SessionDescription {
        SessionDescription::new(vec![video_media(96), audio_media(97)])
    }

    fn find_tag(data: &[u8], tag: &[u8; 4]) -> Option<usize> {
        data.windows(4).position(|w| w == tag)
    }

    fn count_tag(data: &[u8], tag: &[u8; 4]) -> usize {
        data.windows(4).filter(|w| *w == tag).count()
    }

    #[test]
    fn test_ftyp_box() {
        let builder = BoxBuilder::new();
        let mut buf = Vec::new();
        builder.write_ftyp(&mut buf);

        let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(&buf[4..8], b"ftyp");
        assert_eq!(size as usize, buf.len());
        assert_eq!(&buf[8..12], b"isom");
    }

    #[test]
    fn test_movie_init_layout() {
        let mut builder = BoxBuilder::new();
        let (ftyp, moov) = builder.build_movie_init(&session(), 3_900_000_000).unwrap();

        assert_eq!(&ftyp[4..8], b"ftyp");
        assert_eq!(&moov[4..8], b"moov");
        let size = u32::from_be_bytes([moov[0], moov[1], moov[2], moov[3]]);
        assert_eq!(size as usize, moov.len());

        // One trak + trex per media entry
        assert_eq!(count_tag(&moov, b"trak"), 2);
        assert_eq!(count_tag(&moov, b"trex"), 2);
        assert!(find_tag(&moov, b"mvex").is_some());
        assert!(find_tag(&moov, b"avcC").is_some());
        assert!(find_tag(&moov, b"esds").is_some());
        assert!(find_tag(&moov, b"vmhd").is_some());
        assert!(find_tag(&moov, b"smhd").is_some());
    }

    #[test]
    fn test_track_registry() {
        let mut builder = BoxBuilder::new();
        builder.build_movie_init(&session(), 3_900_000_000).unwrap();

        let tracks = builder.track_table();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].track_id, 1);
        assert_eq!(tracks[1].track_id, 2);
        assert_eq!(tracks[0].clock_rate, 90000);
        assert_eq!(tracks[1].clock_rate, 48000);

        assert_eq!(builder.lookup_track_id(96), Some(1));
        assert_eq!(builder.lookup_track_id(97), Some(2));
        assert_eq!(builder.lookup_track_id(33), None);
        assert_eq!(builder.video_track_id(), Some(1));
        assert_eq!(builder.track(2).unwrap().track_id, 2);
        assert!(builder.track(0).is_none());
        assert!(builder.track(3).is_none());
    }

    #[test]
    fn test_empty_session_rejected() {
        let mut builder = BoxBuilder::new();
        let err = builder
            .build_movie_init(&SessionDescription::default(), 0)
            .unwrap_err();
        assert!(matches!(err, MuxError::EmptySession));
    }

    #[test]
    fn test_short_sps_rejected() {
        let mut media = video_media(96);
        media.codec = CodecParams::H264 {
            sps: Bytes::from_static(&[0x67]),
            pps: Bytes::from_static(&[0x68]),
            width: 1280,
            height: 720,
        };
        let mut builder = BoxBuilder::new();
        let err = builder
            .build_movie_init(&SessionDescription::new(vec![media]), 0)
            .unwrap_err();
        assert!(matches!(err, MuxError::InvalidCodecConfig { .. }));
    }

    #[test]
    fn test_fragment_header_layout() {
        let mut builder = BoxBuilder::new();
        builder.build_movie_init(&session(), 3_900_000_000).unwrap();

        let moof = builder.build_fragment_header(1, 1000, 512);
        let size = u32::from_be_bytes([moof[0], moof[1], moof[2], moof[3]]);
        assert_eq!(size as usize, moof.len());
        assert_eq!(&moof[4..8], b"moof");

        // tfdt carries the pre-fragment decode time (zero for the first)
        let tfdt = find_tag(&moof, b"tfdt").unwrap();
        assert_eq!(moof[tfdt + 4], 1); // version 1, 64-bit
        let time = u64::from_be_bytes(moof[tfdt + 8..tfdt + 16].try_into().unwrap());
        assert_eq!(time, 0);

        // trun carries the sample size and a data_offset past moof + mdat header
        let trun = find_tag(&moof, b"trun").unwrap();
        let data_offset = u32::from_be_bytes(moof[trun + 12..trun + 16].try_into().unwrap());
        assert_eq!(data_offset as usize, moof.len() + 8);
        let sample_size = u32::from_be_bytes(moof[trun + 20..trun + 24].try_into().unwrap());
        assert_eq!(sample_size, 512);
    }

    #[test]
    fn test_decode_time_advances_by_timestamp_delta() {
        let mut builder = BoxBuilder::new();
        builder.build_movie_init(&session(), 3_900_000_000).unwrap();

        // First sample: no previous timestamp, uses the 25 fps default
        builder.build_fragment_header(1, 10_000, 100);
        assert_eq!(builder.track(1).unwrap().base_decode_time, 3600);

        builder.build_fragment_header(1, 13_600, 100);
        assert_eq!(builder.track(1).unwrap().base_decode_time, 7200);

        // Backward step falls back to the default duration
        builder.build_fragment_header(1, 10_000, 100);
        assert_eq!(builder.track(1).unwrap().base_decode_time, 10_800);
    }

    #[test]
    fn test_sequence_number_increments_and_resets() {
        let mut builder = BoxBuilder::new();
        builder.build_movie_init(&session(), 3_900_000_000).unwrap();

        let first = builder.build_fragment_header(1, 0, 1);
        let second = builder.build_fragment_header(1, 3600, 1);

        let seq = |moof: &Bytes| {
            let mfhd = find_tag(moof, b"mfhd").unwrap();
            u32::from_be_bytes(moof[mfhd + 8..mfhd + 12].try_into().unwrap())
        };
        assert_eq!(seq(&first), 1);
        assert_eq!(seq(&second), 2);

        // A new movie restarts the sequence
        builder.build_movie_init(&session(), 3_900_000_000).unwrap();
        let restarted = builder.build_fragment_header(1, 0, 1);
        assert_eq!(seq(&restarted), 1);
        assert_eq!(builder.track(1).unwrap().base_decode_time, 0);
    }

    #[test]
    fn test_mdat_wraps_payload() {
        let builder = BoxBuilder::new();
        let payload = [0xAAu8, 0xBB, 0xCC];
        let mdat = builder.build_media_data(&payload);

        let size = u32::from_be_bytes([mdat[0], mdat[1], mdat[2], mdat[3]]);
        assert_eq!(size as usize, mdat.len());
        assert_eq!(&mdat[4..8], b"mdat");
        assert_eq!(&mdat[8..], &payload);
    }
}
