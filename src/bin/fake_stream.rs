//! Fake stream source - drives the muxing stage without a real camera or
//! network input.
//!
//! Synthesizes a two-track session description (H.264 + AAC) and a short
//! run of timestamped elementary frames, pushes them through the channel
//! pipeline, and logs every message that comes out the other side.
//!
//! Usage:
//!   fake-stream [options]
//!
//! Options:
//!   --frames <n>    Number of video frames to synthesize (default: 30)

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::mpsc;

use livemux::{
    CodecParams, ElementaryFrame, MediaDescription, MediaKind, Message, Muxer, OpaqueMessage,
    SessionDescription,
};

fn fake_session() -> SessionDescription {
    SessionDescription::new(vec![
        MediaDescription {
            kind: MediaKind::Video,
            payload_type: 96,
            encoding: "H264".to_string(),
            clock_rate: 90000,
            bitrate: Some(2000),
            framerate: Some(30.0),
            codec: CodecParams::H264 {
                sps: Bytes::from_static(&[0x67, 0x64, 0x00, 0x1f, 0xac, 0xd9, 0x40, 0x50]),
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

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("livemux=debug".parse()?)
                .add_directive("info".parse()?),
        )
        .init();

    let mut frames: u32 = 30;
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--frames" if i + 1 < args.len() => {
                frames = args[i + 1].parse()?;
                i += 2;
            }
            other => {
                anyhow::bail!("unknown argument: {other}");
            }
        }
    }

    let (in_tx, in_rx) = mpsc::channel(8);
    let (out_tx, mut out_rx) = mpsc::channel(8);
    let stage = tokio::spawn(livemux::pipeline::run(Muxer::new(), in_rx, out_tx));

    let feeder = tokio::spawn(async move {
        in_tx.send(Message::Session(fake_session())).await?;

        let base_ntp = 1_000_000.0;
        for n in 0..frames {
            // 30 fps video at 90 kHz
            in_tx
                .send(Message::Elementary(ElementaryFrame {
                    payload_type: 96,
                    timestamp: n * 3000,
                    ntp_timestamp: Some(base_ntp + f64::from(n) * (1000.0 / 30.0)),
                    payload: Bytes::from(vec![0x65; 1200]),
                }))
                .await?;

            // AAC frames at 48 kHz, 1024 samples apart
            in_tx
                .send(Message::Elementary(ElementaryFrame {
                    payload_type: 97,
                    timestamp: n * 1024,
                    ntp_timestamp: None,
                    payload: Bytes::from(vec![0x21; 256]),
                }))
                .await?;
        }

        // Something the muxer does not understand, passed through as-is
        in_tx
            .send(Message::Opaque(OpaqueMessage {
                kind: "rtcp".to_string(),
                payload: Bytes::from_static(&[0x80, 0xc8, 0x00, 0x06]),
            }))
            .await?;
        anyhow::Ok(())
    });

    let mut fragment_count = 0u32;
    let mut byte_count = 0usize;
    while let Some(msg) = out_rx.recv().await {
        match msg {
            Message::Session(_) => tracing::info!("session description forwarded"),
            Message::InitSegment(init) => {
                tracing::info!(
                    payload_len = init.payload.len(),
                    ftyp_len = init.ftyp.len(),
                    moov_len = init.moov.len(),
                    "initialization segment"
                );
                byte_count += init.payload.len();
            }
            Message::MediaFragment(frag) => {
                fragment_count += 1;
                byte_count += frag.payload.len();
                tracing::debug!(
                    payload_len = frag.payload.len(),
                    ntp = frag.ntp_timestamp,
                    "media fragment"
                );
            }
            Message::Elementary(_) => {}
            Message::Opaque(opaque) => tracing::info!(kind = %opaque.kind, "opaque message forwarded"),
        }
    }

    feeder.await??;
    let muxer = stage.await??;
    tracing::info!(
        fragments = fragment_count,
        bytes = byte_count,
        anchor = muxer.ntp_presentation_time(),
        bitrates = ?muxer.bitrates(),
        framerates = ?muxer.framerates(),
        dropped = muxer.dropped_frames(),
        "stream complete"
    );
    Ok(())
}
