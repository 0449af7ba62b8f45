//! Live fragmented-MP4 muxing for elementary audio/video streams.
//!
//! This crate sits in the middle of a real-time media pipeline: upstream it
//! receives a parsed session description and per-frame elementary-stream
//! packets; downstream it emits ISO-BMFF ("fragmented MP4") boxes that
//! low-latency consumers (browser media buffers, segmented HTTP delivery)
//! can play directly. Messages it does not understand pass through
//! unchanged.
//!
//! ```text
//! Session description  ─▶ ┌───────────┐ ─▶ description + ftyp/moov
//! Elementary frames    ─▶ │   Muxer   │ ─▶ moof/mdat fragments
//! Anything else        ─▶ └───────────┘ ─▶ forwarded verbatim
//! ```
//!
//! [`mux::Muxer`] is the sequential core; [`boxes::BoxBuilder`] constructs
//! the boxes and owns the per-track state; [`pipeline::run`] drives the
//! stage between bounded channels with strict ordering and backpressure.

pub mod boxes;
pub mod error;
pub mod message;
pub mod mux;
pub mod pipeline;
pub mod session;

pub use error::MuxError;
pub use message::{ElementaryFrame, InitSegment, MediaFragment, Message, OpaqueMessage};
pub use mux::Muxer;
pub use session::{CodecParams, MediaDescription, MediaKind, SessionDescription};
