//! Error types for the muxing stage.

use thiserror::Error;

/// Errors raised while building movie boxes.
///
/// Box construction is deterministic, so none of these are retryable: a
/// session description that fails here will fail identically every time,
/// and a corrupt initialization segment would invalidate the whole movie.
#[derive(Debug, Error)]
pub enum MuxError {
    /// The session description names no media streams.
    #[error("session description has no media entries")]
    EmptySession,

    /// A media entry carries codec parameters the builder cannot express.
    #[error("invalid codec configuration for {encoding}: {reason}")]
    InvalidCodecConfig {
        /// Encoding name from the session description.
        encoding: String,
        /// What was wrong with the parameters.
        reason: &'static str,
    },
}
