//! Channel-based driver for the muxing stage.
//!
//! The stage's correctness depends on strict sequencing: one input message
//! is fully processed, and all of its outputs delivered downstream, before
//! the next input is taken. Bounded channels on both sides give that
//! ordering plus backpressure — a slow consumer stalls the stage instead
//! of growing an unbounded buffer.

use tokio::sync::mpsc::{Receiver, Sender};
use tracing::debug;

use crate::error::MuxError;
use crate::message::Message;
use crate::mux::Muxer;

/// Drive a [`Muxer`] from an input channel to an output channel.
///
/// Runs until the input channel closes (returns the muxer so its accessors
/// remain readable), the output channel closes (downstream is gone, also a
/// clean stop), or the box builder fails on a session description — that
/// error is fatal for the movie and terminates the task.
pub async fn run(
    mut muxer: Muxer,
    mut input: Receiver<Message>,
    output: Sender<Message>,
) -> Result<Muxer, MuxError> {
    while let Some(msg) = input.recv().await {
        for out in muxer.process(msg)? {
            if output.send(out).await.is_err() {
                debug!("output channel closed, stopping muxing stage");
                return Ok(muxer);
            }
        }
    }
    debug!("input channel closed, muxing stage done");
    Ok(muxer)
}
