//! Codec for encoding and decoding Herald frames.
//!
//! Client frames are JSON text messages. Each WebSocket message carries
//! exactly one frame, so no length prefix is needed.

use thiserror::Error;

use crate::frames::{ClientMessage, Frame};

/// Maximum inbound frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON error.
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Event name a client is not allowed to send.
    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode a frame to its JSON text form.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(frame: &Frame) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode a frame from JSON text.
///
/// # Errors
///
/// Returns an error if the text is too large or not a valid frame.
pub fn decode(text: &str) -> Result<Frame, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    Ok(serde_json::from_str(text)?)
}

/// Decode and interpret a client frame in one step.
///
/// # Errors
///
/// Returns an error if the frame is malformed or names an event a client
/// may not send.
pub fn decode_client(text: &str) -> Result<ClientMessage, ProtocolError> {
    ClientMessage::from_frame(decode(text)?)
}
