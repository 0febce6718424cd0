//! Error types for the wire layer.

use thiserror::Error;

use crate::framing::MAX_FRAME_SIZE;

/// Errors raised while converting between native values and a wire format.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("MessagePack encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("MessagePack decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// A text format received a frame that is not valid UTF-8.
    #[error("Frame is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// JSON has no representation for NaN or infinity.
    #[error("JSON cannot carry the non-finite float {0}")]
    NonFiniteFloat(f64),

    /// The value does not have the requested shape.
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),
}

/// Protocol errors that can occur while encoding, decoding or framing messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// The wire value could not be converted.
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// Unknown message type code.
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u64),

    /// The message does not have the layout its type requires.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Invalid RawSocket handshake or frame header.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}
