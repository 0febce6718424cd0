//! RawSocket framing.
//!
//! Stream carriers (plain TCP, Unix sockets) have no message boundaries, so
//! each message is prefixed with a 4-byte header:
//! - 1 byte: frame kind (message, ping, pong)
//! - 3 bytes: big-endian payload length
//!
//! A connection starts with a 4-byte handshake in each direction carrying
//! the `0x7F` magic, the maximum frame length the sender accepts and the
//! serializer id.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Maximum frame size (16 MiB minus one, the largest 24-bit length).
pub const MAX_FRAME_SIZE: usize = (1 << 24) - 1;

/// Frame header size in bytes.
pub const HEADER_SIZE: usize = 4;

/// First octet of every handshake.
pub const MAGIC: u8 = 0x7F;

/// Serializer ids carried in the handshake.
pub const SERIALIZER_JSON: u8 = 1;
pub const SERIALIZER_MSGPACK: u8 = 2;

/// Frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Message = 0,
    Ping = 1,
    Pong = 2,
}

impl From<FrameKind> for u8 {
    fn from(kind: FrameKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(FrameKind::Message),
            1 => Ok(FrameKind::Ping),
            2 => Ok(FrameKind::Pong),
            other => Err(ProtocolError::InvalidFrame(format!(
                "unknown frame kind {other}"
            ))),
        }
    }
}

/// Encode a frame to bytes.
///
/// # Errors
///
/// Returns an error if the payload is too large.
pub fn encode(kind: FrameKind, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    encode_into(kind, payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// # Errors
///
/// Returns an error if the payload is too large.
pub fn encode_into(kind: FrameKind, payload: &[u8], buf: &mut BytesMut) -> Result<(), ProtocolError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(HEADER_SIZE + payload.len());
    buf.put_u8(kind.into());
    buf.put_uint(payload.len() as u64, 3);
    buf.extend_from_slice(payload);

    Ok(())
}

fn read_header(data: &[u8]) -> Result<(FrameKind, usize), ProtocolError> {
    let kind = FrameKind::try_from(data[0])?;
    let length = (usize::from(data[1]) << 16) | (usize::from(data[2]) << 8) | usize::from(data[3]);
    Ok((kind, length))
}

/// Decode a single frame from bytes.
///
/// # Errors
///
/// Returns an error if the data is incomplete or the header is invalid.
pub fn decode(data: &[u8]) -> Result<(FrameKind, Bytes), ProtocolError> {
    if data.len() < HEADER_SIZE {
        return Err(ProtocolError::Incomplete(HEADER_SIZE - data.len()));
    }

    let (kind, length) = read_header(data)?;
    let total_size = HEADER_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    Ok((kind, Bytes::copy_from_slice(&data[HEADER_SIZE..total_size])))
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(frame))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
/// `max_length` is the limit this side announced in its handshake.
///
/// # Errors
///
/// Returns an error if the frame exceeds `max_length` or the header is invalid.
pub fn decode_from(
    buf: &mut BytesMut,
    max_length: usize,
) -> Result<Option<(FrameKind, Bytes)>, ProtocolError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let (kind, length) = read_header(buf)?;
    if length > max_length {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = HEADER_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(HEADER_SIZE);
    let payload = buf.split_to(length).freeze();

    Ok(Some((kind, payload)))
}

/// One side of the opening handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// Proposal or acceptance: length exponent (0..=15) and serializer id.
    Hello { length_exponent: u8, serializer: u8 },
    /// Refusal with an error code.
    Refused(HandshakeError),
}

/// Error codes a router may answer the handshake with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeError {
    SerializerUnsupported = 1,
    MaxLengthUnacceptable = 2,
    ReservedBitsUsed = 3,
    ConnectionLimitReached = 4,
}

impl Handshake {
    /// Maximum frame length announced by a length exponent: `2^(9 + exp)`.
    #[must_use]
    pub fn max_length(length_exponent: u8) -> usize {
        (1usize << (9 + usize::from(length_exponent.min(15)))).min(MAX_FRAME_SIZE)
    }

    /// Encode the 4 handshake octets.
    #[must_use]
    pub fn encode(&self) -> [u8; 4] {
        match *self {
            Handshake::Hello {
                length_exponent,
                serializer,
            } => [MAGIC, (length_exponent.min(15) << 4) | (serializer & 0x0F), 0, 0],
            Handshake::Refused(error) => [MAGIC, (error as u8) << 4, 0, 0],
        }
    }

    /// Decode the 4 handshake octets.
    ///
    /// # Errors
    ///
    /// Returns an error on a bad magic octet, reserved bits or an unknown
    /// refusal code.
    pub fn decode(octets: [u8; 4]) -> Result<Self, ProtocolError> {
        if octets[0] != MAGIC {
            return Err(ProtocolError::InvalidFrame(format!(
                "bad handshake magic {:#04x}",
                octets[0]
            )));
        }
        if octets[2] != 0 || octets[3] != 0 {
            return Err(ProtocolError::InvalidFrame(
                "reserved handshake bits are set".into(),
            ));
        }

        let high = octets[1] >> 4;
        let low = octets[1] & 0x0F;
        if low != 0 {
            return Ok(Handshake::Hello {
                length_exponent: high,
                serializer: low,
            });
        }

        let error = match high {
            1 => HandshakeError::SerializerUnsupported,
            2 => HandshakeError::MaxLengthUnacceptable,
            3 => HandshakeError::ReservedBitsUsed,
            4 => HandshakeError::ConnectionLimitReached,
            other => {
                return Err(ProtocolError::InvalidFrame(format!(
                    "unknown handshake error {other}"
                )))
            }
        };
        Ok(Handshake::Refused(error))
    }
}
