//! Codec for encoding and decoding messages with a [`Formatter`].
//!
//! The codec turns a [`WampMessage`] into its list [`Value`], hands that to
//! the formatter, and wraps the result into a transport frame (and back).

use crate::error::ProtocolError;
use crate::formatter::{Formatter, RawFrame};
use crate::messages::WampMessage;

/// Maximum encoded message size (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Encode a message into a transport frame.
///
/// # Errors
///
/// Returns an error if the message is too large or encoding fails.
pub fn encode<F: Formatter>(formatter: &F, message: &WampMessage) -> Result<RawFrame, ProtocolError> {
    let wire = formatter.serialize(&message.to_value())?;
    let frame = formatter.into_frame(wire);

    if frame.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::FrameTooLarge(frame.len()));
    }

    Ok(frame)
}

/// Decode a message from a transport frame.
///
/// # Errors
///
/// Returns an error if the frame is too large, malformed, or not a valid
/// message.
pub fn decode<F: Formatter>(formatter: &F, frame: RawFrame) -> Result<WampMessage, ProtocolError> {
    if frame.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::FrameTooLarge(frame.len()));
    }

    let wire = formatter.from_frame(frame)?;
    let value = formatter.deserialize(&wire)?;
    WampMessage::from_value(value)
}

/// A formatter bound to the message codec.
#[derive(Debug, Clone, Default)]
pub struct MessageCodec<F> {
    formatter: F,
}

impl<F: Formatter> MessageCodec<F> {
    /// Create a new codec instance.
    #[must_use]
    pub fn new(formatter: F) -> Self {
        Self { formatter }
    }

    /// The formatter backing this codec.
    #[must_use]
    pub fn formatter(&self) -> &F {
        &self.formatter
    }

    /// Encode a message.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self, message: &WampMessage) -> Result<RawFrame, ProtocolError> {
        encode(&self.formatter, message)
    }

    /// Decode a message.
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails.
    pub fn decode(&self, frame: RawFrame) -> Result<WampMessage, ProtocolError> {
        decode(&self.formatter, frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::{JsonFormatter, MsgPackFormatter};
    use crate::messages::MessageType;
    use crate::value::{Dict, Value};

    fn messages() -> Vec<WampMessage> {
        let mut kwargs = Dict::new();
        kwargs.insert("x".into(), Value::Integer(1));

        vec![
            WampMessage::hello("realm1", Dict::new()),
            WampMessage::Welcome {
                session: 9_007_199_254_740_992,
                details: Dict::new(),
            },
            WampMessage::call(1, "com.example.add", vec![2.into(), 3.into()], Dict::new()),
            WampMessage::Result {
                request: 1,
                details: Dict::new(),
                args: vec![5.into()],
                kwargs: Dict::new(),
            },
            WampMessage::publish(2, "com.example.topic", vec![], kwargs.clone()),
            WampMessage::error(
                MessageType::Call,
                3,
                "wamp.error.no_such_procedure",
                vec![],
                Dict::new(),
            ),
            WampMessage::Event {
                subscription: 4,
                publication: 5,
                details: Dict::new(),
                args: vec![],
                kwargs,
            },
            WampMessage::goodbye("wamp.close.goodbye_and_out"),
        ]
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let json = MessageCodec::new(JsonFormatter);
        let msgpack = MessageCodec::new(MsgPackFormatter);

        for message in messages() {
            let frame = json.encode(&message).unwrap();
            assert!(matches!(frame, RawFrame::Text(_)));
            assert_eq!(json.decode(frame).unwrap(), message);

            let frame = msgpack.encode(&message).unwrap();
            assert!(matches!(frame, RawFrame::Binary(_)));
            assert_eq!(msgpack.decode(frame).unwrap(), message);
        }
    }

    #[test]
    fn test_json_wire_layout() {
        let frame = encode(
            &JsonFormatter,
            &WampMessage::call(1, "add", vec![2.into(), 3.into()], Dict::new()),
        )
        .unwrap();
        assert_eq!(frame, RawFrame::Text(r#"[48,1,{},"add",[2,3]]"#.into()));
    }

    #[test]
    fn test_decode_malformed() {
        let result = decode(&JsonFormatter, RawFrame::Text("[48, 1".into()));
        assert!(matches!(result, Err(ProtocolError::Serialization(_))));

        let result = decode(&JsonFormatter, RawFrame::Text("[48, 1]".into()));
        assert!(matches!(result, Err(ProtocolError::InvalidMessage(_))));
    }

    #[test]
    fn test_message_too_large() {
        let payload = "x".repeat(MAX_MESSAGE_SIZE);
        let message = WampMessage::publish(1, "t", vec![payload.into()], Dict::new());
        assert!(matches!(
            encode(&JsonFormatter, &message),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }
}
