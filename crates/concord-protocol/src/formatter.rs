//! Formatters convert [`Value`]s to and from a concrete wire encoding.
//!
//! A formatter owns everything encoding-specific: the wire value type, how
//! it is produced from the native model, and which transport frame kind
//! carries it. The rest of the router is written once against [`Value`].

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::error::SerializationError;
use crate::value::Value;

/// A transport frame: text or binary payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    Text(String),
    Binary(Bytes),
}

impl RawFrame {
    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            RawFrame::Text(t) => t.len(),
            RawFrame::Binary(b) => b.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload as bytes, for carriers that do not distinguish text frames.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        match self {
            RawFrame::Text(t) => Bytes::from(t),
            RawFrame::Binary(b) => b,
        }
    }
}

/// Converts between the native value model and a wire representation.
pub trait Formatter: Send + Sync + 'static {
    /// The wire representation.
    type Wire: Send + 'static;

    /// Default WebSocket subprotocol / binding name.
    fn subprotocol(&self) -> &'static str;

    /// Serialize a native value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be encoded.
    fn serialize(&self, value: &Value) -> Result<Self::Wire, SerializationError>;

    /// Deserialize a wire value into the native model.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed wire data.
    fn deserialize(&self, wire: &Self::Wire) -> Result<Value, SerializationError>;

    /// Deserialize a wire value straight into a native shape.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed data or a type mismatch.
    fn deserialize_as<T: DeserializeOwned>(&self, wire: &Self::Wire) -> Result<T, SerializationError>
    where
        Self: Sized,
    {
        self.deserialize(wire)?.to_native()
    }

    /// Wrap a wire value into a transport frame.
    fn into_frame(&self, wire: Self::Wire) -> RawFrame;

    /// Extract the wire value from a transport frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot carry this encoding.
    fn from_frame(&self, frame: RawFrame) -> Result<Self::Wire, SerializationError>;
}

/// JSON over text frames (`wamp.2.json`).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    type Wire = String;

    fn subprotocol(&self) -> &'static str {
        "wamp.2.json"
    }

    fn serialize(&self, value: &Value) -> Result<String, SerializationError> {
        ensure_finite(value)?;
        Ok(serde_json::to_string(value)?)
    }

    fn deserialize(&self, wire: &String) -> Result<Value, SerializationError> {
        Ok(serde_json::from_str(wire)?)
    }

    fn into_frame(&self, wire: String) -> RawFrame {
        RawFrame::Text(wire)
    }

    fn from_frame(&self, frame: RawFrame) -> Result<String, SerializationError> {
        match frame {
            RawFrame::Text(text) => Ok(text),
            RawFrame::Binary(bytes) => Ok(std::str::from_utf8(&bytes)?.to_string()),
        }
    }
}

/// serde_json writes NaN and infinity as `null`; refuse them instead.
fn ensure_finite(value: &Value) -> Result<(), SerializationError> {
    match value {
        Value::Float(f) if !f.is_finite() => Err(SerializationError::NonFiniteFloat(*f)),
        Value::List(items) => items.iter().try_for_each(ensure_finite),
        Value::Dict(entries) => entries.values().try_for_each(ensure_finite),
        _ => Ok(()),
    }
}

/// MessagePack over binary frames (`wamp.2.msgpack`).
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackFormatter;

impl Formatter for MsgPackFormatter {
    type Wire = Bytes;

    fn subprotocol(&self) -> &'static str {
        "wamp.2.msgpack"
    }

    fn serialize(&self, value: &Value) -> Result<Bytes, SerializationError> {
        Ok(Bytes::from(rmp_serde::to_vec(value)?))
    }

    fn deserialize(&self, wire: &Bytes) -> Result<Value, SerializationError> {
        Ok(rmp_serde::from_slice(wire)?)
    }

    fn into_frame(&self, wire: Bytes) -> RawFrame {
        RawFrame::Binary(wire)
    }

    fn from_frame(&self, frame: RawFrame) -> Result<Bytes, SerializationError> {
        Ok(frame.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Dict;
    use serde_json::json;

    fn samples() -> Vec<Value> {
        vec![
            Value::Null,
            Value::Bool(true),
            Value::Integer(0),
            Value::Integer(-42),
            Value::Integer(i64::MAX),
            Value::Float(2.5),
            Value::from("hello"),
            Value::from(""),
            Value::List(vec![Value::Integer(1), Value::from("two"), Value::Null]),
            Value::Dict(Dict::new()),
            Value::from(json!({
                "x": 1,
                "nested": {"list": [1, [2, 3], {"deep": "value"}]},
                "flag": false
            })),
        ]
    }

    #[test]
    fn test_json_roundtrip() {
        let formatter = JsonFormatter;
        for value in samples() {
            let wire = formatter.serialize(&value).unwrap();
            assert_eq!(formatter.deserialize(&wire).unwrap(), value);
        }
    }

    #[test]
    fn test_msgpack_roundtrip() {
        let formatter = MsgPackFormatter;
        for value in samples() {
            let wire = formatter.serialize(&value).unwrap();
            assert_eq!(formatter.deserialize(&wire).unwrap(), value);
        }
    }

    #[test]
    fn test_json_malformed() {
        let formatter = JsonFormatter;
        assert!(formatter.deserialize(&"[1, 2".to_string()).is_err());
    }

    #[test]
    fn test_json_rejects_non_finite_floats() {
        let formatter = JsonFormatter;
        for f in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(
                formatter.serialize(&Value::Float(f)),
                Err(SerializationError::NonFiniteFloat(_))
            ));
        }

        let nested = Value::from(vec![Value::Integer(1), Value::Float(f64::INFINITY)]);
        assert!(formatter.serialize(&nested).is_err());
        assert_eq!(formatter.serialize(&Value::Float(1.5)).unwrap(), "1.5");
    }

    #[test]
    fn test_msgpack_rejects_integer_keys() {
        // fixmap with one entry: 1 => 2
        let wire = Bytes::from_static(&[0x81, 0x01, 0x02]);
        assert!(MsgPackFormatter.deserialize(&wire).is_err());
    }

    #[test]
    fn test_msgpack_rejects_binary() {
        // bin8 of length 2
        let wire = Bytes::from_static(&[0xc4, 0x02, 0xde, 0xad]);
        assert!(MsgPackFormatter.deserialize(&wire).is_err());
    }

    #[test]
    fn test_deserialize_as() {
        let wire = r#"{"a": [1, 2, 3]}"#.to_string();
        let parsed: std::collections::HashMap<String, Vec<u8>> =
            JsonFormatter.deserialize_as(&wire).unwrap();
        assert_eq!(parsed["a"], vec![1, 2, 3]);

        assert!(JsonFormatter.deserialize_as::<u8>(&wire).is_err());
    }

    #[test]
    fn test_frames() {
        let json = JsonFormatter;
        assert!(matches!(json.into_frame("[]".into()), RawFrame::Text(_)));
        assert_eq!(
            json.from_frame(RawFrame::Binary(Bytes::from_static(b"[1]")))
                .unwrap(),
            "[1]"
        );
        assert!(json
            .from_frame(RawFrame::Binary(Bytes::from_static(&[0xff, 0xfe])))
            .is_err());

        let msgpack = MsgPackFormatter;
        assert!(matches!(
            msgpack.into_frame(Bytes::from_static(&[0x90])),
            RawFrame::Binary(_)
        ));
    }
}
