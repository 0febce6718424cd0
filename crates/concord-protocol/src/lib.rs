//! # concord-protocol
//!
//! Wire protocol definitions for the concord WAMP router.
//!
//! This crate defines everything that depends on how bytes look on the
//! wire, so the routing crates never have to:
//!
//! - [`Value`] - the encoding-neutral value model
//! - [`WampMessage`] - the protocol messages and their list layout
//! - [`Formatter`] - JSON and MessagePack encodings
//! - [`framing`] - RawSocket length-prefixed framing and handshake
//!
//! ## Example
//!
//! ```rust
//! use concord_protocol::{codec, Dict, JsonFormatter, WampMessage};
//!
//! let message = WampMessage::call(1, "com.example.add", vec![2.into(), 3.into()], Dict::new());
//!
//! let frame = codec::encode(&JsonFormatter, &message).unwrap();
//! let decoded = codec::decode(&JsonFormatter, frame).unwrap();
//! assert_eq!(decoded, message);
//! ```

pub mod codec;
pub mod error;
pub mod formatter;
pub mod framing;
pub mod messages;
pub mod value;
pub mod version;

pub use codec::MessageCodec;
pub use error::{ProtocolError, SerializationError};
pub use formatter::{Formatter, JsonFormatter, MsgPackFormatter, RawFrame};
pub use messages::{Id, MessageType, WampMessage, MAX_ID};
pub use value::{Dict, List, Value};
pub use version::{Version, AGENT, PROTOCOL_VERSION};
