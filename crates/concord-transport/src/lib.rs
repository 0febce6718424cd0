//! # concord-transport
//!
//! Transport abstraction layer for the concord router.
//!
//! This crate provides a unified interface for different carriers:
//!
//! - **WebSocket** - subprotocol `wamp.2.json` / `wamp.2.msgpack`
//! - **RawSocket** - length-prefixed frames over TCP
//! - **Memory** - in-process loopback for tests and embedded clients
//!
//! ## Transport Abstraction
//!
//! Transports produce [`RawConnection`]s tagged with a binding name. The
//! [`ConnectionListener`] pairs each binding with a formatter, turning raw
//! connections into message-level [`Connection`]s and announcing them to
//! subscribers.
//!
//! ```rust,ignore
//! use concord_transport::ConnectionListener;
//! use concord_protocol::JsonFormatter;
//!
//! let listener = ConnectionListener::new();
//! listener.register_binding("wamp.2.json", JsonFormatter)?;
//! let mut stream = listener.subscribe("wamp.2.json")?;
//! while let Some(accepted) = stream.next().await {
//!     if let Some(conn) = accepted.take() {
//!         // Serve the connection
//!     }
//! }
//! ```

pub mod framed;
pub mod listener;
pub mod mem;
pub mod negotiate;
pub mod rawsocket;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use framed::FramedConnection;
pub use listener::{serve, AcceptedConnection, ConnectionListener, ConnectionStream};
pub use mem::{MemConnection, MemTransport};
pub use rawsocket::{RawSocketConfig, RawSocketConnection, RawSocketTransport};
pub use traits::{Accepted, Connection, ConnectionId, RawConnection, Transport, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketConnection, WebSocketTransport};
