//! Transport abstraction traits for concord.
//!
//! Two layers are defined here. A [`RawConnection`] moves frames, a
//! [`Connection`] moves protocol messages. Transports only ever produce raw
//! connections; the listener pairs them with a formatter.

use async_trait::async_trait;
use concord_protocol::{ProtocolError, RawFrame, WampMessage};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let n = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}", n))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A binding with this name is already registered.
    #[error("Binding already registered: {0}")]
    DuplicateBinding(String),

    /// No binding with this name is registered.
    #[error("Unknown binding: {0}")]
    UnknownBinding(String),

    /// Nobody is subscribed to the binding a connection arrived on.
    #[error("No subscriber for binding: {0}")]
    NoSubscriber(String),

    /// The listener has been disposed.
    #[error("Listener disposed")]
    ListenerDisposed,

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// A connection that moves whole frames.
///
/// Implementations own the carrier (socket, channel pair, ...). They do
/// not know which encoding the frames carry.
#[async_trait]
pub trait RawConnection: Send {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Receive the next frame.
    ///
    /// Returns `None` if the connection is closed cleanly.
    async fn recv_frame(&mut self) -> Result<Option<RawFrame>, TransportError>;

    /// Send a frame.
    async fn send_frame(&mut self, frame: RawFrame) -> Result<(), TransportError>;

    /// Close the connection gracefully. Closing twice is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}

/// A raw connection together with the binding it was accepted on.
pub struct Accepted {
    /// Binding name, usually the negotiated subprotocol.
    pub binding: String,
    /// The accepted connection.
    pub connection: Box<dyn RawConnection>,
}

impl fmt::Debug for Accepted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accepted")
            .field("binding", &self.binding)
            .field("connection", self.connection.id())
            .finish()
    }
}

/// A transport that can accept connections.
///
/// Transports are responsible for handling the underlying carrier
/// (WebSocket, RawSocket, in-memory) and providing a uniform interface.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Accept a new connection.
    ///
    /// This method blocks until a new connection is available or an error occurs.
    /// A failed handshake with one peer is reported as an error; callers
    /// should keep accepting.
    async fn accept(&self) -> Result<Accepted, TransportError>;

    /// Get the transport name (e.g., "websocket", "rawsocket").
    fn name(&self) -> &'static str;

    /// Check if the transport is healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// An active message-level connection.
///
/// Once closed, a connection rejects sends and never yields another
/// message.
#[async_trait]
pub trait Connection: Send {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// The binding this connection was accepted on.
    fn binding(&self) -> &str;

    /// Receive the next message.
    ///
    /// Returns `None` if the connection is closed cleanly.
    async fn recv(&mut self) -> Result<Option<WampMessage>, TransportError>;

    /// Send a message.
    async fn send(&mut self, message: &WampMessage) -> Result<(), TransportError>;

    /// Close the connection gracefully. Closing twice is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_connection_id_from_string() {
        let id: ConnectionId = "test-id".into();
        assert_eq!(id.as_str(), "test-id");
    }
}
