//! In-process loopback transport.
//!
//! Useful for tests and for embedding clients in the same process as the
//! router. Frames are moved through bounded channels without encoding to
//! bytes beyond what the formatter already does.

use async_trait::async_trait;
use concord_protocol::RawFrame;
use tokio::sync::{mpsc, Mutex};

use crate::traits::{Accepted, ConnectionId, RawConnection, Transport, TransportError};

const CHANNEL_CAPACITY: usize = 256;

/// A transport whose connections are created by [`MemTransport::connect`].
#[derive(Debug)]
pub struct MemTransport {
    tx: mpsc::UnboundedSender<Accepted>,
    rx: Mutex<mpsc::UnboundedReceiver<Accepted>>,
}

impl MemTransport {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Open a connection on `binding` and return the client end.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport is no longer accepting.
    pub fn connect(&self, binding: impl Into<String>) -> Result<MemConnection, TransportError> {
        let (client, server) = MemConnection::pair();
        self.tx
            .send(Accepted {
                binding: binding.into(),
                connection: Box::new(server),
            })
            .map_err(|_| TransportError::ConnectionClosed)?;
        Ok(client)
    }
}

impl Default for MemTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemTransport {
    async fn accept(&self) -> Result<Accepted, TransportError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// One end of an in-memory connection.
#[derive(Debug)]
pub struct MemConnection {
    id: ConnectionId,
    tx: Option<mpsc::Sender<RawFrame>>,
    rx: mpsc::Receiver<RawFrame>,
}

impl MemConnection {
    /// Create two connected ends.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);

        (
            Self {
                id: ConnectionId::generate(),
                tx: Some(tx_b),
                rx: rx_a,
            },
            Self {
                id: ConnectionId::generate(),
                tx: Some(tx_a),
                rx: rx_b,
            },
        )
    }
}

#[async_trait]
impl RawConnection for MemConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv_frame(&mut self) -> Result<Option<RawFrame>, TransportError> {
        if self.tx.is_none() {
            return Ok(None);
        }
        Ok(self.rx.recv().await)
    }

    async fn send_frame(&mut self, frame: RawFrame) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        self.rx.close();
        Ok(())
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }
}
