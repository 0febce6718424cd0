//! Message-level connections built from a raw connection and a formatter.

use async_trait::async_trait;
use concord_protocol::{Formatter, MessageCodec, WampMessage};
use tracing::{debug, trace};

use crate::traits::{Connection, ConnectionId, RawConnection, TransportError};

/// A [`Connection`] that encodes messages with a formatter `F`.
pub struct FramedConnection<F> {
    inner: Box<dyn RawConnection>,
    codec: MessageCodec<F>,
    binding: String,
    closed: bool,
}

impl<F: Formatter> FramedConnection<F> {
    /// Wrap a raw connection.
    #[must_use]
    pub fn new(inner: Box<dyn RawConnection>, formatter: F, binding: impl Into<String>) -> Self {
        Self {
            inner,
            codec: MessageCodec::new(formatter),
            binding: binding.into(),
            closed: false,
        }
    }
}

#[async_trait]
impl<F: Formatter> Connection for FramedConnection<F> {
    fn id(&self) -> &ConnectionId {
        self.inner.id()
    }

    fn binding(&self) -> &str {
        &self.binding
    }

    async fn recv(&mut self) -> Result<Option<WampMessage>, TransportError> {
        if self.closed {
            return Ok(None);
        }

        match self.inner.recv_frame().await? {
            Some(frame) => {
                let message = self.codec.decode(frame)?;
                trace!(conn = %self.inner.id(), kind = ?message.message_type(), "Received message");
                Ok(Some(message))
            }
            None => {
                debug!(conn = %self.inner.id(), "Peer closed connection");
                self.closed = true;
                Ok(None)
            }
        }
    }

    async fn send(&mut self, message: &WampMessage) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }

        let frame = self.codec.encode(message)?;
        self.inner.send_frame(frame).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner.close().await
    }

    fn remote_addr(&self) -> Option<String> {
        self.inner.remote_addr()
    }

    fn is_open(&self) -> bool {
        !self.closed
    }
}
