//! Axum WebSocket connections as raw router connections.

use std::net::SocketAddr;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use concord_protocol::RawFrame;
use concord_transport::{ConnectionId, RawConnection, TransportError};
use tracing::{debug, trace};

use crate::metrics::{self, ConnectionMetricsGuard};

/// A WebSocket upgraded by axum.
pub struct AxumConnection {
    id: ConnectionId,
    socket: WebSocket,
    remote_addr: SocketAddr,
    closed: bool,
    _metrics: ConnectionMetricsGuard,
}

impl AxumConnection {
    #[must_use]
    pub fn new(socket: WebSocket, remote_addr: SocketAddr) -> Self {
        Self {
            id: ConnectionId::generate(),
            socket,
            remote_addr,
            closed: false,
            _metrics: ConnectionMetricsGuard::new(),
        }
    }
}

#[async_trait]
impl RawConnection for AxumConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv_frame(&mut self) -> Result<Option<RawFrame>, TransportError> {
        if self.closed {
            return Ok(None);
        }

        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Text(text))) => {
                    metrics::record_frame(text.len(), "inbound");
                    return Ok(Some(RawFrame::Text(text)));
                }
                Some(Ok(Message::Binary(data))) => {
                    metrics::record_frame(data.len(), "inbound");
                    return Ok(Some(RawFrame::Binary(Bytes::from(data))));
                }
                // axum answers pings itself
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!(conn = %self.id, ?frame, "Received close frame");
                    self.closed = true;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    metrics::record_error("websocket");
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    self.closed = true;
                    return Ok(None);
                }
            }
        }
    }

    async fn send_frame(&mut self, frame: RawFrame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }

        metrics::record_frame(frame.len(), "outbound");
        let message = match frame {
            RawFrame::Text(text) => Message::Text(text),
            RawFrame::Binary(data) => Message::Binary(data.to_vec()),
        };
        self.socket
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        trace!(conn = %self.id, "Closing WebSocket");
        // The peer may already be gone
        let _ = self.socket.send(Message::Close(None)).await;
        Ok(())
    }

    fn remote_addr(&self) -> Option<String> {
        Some(self.remote_addr.to_string())
    }
}
