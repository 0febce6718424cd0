//! WebSocket transport implementation.
//!
//! This module provides a WebSocket-based transport using tokio-tungstenite.
//! The subprotocol offered in `Sec-WebSocket-Protocol` selects the binding.

use async_trait::async_trait;
use bytes::Bytes;
use concord_protocol::RawFrame;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig as ProtocolConfig;
use tokio_tungstenite::{
    accept_hdr_async_with_config,
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, error, info};

use crate::negotiate::{negotiate_subprotocol, parse_protocol_header};
use crate::traits::{Accepted, ConnectionId, RawConnection, Transport, TransportError};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum message size in bytes.
    pub max_message_size: usize,
    /// Subprotocols accepted, one per listener binding.
    pub protocols: Vec<String>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_message_size: 16 * 1024 * 1024,
            protocols: vec!["wamp.2.json".to_string(), "wamp.2.msgpack".to_string()],
        }
    }
}

/// WebSocket transport.
pub struct WebSocketTransport {
    listener: TcpListener,
    config: WebSocketConfig,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: WebSocketConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(TransportError::Io)?;

        info!("WebSocket transport listening on {}", config.bind_addr);

        Ok(Self { listener, config })
    }

    /// Create a new WebSocket transport accepting the given subprotocols.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr, protocols: Vec<String>) -> Result<Self, TransportError> {
        Self::new(WebSocketConfig {
            bind_addr: addr,
            protocols,
            ..Default::default()
        })
        .await
    }

    /// Get the local address this transport is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

fn reject(reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn accept(&self) -> Result<Accepted, TransportError> {
        let (stream, addr) = self.listener.accept().await.map_err(TransportError::Io)?;

        debug!("Accepted TCP connection from {}", addr);

        let mut selected: Option<String> = None;
        let protocols = &self.config.protocols;
        let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            let offered = request
                .headers()
                .get(SEC_WEBSOCKET_PROTOCOL)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();

            let protocol = negotiate_subprotocol(&parse_protocol_header(offered), protocols)
                .ok_or_else(|| reject("no supported subprotocol offered"))?;
            let value = HeaderValue::from_str(protocol).map_err(|_| reject("invalid subprotocol"))?;
            response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
            selected = Some(protocol.to_string());
            Ok(response)
        };

        let mut ws_config = ProtocolConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_size);
        ws_config.max_frame_size = Some(self.config.max_message_size);

        let ws_stream = accept_hdr_async_with_config(stream, callback, Some(ws_config))
            .await
            .map_err(|e| {
                error!("WebSocket handshake failed: {}", e);
                TransportError::Other(format!("WebSocket handshake failed: {}", e))
            })?;

        let binding = selected.ok_or_else(|| TransportError::Other("no subprotocol selected".into()))?;
        debug!(binding = %binding, "WebSocket handshake completed with {}", addr);

        Ok(Accepted {
            binding,
            connection: Box::new(WebSocketConnection::new(ws_stream, Some(addr))),
        })
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// A WebSocket connection.
pub struct WebSocketConnection<S = TcpStream> {
    id: ConnectionId,
    stream: WebSocketStream<S>,
    remote_addr: Option<SocketAddr>,
    closed: bool,
}

impl<S> WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an established WebSocket stream (server or client side).
    #[must_use]
    pub fn new(stream: WebSocketStream<S>, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            id: ConnectionId::generate(),
            stream,
            remote_addr,
            closed: false,
        }
    }
}

#[async_trait]
impl<S> RawConnection for WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv_frame(&mut self) -> Result<Option<RawFrame>, TransportError> {
        if self.closed {
            return Ok(None);
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(RawFrame::Text(text))),
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(RawFrame::Binary(Bytes::from(data))));
                }
                // Pings are answered by tungstenite on the next read or flush
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    debug!(conn = %self.id, "Received close frame");
                    self.closed = true;
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    debug!(conn = %self.id, "WebSocket stream ended");
                    self.closed = true;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    error!(conn = %self.id, "WebSocket error: {}", e);
                    self.closed = true;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    async fn send_frame(&mut self, frame: RawFrame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match frame {
            RawFrame::Text(text) => Message::Text(text),
            RawFrame::Binary(data) => Message::Binary(data.to_vec()),
        };
        self.stream
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::Other(format!("Failed to close: {}", e))),
        }
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    #[test]
    fn test_websocket_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.protocols, vec!["wamp.2.json", "wamp.2.msgpack"]);
    }

    #[tokio::test]
    async fn test_subprotocol_selects_binding() {
        let transport = WebSocketTransport::bind(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            vec!["wamp.2.json".into(), "wamp.2.msgpack".into()],
        )
        .await
        .unwrap();
        let addr = transport.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut request = format!("ws://{addr}/").into_client_request().unwrap();
            request.headers_mut().insert(
                SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_static("wamp.2.msgpack"),
            );
            let (stream, response) = connect_async(request).await.unwrap();
            assert_eq!(
                response.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(),
                "wamp.2.msgpack"
            );
            let mut conn = WebSocketConnection::new(stream, None);
            conn.send_frame(RawFrame::Binary(Bytes::from_static(&[0x91, 0x01])))
                .await
                .unwrap();
            conn
        });

        let mut accepted = transport.accept().await.unwrap();
        assert_eq!(accepted.binding, "wamp.2.msgpack");
        assert_eq!(
            accepted.connection.recv_frame().await.unwrap(),
            Some(RawFrame::Binary(Bytes::from_static(&[0x91, 0x01])))
        );

        let mut client = client.await.unwrap();
        client.close().await.unwrap();
        assert!(accepted.connection.recv_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_unknown_subprotocol() {
        let transport = WebSocketTransport::bind(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            vec!["wamp.2.json".into()],
        )
        .await
        .unwrap();
        let addr = transport.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut request = format!("ws://{addr}/").into_client_request().unwrap();
            request
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("mqtt"));
            connect_async(request).await
        });

        assert!(transport.accept().await.is_err());
        assert!(client.await.unwrap().is_err());
    }
}
