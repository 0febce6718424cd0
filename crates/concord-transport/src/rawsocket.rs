//! RawSocket transport over TCP.
//!
//! Each side opens with a 4-byte handshake announcing the largest frame it
//! accepts and the serializer it wants. Frames are then length-prefixed as
//! described in [`concord_protocol::framing`].

use async_trait::async_trait;
use bytes::BytesMut;
use concord_protocol::framing::{self, FrameKind, Handshake, HandshakeError};
use concord_protocol::{ProtocolError, RawFrame};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::traits::{Accepted, ConnectionId, RawConnection, Transport, TransportError};

/// Largest length exponent, announcing 16 MiB frames.
pub const MAX_LENGTH_EXPONENT: u8 = 15;

/// Binding name for a handshake serializer id.
#[must_use]
pub fn serializer_binding(serializer: u8) -> Option<&'static str> {
    match serializer {
        framing::SERIALIZER_JSON => Some("wamp.2.json"),
        framing::SERIALIZER_MSGPACK => Some("wamp.2.msgpack"),
        _ => None,
    }
}

/// Handshake serializer id for a binding name.
#[must_use]
pub fn binding_serializer(binding: &str) -> Option<u8> {
    match binding {
        "wamp.2.json" => Some(framing::SERIALIZER_JSON),
        "wamp.2.msgpack" => Some(framing::SERIALIZER_MSGPACK),
        _ => None,
    }
}

/// RawSocket transport configuration.
#[derive(Debug, Clone)]
pub struct RawSocketConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Length exponent announced to clients (0..=15).
    pub length_exponent: u8,
    /// Bindings accepted; serializers without a binding are refused.
    pub bindings: Vec<String>,
    /// How long a client may take to send its handshake.
    pub handshake_timeout: Duration,
}

impl Default for RawSocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8081)),
            length_exponent: MAX_LENGTH_EXPONENT,
            bindings: vec!["wamp.2.json".to_string(), "wamp.2.msgpack".to_string()],
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// RawSocket transport.
pub struct RawSocketTransport {
    listener: TcpListener,
    config: RawSocketConfig,
}

impl RawSocketTransport {
    /// Bind a new RawSocket transport.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: RawSocketConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!("RawSocket transport listening on {}", config.bind_addr);
        Ok(Self { listener, config })
    }

    /// Get the local address this transport is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

#[async_trait]
impl Transport for RawSocketTransport {
    async fn accept(&self) -> Result<Accepted, TransportError> {
        let (mut stream, addr) = self.listener.accept().await?;
        debug!("Accepted TCP connection from {}", addr);

        let (binding, peer_max) = tokio::time::timeout(
            self.config.handshake_timeout,
            server_handshake(&mut stream, self.config.bindings.as_slice(), self.config.length_exponent),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        debug!(binding = %binding, "RawSocket handshake completed with {}", addr);

        let own_max = Handshake::max_length(self.config.length_exponent);
        Ok(Accepted {
            binding: binding.to_string(),
            connection: Box::new(RawSocketConnection::new(stream, Some(addr), own_max, peer_max)),
        })
    }

    fn name(&self) -> &'static str {
        "rawsocket"
    }
}

async fn read_handshake<S: AsyncRead + Unpin>(stream: &mut S) -> Result<[u8; 4], TransportError> {
    let mut octets = [0u8; 4];
    stream.read_exact(&mut octets).await?;
    Ok(octets)
}

/// Router side of the handshake.
///
/// Returns the binding for the requested serializer and the largest frame
/// the client accepts.
///
/// # Errors
///
/// Returns an error on a malformed handshake or an unsupported serializer;
/// the client is told why before the error is returned.
pub async fn server_handshake<S, B>(
    stream: &mut S,
    bindings: &[B],
    length_exponent: u8,
) -> Result<(&'static str, usize), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    B: AsRef<str>,
{
    let octets = read_handshake(stream).await?;

    let (peer_exponent, serializer) = match Handshake::decode(octets) {
        Ok(Handshake::Hello {
            length_exponent,
            serializer,
        }) => (length_exponent, serializer),
        Ok(Handshake::Refused(_)) => {
            return Err(ProtocolError::InvalidFrame("client sent a refusal".into()).into());
        }
        Err(e) => {
            if octets[0] == framing::MAGIC {
                let refusal = Handshake::Refused(HandshakeError::ReservedBitsUsed);
                stream.write_all(&refusal.encode()).await?;
            }
            return Err(e.into());
        }
    };

    let binding = serializer_binding(serializer)
        .filter(|name| bindings.iter().any(|b| b.as_ref() == *name));

    let Some(binding) = binding else {
        warn!(serializer, "Refusing unsupported serializer");
        let refusal = Handshake::Refused(HandshakeError::SerializerUnsupported);
        stream.write_all(&refusal.encode()).await?;
        return Err(ProtocolError::InvalidFrame(format!("unsupported serializer {serializer}")).into());
    };

    let reply = Handshake::Hello {
        length_exponent,
        serializer,
    };
    stream.write_all(&reply.encode()).await?;

    Ok((binding, Handshake::max_length(peer_exponent)))
}

/// Client side of the handshake.
///
/// Returns the largest frame the router accepts.
///
/// # Errors
///
/// Returns an error if the router refuses or answers with a different
/// serializer.
pub async fn client_handshake<S>(
    stream: &mut S,
    serializer: u8,
    length_exponent: u8,
) -> Result<usize, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = Handshake::Hello {
        length_exponent,
        serializer,
    };
    stream.write_all(&hello.encode()).await?;

    match Handshake::decode(read_handshake(stream).await?)? {
        Handshake::Hello {
            length_exponent,
            serializer: accepted,
        } if accepted == serializer => Ok(Handshake::max_length(length_exponent)),
        Handshake::Hello { serializer, .. } => Err(TransportError::Other(format!(
            "router answered with serializer {serializer}"
        ))),
        Handshake::Refused(error) => Err(TransportError::Other(format!(
            "handshake refused: {error:?}"
        ))),
    }
}

/// Connect to a RawSocket router.
///
/// # Errors
///
/// Returns an error if the TCP connection or handshake fails.
pub async fn connect(addr: SocketAddr, serializer: u8) -> Result<RawSocketConnection<TcpStream>, TransportError> {
    let mut stream = TcpStream::connect(addr).await?;
    let peer_max = client_handshake(&mut stream, serializer, MAX_LENGTH_EXPONENT).await?;
    let own_max = Handshake::max_length(MAX_LENGTH_EXPONENT);
    Ok(RawSocketConnection::new(stream, Some(addr), own_max, peer_max))
}

/// A RawSocket connection after a completed handshake.
pub struct RawSocketConnection<S> {
    id: ConnectionId,
    reader: ReadHalf<S>,
    writer: Arc<Mutex<WriteHalf<S>>>,
    read_buffer: BytesMut,
    max_in: usize,
    max_out: usize,
    remote_addr: Option<SocketAddr>,
    closed: bool,
}

impl<S> RawSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap a stream whose handshake is complete.
    ///
    /// `max_in` is the limit this side announced, `max_out` the limit the
    /// peer announced.
    #[must_use]
    pub fn new(stream: S, remote_addr: Option<SocketAddr>, max_in: usize, max_out: usize) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            id: ConnectionId::generate(),
            reader,
            writer: Arc::new(Mutex::new(writer)),
            read_buffer: BytesMut::with_capacity(4096),
            max_in,
            max_out,
            remote_addr,
            closed: false,
        }
    }

    /// Send a ping frame. The peer answers with a pong carrying the same
    /// payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or the write fails.
    pub async fn ping(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.write(FrameKind::Ping, payload).await
    }

    async fn write(&mut self, kind: FrameKind, payload: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        if payload.len() > self.max_out {
            return Err(ProtocolError::FrameTooLarge(payload.len()).into());
        }

        let data = framing::encode(kind, payload)?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&data)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

#[async_trait]
impl<S> RawConnection for RawSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv_frame(&mut self) -> Result<Option<RawFrame>, TransportError> {
        if self.closed {
            return Ok(None);
        }

        loop {
            if let Some((kind, payload)) = framing::decode_from(&mut self.read_buffer, self.max_in)? {
                match kind {
                    FrameKind::Message => return Ok(Some(RawFrame::Binary(payload))),
                    FrameKind::Ping => {
                        trace!(conn = %self.id, "Answering ping");
                        let pong = framing::encode(FrameKind::Pong, &payload)?;
                        let writer = Arc::clone(&self.writer);
                        // Written from a task so a cancelled recv never leaves half a frame behind
                        tokio::spawn(async move {
                            if let Err(e) = writer.lock().await.write_all(&pong).await {
                                debug!("Failed to send pong: {}", e);
                            }
                        });
                    }
                    FrameKind::Pong => {}
                }
                continue;
            }

            let n = self.reader.read_buf(&mut self.read_buffer).await?;
            if n == 0 {
                debug!(conn = %self.id, "RawSocket stream ended");
                self.closed = true;
                return Ok(None);
            }
        }
    }

    async fn send_frame(&mut self, frame: RawFrame) -> Result<(), TransportError> {
        let payload = frame.into_bytes();
        self.write(FrameKind::Message, &payload).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!(conn = %self.id, "Shutdown failed: {}", e);
        }
        Ok(())
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::{duplex, DuplexStream};

    async fn handshaken(
        serializer: u8,
    ) -> (RawSocketConnection<DuplexStream>, RawSocketConnection<DuplexStream>) {
        let (mut client, mut server) = duplex(64 * 1024);
        let bindings = ["wamp.2.json", "wamp.2.msgpack"];

        let (server_result, client_result) = tokio::join!(
            server_handshake(&mut server, &bindings[..], 10),
            client_handshake(&mut client, serializer, MAX_LENGTH_EXPONENT),
        );
        let (binding, server_max_out) = server_result.unwrap();
        assert_eq!(binding_serializer(binding), Some(serializer));
        let client_max_out = client_result.unwrap();
        assert_eq!(client_max_out, Handshake::max_length(10));

        (
            RawSocketConnection::new(client, None, Handshake::max_length(MAX_LENGTH_EXPONENT), client_max_out),
            RawSocketConnection::new(server, None, Handshake::max_length(10), server_max_out),
        )
    }

    #[tokio::test]
    async fn test_handshake_and_exchange() {
        let (mut client, mut server) = handshaken(framing::SERIALIZER_JSON).await;

        client
            .send_frame(RawFrame::Text("[1,\"realm1\",{}]".into()))
            .await
            .unwrap();
        assert_eq!(
            server.recv_frame().await.unwrap(),
            Some(RawFrame::Binary(Bytes::from_static(b"[1,\"realm1\",{}]")))
        );
    }

    #[tokio::test]
    async fn test_ping_is_answered_and_skipped() {
        let (mut client, mut server) = handshaken(framing::SERIALIZER_MSGPACK).await;

        client.ping(b"hb").await.unwrap();
        client
            .send_frame(RawFrame::Binary(Bytes::from_static(&[0x90])))
            .await
            .unwrap();
        assert_eq!(
            server.recv_frame().await.unwrap(),
            Some(RawFrame::Binary(Bytes::from_static(&[0x90])))
        );

        server
            .send_frame(RawFrame::Binary(Bytes::from_static(&[0x91, 0x01])))
            .await
            .unwrap();
        // The pong is consumed silently
        assert_eq!(
            client.recv_frame().await.unwrap(),
            Some(RawFrame::Binary(Bytes::from_static(&[0x91, 0x01])))
        );
    }

    #[tokio::test]
    async fn test_oversized_frames_are_rejected() {
        let (mut client, mut server) = handshaken(framing::SERIALIZER_MSGPACK).await;

        // The router announced 2^19 bytes
        let large = vec![0u8; Handshake::max_length(10) + 1];
        assert!(matches!(
            client.send_frame(RawFrame::Binary(Bytes::from(large))).await,
            Err(TransportError::Protocol(ProtocolError::FrameTooLarge(_)))
        ));

        // A peer ignoring the limit is a protocol error on receive
        let (mut raw_client, raw_server) = duplex(1024);
        let mut strict = RawSocketConnection::new(raw_server, None, 16, 16);
        raw_client
            .write_all(&framing::encode(FrameKind::Message, &[0u8; 32]).unwrap())
            .await
            .unwrap();
        assert!(matches!(
            strict.recv_frame().await,
            Err(TransportError::Protocol(ProtocolError::FrameTooLarge(32)))
        ));

        client.close().await.unwrap();
        assert!(server.recv_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unsupported_serializer_is_refused() {
        let (mut client, mut server) = duplex(1024);
        let bindings = ["wamp.2.json"];

        let (server_result, client_result) = tokio::join!(
            server_handshake(&mut server, &bindings[..], 15),
            client_handshake(&mut client, framing::SERIALIZER_MSGPACK, 15),
        );
        assert!(server_result.is_err());
        assert!(matches!(client_result, Err(TransportError::Other(_))));
    }

    #[tokio::test]
    async fn test_tcp_transport() {
        let transport = RawSocketTransport::new(RawSocketConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        })
        .await
        .unwrap();
        let addr = transport.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut conn = connect(addr, framing::SERIALIZER_JSON).await.unwrap();
            conn.send_frame(RawFrame::Text("[6,{},\"bye\"]".into()))
                .await
                .unwrap();
            conn
        });

        let mut accepted = transport.accept().await.unwrap();
        assert_eq!(accepted.binding, "wamp.2.json");
        let frame = accepted.connection.recv_frame().await.unwrap().unwrap();
        assert_eq!(frame.into_bytes(), Bytes::from_static(b"[6,{},\"bye\"]"));
        drop(client.await.unwrap());
    }
}
