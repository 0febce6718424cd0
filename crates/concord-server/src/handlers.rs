//! HTTP, WebSocket and RawSocket entry points.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use concord_core::Router as WampRouter;
use concord_protocol::version::parse_subprotocol;
use concord_protocol::{JsonFormatter, MsgPackFormatter, PROTOCOL_VERSION};
use concord_transport::{
    serve, ConnectionListener, RawConnection, RawSocketConfig, RawSocketTransport, Transport,
};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connection::AxumConnection;
use crate::metrics;

/// Shared server state.
pub struct AppState {
    pub router: Arc<WampRouter>,
    pub listener: Arc<ConnectionListener>,
    pub config: Config,
}

impl AppState {
    /// Build the router and register one listener binding per serializer.
    ///
    /// # Errors
    ///
    /// Returns an error on an unknown serializer.
    pub fn new(config: Config) -> Result<Self> {
        let mut router = WampRouter::with_config(config.router_config());
        if let Some(authenticator) = config.authenticator() {
            info!(principals = config.auth.principals.len(), "Ticket authentication enabled");
            router = router.with_authenticator(Arc::new(authenticator));
        }

        let listener = ConnectionListener::new();
        for binding in config.bindings()? {
            match parse_subprotocol(&binding) {
                Some((version, "json")) if version.is_compatible_with(&PROTOCOL_VERSION) => {
                    listener.register_binding(binding.as_str(), JsonFormatter)?;
                }
                Some((version, "msgpack")) if version.is_compatible_with(&PROTOCOL_VERSION) => {
                    listener.register_binding(binding.as_str(), MsgPackFormatter)?;
                }
                _ => anyhow::bail!("No formatter for binding '{binding}'"),
            }
        }

        Ok(Self {
            router: Arc::new(router),
            listener: Arc::new(listener),
            config,
        })
    }

    /// Start a router task per binding.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener was already disposed.
    pub fn start_router(&self) -> Result<()> {
        for binding in self.listener.binding_names() {
            let stream = self.listener.subscribe(&binding)?;
            self.router.listen(stream);
        }
        Ok(())
    }
}

/// Run the server until it fails or is interrupted.
///
/// # Errors
///
/// Returns an error if a listener cannot be bound.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone())?);
    state.start_router()?;

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(&config.host, config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
        tokio::spawn(metrics::track_sessions(state.router.sessions().subscribe_events()));
    }

    if let Some(addr) = config.rawsocket_addr()? {
        let bindings = state.listener.binding_names();
        let transport = RawSocketTransport::new(RawSocketConfig {
            bind_addr: addr,
            bindings,
            ..RawSocketConfig::default()
        })
        .await
        .with_context(|| format!("Failed to bind RawSocket listener on {addr}"))?;
        info!("RawSocket endpoint: tcp://{}", addr);
        let transport: Arc<dyn Transport> = Arc::new(transport);
        tokio::spawn(serve(transport, Arc::clone(&state.listener)));
    }

    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::clone(&state));

    let addr = config.bind_addr()?;
    let tcp = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("concord listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(tcp, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.listener.dispose();
    // Give sessions a moment to see their connections end
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!("concord stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

/// Health check with router statistics.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "stats": state.router.stats(),
    }))
}

/// WebSocket upgrade handler. The subprotocol selects the binding.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.protocols(state.listener.binding_names())
        .max_message_size(state.config.transport.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, remote, state))
}

async fn handle_websocket(socket: WebSocket, remote: SocketAddr, state: Arc<AppState>) {
    let binding = socket
        .protocol()
        .and_then(|p| p.to_str().ok())
        .map(str::to_string);

    let Some(binding) = binding else {
        warn!(%remote, "WebSocket client offered no supported subprotocol");
        metrics::record_error("subprotocol");
        let mut conn = AxumConnection::new(socket, remote);
        let _ = conn.close().await;
        return;
    };

    debug!(%remote, binding = %binding, "WebSocket connected");
    if let Err(e) = state
        .listener
        .accept(&binding, Box::new(AxumConnection::new(socket, remote)))
    {
        warn!(%remote, error = %e, "Dropped WebSocket connection");
        metrics::record_error("accept");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_protocol::WampMessage;
    use concord_transport::{Connection, FramedConnection, MemTransport};

    #[test]
    fn test_state_registers_enabled_bindings() {
        let state = AppState::new(Config::default()).unwrap();
        assert_eq!(
            state.listener.binding_names(),
            vec!["wamp.2.json".to_string(), "wamp.2.msgpack".to_string()]
        );
    }

    #[test]
    fn test_state_rejects_unknown_serializer() {
        let mut config = Config::default();
        config.transport.serializers = vec!["xml".into()];
        assert!(AppState::new(config).is_err());
    }

    #[tokio::test]
    async fn test_start_router_subscribes_every_binding() {
        let state = AppState::new(Config::default()).unwrap();
        state.start_router().unwrap();

        let transport = MemTransport::new();
        let raw = transport.connect("wamp.2.json").unwrap();
        let accepted = transport.accept().await.unwrap();
        state.listener.accept(&accepted.binding, accepted.connection).unwrap();

        let mut client = FramedConnection::new(Box::new(raw), JsonFormatter, "wamp.2.json");
        client
            .send(&WampMessage::hello("realm1", Default::default()))
            .await
            .unwrap();
        let welcome = tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(welcome, WampMessage::Welcome { .. }));
    }
}
