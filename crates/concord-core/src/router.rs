//! The router façade: handshake and per-session message loop.

use std::sync::Arc;
use std::time::Duration;

use concord_protocol::{Dict, MessageType, Value, WampMessage, AGENT};
use concord_transport::{Connection, ConnectionStream, TransportError};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::auth::{AuthInfo, Authenticator};
use crate::error::{ErrorKind, HandshakeError, WampError};
use crate::handler::{self, Flow};
use crate::meta;
use crate::realm::{Realm, RealmContainer};
use crate::session::{SessionDetails, SessionHandle, SessionId, SessionRegistry};
use crate::uri::validate_uri;

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// How long a new connection may take to send HELLO.
    pub handshake_timeout: Duration,
    /// How long a challenged peer may take to send AUTHENTICATE.
    pub auth_timeout: Duration,
    /// Timeout for calls that do not set one.
    pub call_timeout: Option<Duration>,
    /// Whether realms carry the `wamp.session.*` / `wamp.registration.*` API.
    pub meta_api: bool,
    /// Reported to peers in WELCOME.
    pub agent: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(30),
            call_timeout: None,
            meta_api: true,
            agent: AGENT.to_string(),
        }
    }
}

/// Router statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    pub realms: usize,
    pub sessions: usize,
    pub registrations: usize,
    pub topics: usize,
    pub subscriptions: usize,
    pub pending_calls: usize,
    pub invocations: usize,
}

/// A peer that passed the handshake.
struct Joined {
    session: SessionId,
    realm: String,
    auth: AuthInfo,
}

/// The router.
///
/// Connections handed to [`serve_connection`](Router::serve_connection)
/// become sessions once they complete the HELLO / WELCOME handshake.
pub struct Router {
    realms: RealmContainer,
    sessions: Arc<SessionRegistry>,
    authenticator: Option<Arc<dyn Authenticator>>,
    config: RouterConfig,
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    #[must_use]
    pub fn with_config(config: RouterConfig) -> Self {
        info!(agent = %config.agent, meta_api = config.meta_api, "Creating router");
        Self {
            realms: RealmContainer::new(config.call_timeout),
            sessions: Arc::new(SessionRegistry::new()),
            authenticator: None,
            config,
        }
    }

    /// Require every peer to authenticate.
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Get a realm, creating it on first use.
    pub fn realm(&self, name: &str) -> Arc<Realm> {
        self.realms.get_or_create_with(name, |realm| {
            if self.config.meta_api {
                meta::install(realm, &self.sessions);
            }
        })
    }

    #[must_use]
    pub fn realms(&self) -> &RealmContainer {
        &self.realms
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    #[must_use]
    pub fn stats(&self) -> RouterStats {
        let mut stats = RouterStats {
            realms: self.realms.len(),
            sessions: self.sessions.count(),
            ..RouterStats::default()
        };
        for realm in self.realms.all() {
            stats.registrations += realm.dealer().registration_count();
            stats.pending_calls += realm.dealer().pending_count();
            stats.invocations += realm.dealer().invocation_count();
            stats.topics += realm.broker().topic_count();
            stats.subscriptions += realm.broker().subscription_count();
        }
        stats
    }

    /// Serve every connection a stream yields, each on its own task.
    pub fn listen(self: &Arc<Self>, mut stream: ConnectionStream) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            info!(binding = %stream.binding(), "Router listening");
            while let Some(accepted) = stream.next().await {
                match accepted.take() {
                    Some(connection) => {
                        tokio::spawn(Arc::clone(&router).serve_connection(connection));
                    }
                    None => trace!(binding = %accepted.binding(), "Connection claimed elsewhere"),
                }
            }
            debug!(binding = %stream.binding(), "Connection stream ended");
        })
    }

    /// Run one connection through the handshake and the session loop.
    pub async fn serve_connection(self: Arc<Self>, mut conn: Box<dyn Connection>) {
        let joined = match self.handshake(conn.as_mut()).await {
            Ok(joined) => joined,
            Err(e) => {
                debug!(connection = %conn.id(), error = %e, "Handshake failed");
                if let Some(abort) = e.abort_message() {
                    let _ = conn.send(&abort).await;
                }
                let _ = conn.close().await;
                return;
            }
        };

        let realm = self.realm(&joined.realm);
        let details = SessionDetails {
            session: joined.session,
            realm: joined.realm,
            auth: joined.auth,
            transport: conn.binding().to_string(),
        };

        let welcome = WampMessage::Welcome {
            session: details.session,
            details: self.welcome_details(&details.auth),
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = SessionHandle::new(details, tx);
        let id = session.id();

        // Anything routed to the session before WELCOME is sent waits in
        // its queue.
        self.sessions.insert(session.clone());
        if self.config.meta_api {
            meta::session_joined(&realm, session.details());
        }

        let flow = match conn.send(&welcome).await {
            Ok(()) => {
                info!(
                    session = id,
                    realm = %realm.name(),
                    authid = %session.details().auth.authid,
                    transport = %session.details().transport,
                    "Session joined"
                );
                Self::run_session(conn.as_mut(), &session, &realm, &mut rx).await
            }
            Err(e) => {
                debug!(session = id, error = %e, "Could not send WELCOME");
                Flow::Close(None)
            }
        };

        if let Flow::Close(Some(last)) = flow {
            while let Ok(queued) = rx.try_recv() {
                if conn.send(&queued).await.is_err() {
                    break;
                }
            }
            let _ = conn.send(&last).await;
        }

        rx.close();
        realm.session_lost(id);
        self.sessions.remove(id);
        if self.config.meta_api {
            meta::session_left(&realm, session.details());
        }
        let _ = conn.close().await;
        info!(session = id, realm = %realm.name(), "Session left");
    }

    async fn run_session(
        conn: &mut dyn Connection,
        session: &SessionHandle,
        realm: &Realm,
        rx: &mut mpsc::UnboundedReceiver<WampMessage>,
    ) -> Flow {
        let id = session.id();
        loop {
            tokio::select! {
                biased;

                Some(outbound) = rx.recv() => match conn.send(&outbound).await {
                    Ok(()) => {}
                    Err(TransportError::Protocol(e)) => {
                        warn!(
                            session = id,
                            kind = ?outbound.message_type(),
                            error = %e,
                            "Could not encode outbound message"
                        );
                        if let Some(substitute) = Self::unencodable(session, realm, outbound) {
                            if conn.send(&substitute).await.is_err() {
                                return Flow::Close(None);
                            }
                        }
                    }
                    Err(e) => {
                        debug!(session = id, error = %e, "Send failed");
                        return Flow::Close(None);
                    }
                },

                inbound = conn.recv() => match inbound {
                    Ok(Some(message)) => match handler::handle(session, realm, message) {
                        Flow::Continue => {}
                        close => return close,
                    },
                    Ok(None) => return Flow::Close(None),
                    Err(TransportError::Protocol(e)) => {
                        warn!(session = id, error = %e, "Malformed message");
                        return Flow::Close(Some(WampMessage::abort(
                            ErrorKind::ProtocolViolation.uri(),
                            e.to_string(),
                        )));
                    }
                    Err(e) => {
                        debug!(session = id, error = %e, "Receive failed");
                        return Flow::Close(None);
                    }
                },
            }
        }
    }

    /// Settle a message this session's serializer cannot carry. A call
    /// outcome is replaced by an error for the same call, and an invocation
    /// fails back to its caller. Anything else is dropped.
    fn unencodable(session: &SessionHandle, realm: &Realm, message: WampMessage) -> Option<WampMessage> {
        let error = || {
            WampError::with_message(
                ErrorKind::InvalidArgument,
                "payload cannot be encoded by the receiving session's serializer",
            )
        };
        match message {
            WampMessage::Result { request, .. }
            | WampMessage::Error {
                request_type: MessageType::Call,
                request,
                ..
            } => Some(error().into_message(MessageType::Call, request)),
            WampMessage::Invocation { request, .. } => {
                realm.dealer().invocation_error(session.id(), request, error());
                None
            }
            _ => None,
        }
    }

    async fn recv_within(
        conn: &mut dyn Connection,
        timeout: Duration,
    ) -> Result<Option<WampMessage>, HandshakeError> {
        match tokio::time::timeout(timeout, conn.recv()).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(HandshakeError::Timeout),
        }
    }

    async fn handshake(&self, conn: &mut dyn Connection) -> Result<Joined, HandshakeError> {
        let (realm, hello) = match Self::recv_within(conn, self.config.handshake_timeout).await? {
            Some(WampMessage::Hello { realm, details }) => (realm, details),
            Some(WampMessage::Abort { .. }) | None => return Err(HandshakeError::Closed),
            Some(other) => {
                return Err(HandshakeError::ProtocolViolation(format!(
                    "expected HELLO, got {:?}",
                    other.message_type()
                )))
            }
        };

        if let Err(reason) = validate_uri(&realm) {
            return Err(HandshakeError::InvalidRealm(format!("'{realm}': {reason}")));
        }

        let session = self.sessions.next_id();
        let auth = match &self.authenticator {
            None => AuthInfo::anonymous(session),
            Some(authenticator) => self.authenticate(conn, authenticator.as_ref(), &realm, &hello).await?,
        };

        trace!(session, realm = %realm, "Handshake complete");
        Ok(Joined { session, realm, auth })
    }

    async fn authenticate(
        &self,
        conn: &mut dyn Connection,
        authenticator: &dyn Authenticator,
        realm: &str,
        hello: &Dict,
    ) -> Result<AuthInfo, HandshakeError> {
        let challenge = authenticator
            .challenge(realm, hello)
            .map_err(|e| HandshakeError::AuthenticationFailed(e.to_string()))?;

        conn.send(&WampMessage::Challenge {
            auth_method: challenge.method,
            extra: challenge.extra,
        })
        .await?;

        let answer = match Self::recv_within(conn, self.config.auth_timeout).await {
            Err(HandshakeError::Timeout) => {
                return Err(HandshakeError::AuthenticationFailed(
                    "no answer to the challenge in time".into(),
                ))
            }
            other => other?,
        };

        match answer {
            Some(WampMessage::Authenticate { signature, extra }) => authenticator
                .authenticate(realm, hello, &signature, &extra)
                .map_err(|e| HandshakeError::AuthenticationFailed(e.to_string())),
            Some(WampMessage::Abort { .. }) | None => Err(HandshakeError::Closed),
            Some(other) => Err(HandshakeError::ProtocolViolation(format!(
                "expected AUTHENTICATE, got {:?}",
                other.message_type()
            ))),
        }
    }

    fn welcome_details(&self, auth: &AuthInfo) -> Dict {
        let mut details = Dict::new();
        details.insert("authid".into(), Value::from(auth.authid.as_str()));
        details.insert("authrole".into(), Value::from(auth.authrole.as_str()));
        details.insert("authmethod".into(), Value::from(auth.authmethod.as_str()));
        details.insert("authprovider".into(), Value::from(auth.authprovider.as_str()));
        details.insert("agent".into(), Value::from(self.config.agent.as_str()));
        details.insert("roles".into(), Value::Dict(handler::router_roles()));
        details
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
