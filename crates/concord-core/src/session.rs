//! Sessions and the session registry.
//!
//! A session owns one outbound queue. Everything the router sends to a
//! peer (replies, results, events) goes through that queue, which keeps
//! per-session delivery in emission order.

use std::fmt;
use std::sync::Arc;

use concord_protocol::{Dict, Id, Value, WampMessage};
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::auth::AuthInfo;
use crate::id::IdGenerator;

/// A session identifier.
pub type SessionId = Id;

const EVENT_CAPACITY: usize = 1024;

/// Immutable facts about a welcomed session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDetails {
    pub session: SessionId,
    pub realm: String,
    pub auth: AuthInfo,
    /// Binding (subprotocol) the connection was accepted on.
    pub transport: String,
}

impl SessionDetails {
    /// Details as reported by the meta API.
    #[must_use]
    pub fn to_dict(&self) -> Dict {
        let mut dict = Dict::new();
        dict.insert("session".into(), Value::from(self.session));
        dict.insert("realm".into(), Value::from(self.realm.as_str()));
        dict.insert("authid".into(), Value::from(self.auth.authid.as_str()));
        dict.insert("authrole".into(), Value::from(self.auth.authrole.as_str()));
        dict.insert("authmethod".into(), Value::from(self.auth.authmethod.as_str()));
        dict.insert("authprovider".into(), Value::from(self.auth.authprovider.as_str()));

        let mut transport = Dict::new();
        transport.insert("protocol".into(), Value::from(self.transport.as_str()));
        dict.insert("transport".into(), Value::Dict(transport));
        dict
    }
}

/// A cheap, cloneable reference to a live session.
#[derive(Clone)]
pub struct SessionHandle {
    details: Arc<SessionDetails>,
    outbound: mpsc::UnboundedSender<WampMessage>,
}

impl SessionHandle {
    #[must_use]
    pub fn new(details: SessionDetails, outbound: mpsc::UnboundedSender<WampMessage>) -> Self {
        Self {
            details: Arc::new(details),
            outbound,
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.details.session
    }

    #[must_use]
    pub fn realm(&self) -> &str {
        &self.details.realm
    }

    #[must_use]
    pub fn details(&self) -> &Arc<SessionDetails> {
        &self.details
    }

    /// Queue a message for the peer.
    ///
    /// Returns `false` if the session has ended.
    pub fn send(&self, message: WampMessage) -> bool {
        self.outbound.send(message).is_ok()
    }

    /// Whether the session's outbound queue has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session", &self.details.session)
            .field("realm", &self.details.realm)
            .finish_non_exhaustive()
    }
}

/// Session lifecycle notifications.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Opened(Arc<SessionDetails>),
    Closed(Arc<SessionDetails>),
}

/// All live sessions of a router.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionHandle>,
    ids: IdGenerator,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sessions: DashMap::new(),
            ids: IdGenerator::new(),
            events,
        }
    }

    /// Allocate a session id. Ids are never reused.
    pub fn next_id(&self) -> SessionId {
        self.ids.next()
    }

    /// Track a welcomed session.
    pub fn insert(&self, handle: SessionHandle) {
        let details = Arc::clone(handle.details());
        self.sessions.insert(handle.id(), handle);
        // Nobody listening is fine
        let _ = self.events.send(SessionEvent::Opened(details));
    }

    /// Stop tracking a session.
    pub fn remove(&self, id: SessionId) -> Option<SessionHandle> {
        let (_, handle) = self.sessions.remove(&id)?;
        debug!(session = id, "Session removed from registry");
        let _ = self.events.send(SessionEvent::Closed(Arc::clone(handle.details())));
        Some(handle)
    }

    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<SessionHandle> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    /// Queue a message for a session. Returns `false` if it is gone.
    pub fn send_to(&self, id: SessionId, message: WampMessage) -> bool {
        self.get(id).is_some_and(|s| s.send(message))
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Sessions joined to `realm`, ordered by id.
    #[must_use]
    pub fn in_realm(&self, realm: &str) -> Vec<SessionHandle> {
        let mut sessions: Vec<SessionHandle> = self
            .sessions
            .iter()
            .filter(|s| s.realm() == realm)
            .map(|s| s.value().clone())
            .collect();
        sessions.sort_by_key(SessionHandle::id);
        sessions
    }

    /// Subscribe to session open/close events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
