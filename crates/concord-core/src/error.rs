//! Error types for routing.
//!
//! Failures that travel back to a peer are [`WampError`] values: a kind
//! (mapped to an error URI) plus optional arguments. Failures of the Rust
//! API are [`RouterError`]s, and failures before a session is welcomed
//! are [`HandshakeError`]s.

use std::fmt;

use concord_protocol::{Dict, Id, List, Value, WampMessage};
use concord_transport::TransportError;
use thiserror::Error;

/// Error kinds with a well-known URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ProtocolViolation,
    InvalidUri,
    NoSuchRealm,
    NoSuchProcedure,
    NoSuchSubscription,
    NoSuchRegistration,
    NoSuchSession,
    ProcedureAlreadyExists,
    DuplicateCallId,
    InvalidArgument,
    RuntimeError,
    AuthenticationFailed,
    CalleeGone,
    Timeout,
    /// Any other URI, passed through unchanged.
    Application(String),
}

impl ErrorKind {
    /// The error URI sent on the wire.
    #[must_use]
    pub fn uri(&self) -> &str {
        match self {
            ErrorKind::ProtocolViolation => "wamp.error.protocol_violation",
            ErrorKind::InvalidUri => "wamp.error.invalid_uri",
            ErrorKind::NoSuchRealm => "wamp.error.no_such_realm",
            ErrorKind::NoSuchProcedure => "wamp.error.no_such_procedure",
            ErrorKind::NoSuchSubscription => "wamp.error.no_such_subscription",
            ErrorKind::NoSuchRegistration => "wamp.error.no_such_registration",
            ErrorKind::NoSuchSession => "wamp.error.no_such_session",
            ErrorKind::ProcedureAlreadyExists => "wamp.error.procedure_already_exists",
            ErrorKind::DuplicateCallId => "wamp.error.duplicate_call_id",
            ErrorKind::InvalidArgument => "wamp.error.invalid_argument",
            ErrorKind::RuntimeError => "wamp.error.runtime_error",
            ErrorKind::AuthenticationFailed => "wamp.error.authentication_failed",
            ErrorKind::CalleeGone => "wamp.error.callee_gone",
            ErrorKind::Timeout => "wamp.error.timeout",
            ErrorKind::Application(uri) => uri,
        }
    }

    /// Map a URI back to its kind. Unknown URIs become [`ErrorKind::Application`].
    #[must_use]
    pub fn from_uri(uri: &str) -> Self {
        match uri {
            "wamp.error.protocol_violation" => ErrorKind::ProtocolViolation,
            "wamp.error.invalid_uri" => ErrorKind::InvalidUri,
            "wamp.error.no_such_realm" => ErrorKind::NoSuchRealm,
            "wamp.error.no_such_procedure" => ErrorKind::NoSuchProcedure,
            "wamp.error.no_such_subscription" => ErrorKind::NoSuchSubscription,
            "wamp.error.no_such_registration" => ErrorKind::NoSuchRegistration,
            "wamp.error.no_such_session" => ErrorKind::NoSuchSession,
            "wamp.error.procedure_already_exists" => ErrorKind::ProcedureAlreadyExists,
            "wamp.error.duplicate_call_id" => ErrorKind::DuplicateCallId,
            "wamp.error.invalid_argument" => ErrorKind::InvalidArgument,
            "wamp.error.runtime_error" => ErrorKind::RuntimeError,
            "wamp.error.authentication_failed" => ErrorKind::AuthenticationFailed,
            "wamp.error.callee_gone" => ErrorKind::CalleeGone,
            "wamp.error.timeout" => ErrorKind::Timeout,
            other => ErrorKind::Application(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.uri())
    }
}

/// An error outcome as seen by a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct WampError {
    pub kind: ErrorKind,
    pub args: List,
    pub kwargs: Dict,
}

impl WampError {
    #[must_use]
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            args: List::new(),
            kwargs: Dict::new(),
        }
    }

    /// An error whose first positional argument is a human readable message.
    #[must_use]
    pub fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            args: vec![Value::String(message.into())],
            kwargs: Dict::new(),
        }
    }

    /// An error received from a peer, with its URI and payload untouched.
    #[must_use]
    pub fn from_wire(uri: &str, args: List, kwargs: Dict) -> Self {
        Self {
            kind: ErrorKind::from_uri(uri),
            args,
            kwargs,
        }
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        self.kind.uri()
    }

    /// The message, if the first argument is a string.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.args.first().and_then(Value::as_str)
    }

    /// The ERROR reply to a request of the given type.
    #[must_use]
    pub fn into_message(self, request_type: concord_protocol::MessageType, request: Id) -> WampMessage {
        WampMessage::error(request_type, request, self.kind.uri(), self.args, self.kwargs)
    }
}

impl fmt::Display for WampError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(message) => write!(f, "{}: {}", self.uri(), message),
            None => f.write_str(self.uri()),
        }
    }
}

impl std::error::Error for WampError {}

impl From<ErrorKind> for WampError {
    fn from(kind: ErrorKind) -> Self {
        WampError::new(kind)
    }
}

/// Errors returned by the router's Rust API.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Invalid URI.
    #[error("Invalid URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: &'static str },

    /// The procedure is already registered in this realm.
    #[error("Procedure already registered: {0}")]
    ProcedureAlreadyExists(String),

    /// No such procedure.
    #[error("No such procedure: {0}")]
    NoSuchProcedure(String),

    /// No registration with this id is owned by the caller.
    #[error("No such registration: {0}")]
    NoSuchRegistration(Id),

    /// No subscription with this id is owned by the caller.
    #[error("No such subscription: {0}")]
    NoSuchSubscription(Id),

    /// The call id is already in flight for this session.
    #[error("Duplicate call id: {0}")]
    DuplicateCallId(Id),
}

impl RouterError {
    /// The wire error kind for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            RouterError::InvalidUri { .. } => ErrorKind::InvalidUri,
            RouterError::ProcedureAlreadyExists(_) => ErrorKind::ProcedureAlreadyExists,
            RouterError::NoSuchProcedure(_) => ErrorKind::NoSuchProcedure,
            RouterError::NoSuchRegistration(_) => ErrorKind::NoSuchRegistration,
            RouterError::NoSuchSubscription(_) => ErrorKind::NoSuchSubscription,
            RouterError::DuplicateCallId(_) => ErrorKind::DuplicateCallId,
        }
    }
}

impl From<RouterError> for WampError {
    fn from(error: RouterError) -> Self {
        WampError::with_message(error.kind(), error.to_string())
    }
}

/// Reasons a connection never becomes a session.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The peer did not send HELLO in time.
    #[error("Handshake timed out")]
    Timeout,

    /// The first message was not HELLO, or AUTHENTICATE was expected.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The realm name is not acceptable.
    #[error("Invalid realm: {0}")]
    InvalidRealm(String),

    /// The authenticator rejected the peer, or it did not answer in time.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The connection closed during the handshake.
    #[error("Connection closed during handshake")]
    Closed,

    /// Transport error.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl HandshakeError {
    /// The ABORT message to send before closing, if the peer can still
    /// receive one.
    #[must_use]
    pub fn abort_message(&self) -> Option<WampMessage> {
        let (kind, message) = match self {
            HandshakeError::Timeout => (ErrorKind::Timeout, "no HELLO received in time".to_string()),
            HandshakeError::ProtocolViolation(m) => (ErrorKind::ProtocolViolation, m.clone()),
            HandshakeError::InvalidRealm(m) => (ErrorKind::NoSuchRealm, m.clone()),
            HandshakeError::AuthenticationFailed(m) => (ErrorKind::AuthenticationFailed, m.clone()),
            HandshakeError::Transport(TransportError::Protocol(e)) => {
                (ErrorKind::ProtocolViolation, e.to_string())
            }
            HandshakeError::Closed | HandshakeError::Transport(_) => return None,
        };
        Some(WampMessage::abort(kind.uri(), message))
    }
}
