//! Authentication.
//!
//! When a router has an [`Authenticator`], every HELLO is answered with a
//! CHALLENGE and the session is only welcomed after a matching
//! AUTHENTICATE. Without one, sessions join anonymously.

use std::collections::HashMap;

use concord_protocol::{Dict, Value};
use tracing::debug;

use crate::error::{ErrorKind, WampError};
use crate::session::SessionId;

/// The identity a session was welcomed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    pub authid: String,
    pub authrole: String,
    pub authmethod: String,
    pub authprovider: String,
}

impl AuthInfo {
    /// Identity for a session that joined without authentication.
    #[must_use]
    pub fn anonymous(session: SessionId) -> Self {
        Self {
            authid: format!("anonymous-{session}"),
            authrole: "anonymous".to_string(),
            authmethod: "anonymous".to_string(),
            authprovider: "static".to_string(),
        }
    }
}

/// A challenge to send in reply to HELLO.
#[derive(Debug, Clone, PartialEq)]
pub struct Challenge {
    pub method: String,
    pub extra: Dict,
}

/// Decides whether a peer may join a realm.
pub trait Authenticator: Send + Sync {
    /// Build the challenge for a HELLO.
    ///
    /// # Errors
    ///
    /// Returns an error if none of the offered methods is supported.
    fn challenge(&self, realm: &str, details: &Dict) -> Result<Challenge, WampError>;

    /// Check the peer's answer to the challenge.
    ///
    /// # Errors
    ///
    /// Returns an error if the signature is not accepted.
    fn authenticate(
        &self,
        realm: &str,
        details: &Dict,
        signature: &str,
        extra: &Dict,
    ) -> Result<AuthInfo, WampError>;
}

#[derive(Debug, Clone)]
struct Principal {
    ticket: String,
    role: String,
}

/// WAMP-Ticket authentication against a static principal table.
#[derive(Debug, Clone, Default)]
pub struct TicketAuthenticator {
    principals: HashMap<String, Principal>,
}

impl TicketAuthenticator {
    pub const METHOD: &'static str = "ticket";

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a principal.
    #[must_use]
    pub fn with_principal(
        mut self,
        authid: impl Into<String>,
        ticket: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        self.add_principal(authid, ticket, role);
        self
    }

    pub fn add_principal(
        &mut self,
        authid: impl Into<String>,
        ticket: impl Into<String>,
        role: impl Into<String>,
    ) {
        self.principals.insert(
            authid.into(),
            Principal {
                ticket: ticket.into(),
                role: role.into(),
            },
        );
    }

    fn failed(message: &str) -> WampError {
        WampError::with_message(ErrorKind::AuthenticationFailed, message)
    }
}

fn authid(details: &Dict) -> Option<&str> {
    details.get("authid").and_then(Value::as_str)
}

impl Authenticator for TicketAuthenticator {
    fn challenge(&self, _realm: &str, details: &Dict) -> Result<Challenge, WampError> {
        let offers_ticket = details
            .get("authmethods")
            .and_then(Value::as_list)
            .is_some_and(|methods| methods.iter().any(|m| m.as_str() == Some(Self::METHOD)));
        if !offers_ticket {
            return Err(Self::failed("no supported authentication method offered"));
        }
        if authid(details).is_none() {
            return Err(Self::failed("authid is required for ticket authentication"));
        }

        Ok(Challenge {
            method: Self::METHOD.to_string(),
            extra: Dict::new(),
        })
    }

    fn authenticate(
        &self,
        realm: &str,
        details: &Dict,
        signature: &str,
        _extra: &Dict,
    ) -> Result<AuthInfo, WampError> {
        let authid = authid(details).ok_or_else(|| Self::failed("missing authid"))?;

        match self.principals.get(authid) {
            Some(principal) if principal.ticket == signature => {
                debug!(authid, realm, "Ticket accepted");
                Ok(AuthInfo {
                    authid: authid.to_string(),
                    authrole: principal.role.clone(),
                    authmethod: Self::METHOD.to_string(),
                    authprovider: "static".to_string(),
                })
            }
            _ => Err(Self::failed("invalid ticket")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello_details(authid: &str) -> Dict {
        let mut details = Dict::new();
        details.insert("authid".into(), Value::from(authid));
        details.insert("authmethods".into(), Value::List(vec![Value::from("ticket")]));
        details
    }

    #[test]
    fn test_ticket_accepted() {
        let auth = TicketAuthenticator::new().with_principal("alice", "secret", "admin");
        let details = hello_details("alice");

        let challenge = auth.challenge("realm1", &details).unwrap();
        assert_eq!(challenge.method, "ticket");

        let info = auth
            .authenticate("realm1", &details, "secret", &Dict::new())
            .unwrap();
        assert_eq!(info.authid, "alice");
        assert_eq!(info.authrole, "admin");
        assert_eq!(info.authmethod, "ticket");
    }

    #[test]
    fn test_ticket_rejected() {
        let auth = TicketAuthenticator::new().with_principal("alice", "secret", "admin");

        let err = auth
            .authenticate("realm1", &hello_details("alice"), "wrong", &Dict::new())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthenticationFailed);

        assert!(auth
            .authenticate("realm1", &hello_details("mallory"), "secret", &Dict::new())
            .is_err());
    }

    #[test]
    fn test_challenge_requires_ticket_method() {
        let auth = TicketAuthenticator::new();
        let mut details = hello_details("alice");
        details.insert("authmethods".into(), Value::List(vec![Value::from("wampcra")]));
        assert!(auth.challenge("realm1", &details).is_err());

        details.remove("authid");
        details.insert("authmethods".into(), Value::List(vec![Value::from("ticket")]));
        assert!(auth.challenge("realm1", &details).is_err());
    }

    #[test]
    fn test_anonymous() {
        let info = AuthInfo::anonymous(42);
        assert_eq!(info.authid, "anonymous-42");
        assert_eq!(info.authmethod, "anonymous");
    }
}
