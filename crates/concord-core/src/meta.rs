//! Session and registration meta API.
//!
//! Each realm gets a set of router-owned procedures under `wamp.session.*`
//! and `wamp.registration.*`, plus join/leave events.

use std::sync::{Arc, Weak};

use anyhow::anyhow;
use concord_protocol::{Dict, Value};
use tracing::{trace, warn};

use crate::broker::PublishOptions;
use crate::error::{ErrorKind, WampError};
use crate::realm::Realm;
use crate::rpc::{Arguments, LocalRpcOperation, OperationDescriptor, RpcParameter};
use crate::session::{SessionDetails, SessionRegistry};

pub const SESSION_COUNT: &str = "wamp.session.count";
pub const SESSION_LIST: &str = "wamp.session.list";
pub const SESSION_GET: &str = "wamp.session.get";
pub const REGISTRATION_LOOKUP: &str = "wamp.registration.lookup";
pub const REGISTRATION_LIST: &str = "wamp.registration.list";
pub const ON_JOIN: &str = "wamp.session.on_join";
pub const ON_LEAVE: &str = "wamp.session.on_leave";

fn realm_gone() -> anyhow::Error {
    anyhow!("realm is shutting down")
}

/// Register the meta procedures on a realm.
pub fn install(realm: &Arc<Realm>, sessions: &Arc<SessionRegistry>) {
    let name = realm.name().to_string();
    let weak: Weak<Realm> = Arc::downgrade(realm);

    let registry = Arc::clone(sessions);
    let realm_name = name.clone();
    let count = LocalRpcOperation::sync(OperationDescriptor::new(SESSION_COUNT), move |_: Arguments| {
        Ok(Value::from(registry.in_realm(&realm_name).len()))
    });

    let registry = Arc::clone(sessions);
    let realm_name = name.clone();
    let list = LocalRpcOperation::sync(OperationDescriptor::new(SESSION_LIST), move |_: Arguments| {
        let ids = registry
            .in_realm(&realm_name)
            .iter()
            .map(|s| Value::from(s.id()))
            .collect::<Vec<_>>();
        Ok(Value::List(ids))
    });

    let registry = Arc::clone(sessions);
    let realm_name = name;
    let get = LocalRpcOperation::sync(
        OperationDescriptor::new(SESSION_GET).param(RpcParameter::required("session")),
        move |args: Arguments| {
            let id: u64 = args.get("session")?;
            match registry.get(id) {
                Some(session) if session.realm() == realm_name => {
                    Ok(Value::Dict(session.details().to_dict()))
                }
                _ => Err(WampError::with_message(
                    ErrorKind::NoSuchSession,
                    format!("no session {id} in this realm"),
                )
                .into()),
            }
        },
    );

    let realm_ref = weak.clone();
    let lookup = LocalRpcOperation::sync(
        OperationDescriptor::new(REGISTRATION_LOOKUP).param(RpcParameter::required("procedure")),
        move |args: Arguments| {
            let procedure: String = args.get("procedure")?;
            let realm = realm_ref.upgrade().ok_or_else(realm_gone)?;
            Ok(Value::from(realm.dealer().lookup(&procedure)))
        },
    );

    let realm_ref = weak;
    let registrations = LocalRpcOperation::sync(
        OperationDescriptor::new(REGISTRATION_LIST),
        move |_: Arguments| {
            let realm = realm_ref.upgrade().ok_or_else(realm_gone)?;
            let exact = realm
                .dealer()
                .registration_ids()
                .into_iter()
                .map(Value::from)
                .collect::<Vec<_>>();
            let mut dict = Dict::new();
            dict.insert("exact".into(), Value::List(exact));
            dict.insert("prefix".into(), Value::List(Vec::new()));
            dict.insert("wildcard".into(), Value::List(Vec::new()));
            Ok(Value::Dict(dict))
        },
    );

    for operation in [count, list, get, lookup, registrations] {
        let procedure = operation.descriptor().procedure.clone();
        if let Err(e) = realm.dealer().register(Arc::new(operation)) {
            warn!(realm = %realm.name(), procedure = %procedure, error = %e, "Meta procedure not installed");
        }
    }
    trace!(realm = %realm.name(), "Installed meta API");
}

/// Announce a new session to the realm.
pub fn session_joined(realm: &Realm, details: &SessionDetails) {
    realm.broker().publish(
        None,
        ON_JOIN,
        &PublishOptions::default(),
        vec![Value::Dict(details.to_dict())],
        Dict::new(),
    );
}

/// Announce a departed session to the realm.
pub fn session_left(realm: &Realm, details: &SessionDetails) {
    realm.broker().publish(
        None,
        ON_LEAVE,
        &PublishOptions::default(),
        vec![Value::from(details.session)],
        Dict::new(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{CallOutcome, CallResult};
    use crate::session::tests::test_session;
    use concord_protocol::{List, WampMessage};
    use std::time::Duration;

    async fn call(realm: &Arc<Realm>, procedure: &str, args: List) -> CallOutcome {
        let (callee, mut rx) = test_session(1000, "realm1");
        realm
            .dealer()
            .call(&callee, 1, procedure, &Dict::new(), args, Dict::new());
        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match message {
            WampMessage::Result { args, kwargs, .. } => Ok(CallResult::new(args, kwargs)),
            WampMessage::Error { error, args, kwargs, .. } => Err(WampError::from_wire(&error, args, kwargs)),
            other => panic!("Unexpected {:?}", other),
        }
    }

    fn setup() -> (Arc<Realm>, Arc<SessionRegistry>) {
        let realm = Arc::new(Realm::new("realm1", None));
        let sessions = Arc::new(SessionRegistry::new());
        install(&realm, &sessions);
        (realm, sessions)
    }

    #[tokio::test]
    async fn test_session_count_and_list() {
        let (realm, sessions) = setup();
        let (a, _rx_a) = test_session(5, "realm1");
        let (b, _rx_b) = test_session(3, "realm1");
        let (other, _rx_o) = test_session(4, "realm2");
        sessions.insert(a);
        sessions.insert(b);
        sessions.insert(other);

        let count = call(&realm, SESSION_COUNT, vec![]).await.unwrap();
        assert_eq!(count.args, vec![Value::from(2)]);

        let list = call(&realm, SESSION_LIST, vec![]).await.unwrap();
        assert_eq!(list.args, vec![Value::List(vec![Value::from(3), Value::from(5)])]);
    }

    #[tokio::test]
    async fn test_session_get() {
        let (realm, sessions) = setup();
        let (a, _rx_a) = test_session(5, "realm1");
        sessions.insert(a);

        let details = call(&realm, SESSION_GET, vec![Value::from(5)]).await.unwrap();
        let dict = details.args[0].as_dict().unwrap();
        assert_eq!(dict["authid"], Value::from("anonymous-5"));

        let missing = call(&realm, SESSION_GET, vec![Value::from(6)]).await.unwrap_err();
        assert_eq!(missing.kind, ErrorKind::NoSuchSession);

        let bad = call(&realm, SESSION_GET, vec![]).await.unwrap_err();
        assert_eq!(bad.kind, ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_registration_lookup_and_list() {
        let (realm, _sessions) = setup();
        let (callee, _rx) = test_session(1, "realm1");
        let id = realm.dealer().register_callee(&callee, "com.example.add").unwrap();

        let found = call(&realm, REGISTRATION_LOOKUP, vec!["com.example.add".into()]).await.unwrap();
        assert_eq!(found.args, vec![Value::from(id)]);

        let missing = call(&realm, REGISTRATION_LOOKUP, vec!["com.example.nope".into()]).await.unwrap();
        assert_eq!(missing.args, vec![Value::Null]);

        let listed = call(&realm, REGISTRATION_LIST, vec![]).await.unwrap();
        let exact = listed.args[0].as_dict().unwrap()["exact"].as_list().unwrap().clone();
        assert!(exact.contains(&Value::from(id)));
        // The meta procedures themselves are registrations too
        assert_eq!(exact.len(), 6);
    }

    #[tokio::test]
    async fn test_join_and_leave_events() {
        let (realm, _sessions) = setup();
        let (watcher, mut rx) = test_session(1, "realm1");
        realm.broker().subscribe(&watcher, ON_JOIN);
        realm.broker().subscribe(&watcher, ON_LEAVE);

        let (joined, _rx_j) = test_session(2, "realm1");
        session_joined(&realm, joined.details());
        session_left(&realm, joined.details());

        match rx.try_recv().unwrap() {
            WampMessage::Event { args, .. } => {
                assert_eq!(args[0].as_dict().unwrap()["session"], Value::from(2));
            }
            other => panic!("Expected EVENT, got {:?}", other),
        }
        match rx.try_recv().unwrap() {
            WampMessage::Event { args, .. } => assert_eq!(args, vec![Value::from(2)]),
            other => panic!("Expected EVENT, got {:?}", other),
        }
    }

    #[test]
    fn test_install_twice_keeps_existing() {
        let (realm, sessions) = setup();
        install(&realm, &sessions);
        assert_eq!(realm.dealer().registration_count(), 5);

        let operation = LocalRpcOperation::sync(OperationDescriptor::new(SESSION_COUNT), |_: Arguments| {
            Ok(Value::Null)
        });
        assert!(realm.dealer().register(Arc::new(operation)).is_err());
    }
}
