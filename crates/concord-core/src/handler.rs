//! Dispatch of messages from welcomed sessions.

use concord_protocol::{Dict, Id, MessageType, Value, WampMessage};
use tracing::{debug, trace, warn};

use crate::broker::PublishOptions;
use crate::error::{ErrorKind, RouterError, WampError};
use crate::realm::Realm;
use crate::session::SessionHandle;
use crate::uri::{validate_client_uri, validate_uri};

/// What the session loop does after a message.
#[derive(Debug, PartialEq)]
pub(crate) enum Flow {
    Continue,
    /// Send the message (if any) and close the session.
    Close(Option<WampMessage>),
}

fn invalid_uri(uri: &str, reason: &'static str) -> WampError {
    RouterError::InvalidUri {
        uri: uri.to_string(),
        reason,
    }
    .into()
}

fn reply_error(session: &SessionHandle, request_type: MessageType, request: Id, error: WampError) {
    trace!(session = session.id(), request, error = %error, "Replying with error");
    session.send(error.into_message(request_type, request));
}

fn violation(message: impl Into<String>) -> Flow {
    Flow::Close(Some(WampMessage::abort(
        ErrorKind::ProtocolViolation.uri(),
        message,
    )))
}

/// Handle one message from a welcomed session.
pub(crate) fn handle(session: &SessionHandle, realm: &Realm, message: WampMessage) -> Flow {
    match message {
        WampMessage::Register { request, procedure, .. } => {
            if let Err(reason) = validate_client_uri(&procedure) {
                reply_error(session, MessageType::Register, request, invalid_uri(&procedure, reason));
                return Flow::Continue;
            }
            match realm.dealer().register_callee(session, &procedure) {
                Ok(registration) => {
                    session.send(WampMessage::Registered { request, registration });
                }
                Err(e) => reply_error(session, MessageType::Register, request, e.into()),
            }
        }

        WampMessage::Unregister { request, registration } => {
            match realm.dealer().unregister_owned(session.id(), registration) {
                Ok(()) => {
                    session.send(WampMessage::Unregistered { request });
                }
                Err(e) => reply_error(session, MessageType::Unregister, request, e.into()),
            }
        }

        WampMessage::Call {
            request,
            options,
            procedure,
            args,
            kwargs,
        } => {
            if let Err(reason) = validate_uri(&procedure) {
                reply_error(session, MessageType::Call, request, invalid_uri(&procedure, reason));
                return Flow::Continue;
            }
            realm
                .dealer()
                .call(session, request, &procedure, &options, args, kwargs);
        }

        WampMessage::Yield { request, args, kwargs, .. } => {
            realm.dealer().yield_result(session.id(), request, args, kwargs);
        }

        WampMessage::Error {
            request_type,
            request,
            error,
            args,
            kwargs,
            ..
        } => {
            if request_type != MessageType::Invocation {
                return violation(format!("ERROR for a {request_type:?} is not accepted from a peer"));
            }
            realm
                .dealer()
                .invocation_error(session.id(), request, WampError::from_wire(&error, args, kwargs));
        }

        WampMessage::Subscribe { request, topic, .. } => {
            if let Err(reason) = validate_uri(&topic) {
                reply_error(session, MessageType::Subscribe, request, invalid_uri(&topic, reason));
                return Flow::Continue;
            }
            let subscription = realm.broker().subscribe(session, &topic);
            session.send(WampMessage::Subscribed { request, subscription });
        }

        WampMessage::Unsubscribe { request, subscription } => {
            match realm.broker().unsubscribe(session.id(), subscription) {
                Ok(()) => {
                    session.send(WampMessage::Unsubscribed { request });
                }
                Err(e) => reply_error(session, MessageType::Unsubscribe, request, e.into()),
            }
        }

        WampMessage::Publish {
            request,
            options,
            topic,
            args,
            kwargs,
        } => {
            let options = PublishOptions::from_dict(&options);
            if let Err(reason) = validate_client_uri(&topic) {
                if options.acknowledge {
                    reply_error(session, MessageType::Publish, request, invalid_uri(&topic, reason));
                } else {
                    debug!(session = session.id(), topic = %topic, reason, "Dropped publish to invalid topic");
                }
                return Flow::Continue;
            }
            let publication = realm
                .broker()
                .publish(Some(session.id()), &topic, &options, args, kwargs);
            if options.acknowledge {
                session.send(WampMessage::Published { request, publication });
            }
        }

        WampMessage::Goodbye { reason, .. } => {
            debug!(session = session.id(), reason = %reason, "Peer said goodbye");
            return Flow::Close(Some(WampMessage::goodbye("wamp.close.goodbye_and_out")));
        }

        WampMessage::Abort { reason, .. } => {
            debug!(session = session.id(), reason = %reason, "Peer aborted");
            return Flow::Close(None);
        }

        other => {
            warn!(session = session.id(), message_type = ?other.message_type(), "Unexpected message");
            return violation(format!(
                "{:?} is not valid in an established session",
                other.message_type()
            ));
        }
    }

    Flow::Continue
}

/// Details reported in WELCOME for the roles this router plays.
pub(crate) fn router_roles() -> Dict {
    let feature_set = |features: &[&str]| {
        let mut set = Dict::new();
        for feature in features {
            set.insert((*feature).to_string(), Value::Bool(true));
        }
        let mut role = Dict::new();
        role.insert("features".into(), Value::Dict(set));
        Value::Dict(role)
    };

    let mut roles = Dict::new();
    roles.insert(
        "broker".into(),
        feature_set(&[
            "publisher_identification",
            "publisher_exclusion",
            "subscriber_blackwhite_listing",
            "session_meta_api",
        ]),
    );
    roles.insert(
        "dealer".into(),
        feature_set(&["caller_identification", "call_timeout", "registration_meta_api"]),
    );
    roles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::test_session;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn recv(rx: &mut UnboundedReceiver<WampMessage>) -> WampMessage {
        rx.try_recv().expect("no message queued")
    }

    #[test]
    fn test_register_and_unregister() {
        let realm = Realm::new("realm1", None);
        let (session, mut rx) = test_session(1, "realm1");

        let flow = handle(&session, &realm, WampMessage::register(1, "com.example.add"));
        assert_eq!(flow, Flow::Continue);
        let registration = match recv(&mut rx) {
            WampMessage::Registered { request: 1, registration } => registration,
            other => panic!("Expected REGISTERED, got {:?}", other),
        };

        handle(&session, &realm, WampMessage::register(2, "com.example.add"));
        match recv(&mut rx) {
            WampMessage::Error { request_type, error, .. } => {
                assert_eq!(request_type, MessageType::Register);
                assert_eq!(error, "wamp.error.procedure_already_exists");
            }
            other => panic!("Expected ERROR, got {:?}", other),
        }

        handle(&session, &realm, WampMessage::Unregister { request: 3, registration });
        assert_eq!(recv(&mut rx), WampMessage::Unregistered { request: 3 });

        handle(&session, &realm, WampMessage::Unregister { request: 4, registration });
        match recv(&mut rx) {
            WampMessage::Error { error, .. } => assert_eq!(error, "wamp.error.no_such_registration"),
            other => panic!("Expected ERROR, got {:?}", other),
        }
    }

    #[test]
    fn test_reserved_uris_rejected() {
        let realm = Realm::new("realm1", None);
        let (session, mut rx) = test_session(1, "realm1");

        handle(&session, &realm, WampMessage::register(1, "wamp.session.count"));
        match recv(&mut rx) {
            WampMessage::Error { error, .. } => assert_eq!(error, "wamp.error.invalid_uri"),
            other => panic!("Expected ERROR, got {:?}", other),
        }

        handle(&session, &realm, WampMessage::subscribe(2, "bad..topic"));
        match recv(&mut rx) {
            WampMessage::Error { request_type, error, .. } => {
                assert_eq!(request_type, MessageType::Subscribe);
                assert_eq!(error, "wamp.error.invalid_uri");
            }
            other => panic!("Expected ERROR, got {:?}", other),
        }

        // Subscribing to the meta topics is allowed
        handle(&session, &realm, WampMessage::subscribe(3, "wamp.session.on_join"));
        assert!(matches!(recv(&mut rx), WampMessage::Subscribed { request: 3, .. }));
    }

    #[test]
    fn test_publish_acknowledge() {
        let realm = Realm::new("realm1", None);
        let (session, mut rx) = test_session(1, "realm1");

        handle(&session, &realm, WampMessage::publish(1, "com.example.t", vec![], Dict::new()));
        assert!(rx.try_recv().is_err());

        let mut options = Dict::new();
        options.insert("acknowledge".into(), Value::Bool(true));
        let publish = WampMessage::Publish {
            request: 2,
            options: options.clone(),
            topic: "com.example.t".into(),
            args: vec![],
            kwargs: Dict::new(),
        };
        handle(&session, &realm, publish);
        assert!(matches!(recv(&mut rx), WampMessage::Published { request: 2, .. }));

        let publish = WampMessage::Publish {
            request: 3,
            options,
            topic: "wamp.session.on_join".into(),
            args: vec![],
            kwargs: Dict::new(),
        };
        handle(&session, &realm, publish);
        match recv(&mut rx) {
            WampMessage::Error { request_type, error, .. } => {
                assert_eq!(request_type, MessageType::Publish);
                assert_eq!(error, "wamp.error.invalid_uri");
            }
            other => panic!("Expected ERROR, got {:?}", other),
        }
    }

    #[test]
    fn test_unsubscribe_unknown() {
        let realm = Realm::new("realm1", None);
        let (session, mut rx) = test_session(1, "realm1");

        handle(&session, &realm, WampMessage::Unsubscribe { request: 1, subscription: 77 });
        match recv(&mut rx) {
            WampMessage::Error { request_type, error, .. } => {
                assert_eq!(request_type, MessageType::Unsubscribe);
                assert_eq!(error, "wamp.error.no_such_subscription");
            }
            other => panic!("Expected ERROR, got {:?}", other),
        }
    }

    #[test]
    fn test_goodbye_closes() {
        let realm = Realm::new("realm1", None);
        let (session, _rx) = test_session(1, "realm1");

        let flow = handle(&session, &realm, WampMessage::goodbye("wamp.close.normal"));
        assert_eq!(
            flow,
            Flow::Close(Some(WampMessage::goodbye("wamp.close.goodbye_and_out")))
        );
    }

    #[test]
    fn test_unexpected_messages_violate_protocol() {
        let realm = Realm::new("realm1", None);
        let (session, _rx) = test_session(1, "realm1");

        let flow = handle(&session, &realm, WampMessage::hello("realm1", Dict::new()));
        match flow {
            Flow::Close(Some(WampMessage::Abort { reason, .. })) => {
                assert_eq!(reason, "wamp.error.protocol_violation");
            }
            other => panic!("Expected ABORT, got {:?}", other),
        }

        let error = WampMessage::error(MessageType::Call, 1, "com.example.oops", vec![], Dict::new());
        assert!(matches!(handle(&session, &realm, error), Flow::Close(Some(_))));
    }

    #[tokio::test]
    async fn test_call_through_handler() {
        let realm = Realm::new("realm1", None);
        let (callee, mut callee_rx) = test_session(1, "realm1");
        let (caller, mut caller_rx) = test_session(2, "realm1");

        handle(&callee, &realm, WampMessage::register(1, "com.example.add"));
        let _ = recv(&mut callee_rx);

        handle(
            &caller,
            &realm,
            WampMessage::call(7, "com.example.add", vec![2.into(), 3.into()], Dict::new()),
        );
        let request = match recv(&mut callee_rx) {
            WampMessage::Invocation { request, .. } => request,
            other => panic!("Expected INVOCATION, got {:?}", other),
        };

        handle(&callee, &realm, WampMessage::yield_result(request, vec![5.into()], Dict::new()));
        let result = tokio::time::timeout(Duration::from_secs(1), caller_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match result {
            WampMessage::Result { request, args, .. } => {
                assert_eq!(request, 7);
                assert_eq!(args, vec![Value::from(5)]);
            }
            other => panic!("Expected RESULT, got {:?}", other),
        }
    }
}
