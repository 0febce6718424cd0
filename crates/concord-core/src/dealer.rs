//! RPC routing.
//!
//! The dealer owns a realm's registrations and its pending calls. A
//! pending call is keyed by `(caller session, call id)` and is resolved
//! exactly once: by the operation's outcome, by a timeout, or by the
//! caller leaving. Resolution removes the entry from the table first, and
//! only the remover acts, so racing resolutions are harmless.

use std::sync::{Arc, Weak};
use std::time::Duration;

use concord_protocol::{Dict, Id, List, MessageType, Value, WampMessage};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::error::{ErrorKind, RouterError, WampError};
use crate::id::IdGenerator;
use crate::rpc::{
    CallOutcome, CallResult, CalleeRpcOperation, InvocationDetails, InvocationTable, RpcOperation,
};
use crate::session::{SessionHandle, SessionId};

/// A procedure binding.
struct Registration {
    id: Id,
    owner: Option<SessionId>,
    operation: Arc<dyn RpcOperation>,
}

/// Returned by [`Dealer::register`]; pass it to [`Dealer::unregister`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationHandle {
    id: Id,
    procedure: String,
}

impl RegistrationHandle {
    #[must_use]
    pub fn id(&self) -> Id {
        self.id
    }

    #[must_use]
    pub fn procedure(&self) -> &str {
        &self.procedure
    }
}

struct PendingCall {
    caller: SessionHandle,
    timer: Option<AbortHandle>,
}

type CallKey = (SessionId, Id);

struct DealerState {
    registrations: DashMap<String, Registration>,
    by_id: DashMap<Id, String>,
    pending: DashMap<CallKey, PendingCall>,
    invocations: Arc<InvocationTable>,
    ids: IdGenerator,
}

impl DealerState {
    /// Resolve a pending call. Only the first resolution for a key has an
    /// effect.
    fn resolve(&self, key: CallKey, outcome: CallOutcome) -> bool {
        let Some((_, pending)) = self.pending.remove(&key) else {
            debug!(caller = key.0, request = key.1, "Dropped outcome for resolved call");
            return false;
        };

        if let Some(timer) = pending.timer {
            timer.abort();
        }

        let (caller, request) = key;
        let message = match outcome {
            Ok(result) => WampMessage::Result {
                request,
                details: Dict::new(),
                args: result.args,
                kwargs: result.kwargs,
            },
            Err(error) => error.into_message(MessageType::Call, request),
        };

        if !pending.caller.send(message) {
            debug!(caller, request, "Caller left before the result arrived");
        }
        true
    }
}

/// Per-realm RPC router.
pub struct Dealer {
    state: Arc<DealerState>,
    default_timeout: Option<Duration>,
}

impl Dealer {
    #[must_use]
    pub fn new(default_timeout: Option<Duration>) -> Self {
        Self {
            state: Arc::new(DealerState {
                registrations: DashMap::new(),
                by_id: DashMap::new(),
                pending: DashMap::new(),
                invocations: Arc::new(InvocationTable::default()),
                ids: IdGenerator::new(),
            }),
            default_timeout,
        }
    }

    fn insert(
        &self,
        procedure: &str,
        owner: Option<SessionId>,
        make: impl FnOnce(Id) -> Arc<dyn RpcOperation>,
    ) -> Result<Id, RouterError> {
        match self.state.registrations.entry(procedure.to_string()) {
            Entry::Occupied(_) => Err(RouterError::ProcedureAlreadyExists(procedure.to_string())),
            Entry::Vacant(slot) => {
                let id = self.state.ids.next();
                slot.insert(Registration {
                    id,
                    owner,
                    operation: make(id),
                });
                self.state.by_id.insert(id, procedure.to_string());
                debug!(procedure, registration = id, owner, "Registered procedure");
                Ok(id)
            }
        }
    }

    /// Bind a procedure to an operation owned by the router.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::ProcedureAlreadyExists`] if the name is taken.
    pub fn register(&self, operation: Arc<dyn RpcOperation>) -> Result<RegistrationHandle, RouterError> {
        let procedure = operation.procedure().to_string();
        let id = self.insert(&procedure, None, |_| operation)?;
        Ok(RegistrationHandle { id, procedure })
    }

    /// Bind a procedure to a callee session.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::ProcedureAlreadyExists`] if the name is taken.
    pub fn register_callee(&self, callee: &SessionHandle, procedure: &str) -> Result<Id, RouterError> {
        let invocations = Arc::clone(&self.state.invocations);
        self.insert(procedure, Some(callee.id()), |id| {
            Arc::new(CalleeRpcOperation::new(procedure, id, callee.clone(), invocations))
        })
    }

    /// Remove a registration. Removing twice is a no-op.
    ///
    /// Calls already routed to the operation run to completion.
    pub fn unregister(&self, handle: &RegistrationHandle) -> bool {
        self.remove(handle.id, None)
    }

    /// Remove a registration on behalf of the session that owns it.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::NoSuchRegistration`] if the session does not
    /// own a registration with this id.
    pub fn unregister_owned(&self, session: SessionId, registration: Id) -> Result<(), RouterError> {
        if self.remove(registration, Some(session)) {
            Ok(())
        } else {
            Err(RouterError::NoSuchRegistration(registration))
        }
    }

    fn remove(&self, registration: Id, owner: Option<SessionId>) -> bool {
        let Some(procedure) = self.state.by_id.get(&registration).map(|p| p.clone()) else {
            return false;
        };

        let removed = self
            .state
            .registrations
            .remove_if(&procedure, |_, r| {
                r.id == registration && (owner.is_none() || r.owner == owner)
            })
            .is_some();

        if removed {
            self.state.by_id.remove(&registration);
            debug!(procedure = %procedure, registration, "Unregistered procedure");
        }
        removed
    }

    /// Route a call.
    ///
    /// Errors are reported to the caller as ERROR messages; the outcome
    /// arrives on the caller's session queue.
    pub fn call(
        &self,
        caller: &SessionHandle,
        request: Id,
        procedure: &str,
        options: &Dict,
        args: List,
        kwargs: Dict,
    ) {
        let operation = match self.state.registrations.get(procedure) {
            Some(registration) => Arc::clone(&registration.operation),
            None => {
                trace!(procedure, caller = caller.id(), "No such procedure");
                let error = WampError::with_message(
                    ErrorKind::NoSuchProcedure,
                    format!("no procedure registered under '{procedure}'"),
                );
                caller.send(error.into_message(MessageType::Call, request));
                return;
            }
        };

        let key = (caller.id(), request);
        match self.state.pending.entry(key) {
            Entry::Occupied(_) => {
                warn!(caller = caller.id(), request, "Duplicate call id");
                let error: WampError = RouterError::DuplicateCallId(request).into();
                caller.send(error.into_message(MessageType::Call, request));
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingCall {
                    caller: caller.clone(),
                    timer: None,
                });
            }
        }

        let timeout = options
            .get("timeout")
            .and_then(Value::as_u64)
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .or(self.default_timeout);

        if let Some(timeout) = timeout {
            let weak = Arc::downgrade(&self.state);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(state) = weak.upgrade() {
                    if state.resolve(key, Err(WampError::new(ErrorKind::Timeout))) {
                        debug!(caller = key.0, request = key.1, "Call timed out");
                        if let Some((callee, invocation)) = state.invocations.abandon(key.0, key.1) {
                            trace!(callee, invocation, "Dropped invocation of timed out call");
                        }
                    }
                }
            });
            match self.state.pending.get_mut(&key) {
                Some(mut pending) => pending.timer = Some(timer.abort_handle()),
                None => timer.abort(),
            }
        }

        let disclose_caller = options
            .get("disclose_me")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let details = InvocationDetails {
            caller: caller.id(),
            request,
            caller_authid: Some(caller.details().auth.authid.clone()),
            procedure: procedure.to_string(),
            disclose_caller,
            timeout,
        };

        let weak: Weak<DealerState> = Arc::downgrade(&self.state);
        let callback = move |outcome: CallOutcome| {
            if let Some(state) = weak.upgrade() {
                state.resolve(key, outcome);
            }
        };

        trace!(procedure, caller = key.0, request, "Invoking operation");
        operation.invoke(Box::new(callback), details, args, kwargs);
    }

    /// Deliver a YIELD from a callee.
    pub fn yield_result(&self, callee: SessionId, request: Id, args: List, kwargs: Dict) {
        let outcome = Ok(CallResult::new(args, kwargs));
        if !self.state.invocations.complete(callee, request, outcome) {
            warn!(callee, request, "YIELD for unknown invocation");
        }
    }

    /// Deliver an ERROR answering an INVOCATION.
    pub fn invocation_error(&self, callee: SessionId, request: Id, error: WampError) {
        if !self.state.invocations.complete(callee, request, Err(error)) {
            warn!(callee, request, "ERROR for unknown invocation");
        }
    }

    /// Clean up after a session left.
    ///
    /// Its registrations are removed, calls it issued are cancelled, and
    /// calls routed to it fail with `wamp.error.callee_gone`.
    pub fn session_lost(&self, session: SessionId) {
        let owned: Vec<Id> = self
            .state
            .registrations
            .iter()
            .filter(|r| r.owner == Some(session))
            .map(|r| r.id)
            .collect();
        for registration in &owned {
            self.remove(*registration, Some(session));
        }

        let mut cancelled = 0usize;
        self.state.pending.retain(|(caller, _), pending| {
            if *caller == session {
                if let Some(timer) = pending.timer.take() {
                    timer.abort();
                }
                cancelled += 1;
                false
            } else {
                true
            }
        });

        self.state.invocations.caller_lost(session);
        let failed = self.state.invocations.callee_lost(session);

        debug!(
            session,
            registrations = owned.len(),
            cancelled,
            failed,
            "Dealer cleaned up session"
        );
    }

    /// Registration id for a procedure.
    #[must_use]
    pub fn lookup(&self, procedure: &str) -> Option<Id> {
        self.state.registrations.get(procedure).map(|r| r.id)
    }

    /// All registration ids, ascending.
    #[must_use]
    pub fn registration_ids(&self) -> Vec<Id> {
        let mut ids: Vec<Id> = self.state.by_id.iter().map(|r| *r.key()).collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn registration_count(&self) -> usize {
        self.state.registrations.len()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.pending.len()
    }

    #[must_use]
    pub fn invocation_count(&self) -> usize {
        self.state.invocations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{Arguments, LocalRpcOperation, OperationDescriptor, RpcParameter};
    use crate::session::tests::test_session;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn echo(procedure: &str) -> Arc<dyn RpcOperation> {
        Arc::new(LocalRpcOperation::sync(
            OperationDescriptor::new(procedure).param(RpcParameter::required("x")),
            |args: Arguments| Ok(args.value("x").cloned().unwrap_or_default()),
        ))
    }

    async fn next(rx: &mut UnboundedReceiver<WampMessage>) -> WampMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("queue closed")
    }

    fn error_uri(message: &WampMessage) -> &str {
        match message {
            WampMessage::Error { error, .. } => error,
            other => panic!("Expected ERROR, got {:?}", other),
        }
    }

    #[test]
    fn test_register_conflict() {
        let dealer = Dealer::new(None);
        dealer.register(echo("com.example.echo")).unwrap();
        assert!(matches!(
            dealer.register(echo("com.example.echo")),
            Err(RouterError::ProcedureAlreadyExists(_))
        ));
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let dealer = Dealer::new(None);
        let handle = dealer.register(echo("com.example.echo")).unwrap();

        assert!(dealer.unregister(&handle));
        assert!(!dealer.unregister(&handle));
        assert_eq!(dealer.lookup("com.example.echo"), None);

        // The name is free again and gets a fresh id
        let again = dealer.register(echo("com.example.echo")).unwrap();
        assert_ne!(again.id(), handle.id());
        assert!(!dealer.unregister(&handle));
        assert_eq!(dealer.lookup("com.example.echo"), Some(again.id()));
    }

    #[test]
    fn test_unregister_requires_ownership() {
        let dealer = Dealer::new(None);
        let (alice, _rx_a) = test_session(1, "realm1");
        let id = dealer.register_callee(&alice, "com.example.add").unwrap();

        assert!(matches!(
            dealer.unregister_owned(2, id),
            Err(RouterError::NoSuchRegistration(_))
        ));
        dealer.unregister_owned(1, id).unwrap();
        assert!(dealer.unregister_owned(1, id).is_err());
    }

    #[tokio::test]
    async fn test_call_local_operation() {
        let dealer = Dealer::new(None);
        dealer.register(echo("com.example.echo")).unwrap();
        let (caller, mut rx) = test_session(1, "realm1");

        dealer.call(&caller, 1, "com.example.echo", &Dict::new(), vec!["hi".into()], Dict::new());

        match next(&mut rx).await {
            WampMessage::Result { request, args, .. } => {
                assert_eq!(request, 1);
                assert_eq!(args, vec![Value::from("hi")]);
            }
            other => panic!("Expected RESULT, got {:?}", other),
        }
        assert_eq!(dealer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_no_such_procedure() {
        let dealer = Dealer::new(None);
        let (caller, mut rx) = test_session(1, "realm1");

        dealer.call(&caller, 5, "com.example.missing", &Dict::new(), vec![], Dict::new());
        assert_eq!(error_uri(&next(&mut rx).await), "wamp.error.no_such_procedure");
        assert_eq!(dealer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_call_id() {
        let dealer = Dealer::new(None);
        let (callee, mut callee_rx) = test_session(1, "realm1");
        let (caller, mut rx) = test_session(2, "realm1");
        dealer.register_callee(&callee, "com.example.slow").unwrap();

        dealer.call(&caller, 9, "com.example.slow", &Dict::new(), vec![], Dict::new());
        dealer.call(&caller, 9, "com.example.slow", &Dict::new(), vec![], Dict::new());

        assert_eq!(error_uri(&next(&mut rx).await), "wamp.error.duplicate_call_id");
        assert_eq!(dealer.pending_count(), 1);

        // The first call is still answered normally
        let request = match next(&mut callee_rx).await {
            WampMessage::Invocation { request, .. } => request,
            other => panic!("Expected INVOCATION, got {:?}", other),
        };
        dealer.yield_result(1, request, vec![1.into()], Dict::new());
        assert!(matches!(next(&mut rx).await, WampMessage::Result { request: 9, .. }));
    }

    #[tokio::test]
    async fn test_yield_exactly_once() {
        let dealer = Dealer::new(None);
        let (callee, mut callee_rx) = test_session(1, "realm1");
        let (caller, mut rx) = test_session(2, "realm1");
        dealer.register_callee(&callee, "com.example.add").unwrap();

        dealer.call(&caller, 1, "com.example.add", &Dict::new(), vec![2.into(), 3.into()], Dict::new());
        let request = match next(&mut callee_rx).await {
            WampMessage::Invocation { request, args, .. } => {
                assert_eq!(args, vec![Value::from(2), Value::from(3)]);
                request
            }
            other => panic!("Expected INVOCATION, got {:?}", other),
        };

        dealer.yield_result(1, request, vec![5.into()], Dict::new());
        dealer.yield_result(1, request, vec![6.into()], Dict::new());

        match next(&mut rx).await {
            WampMessage::Result { args, .. } => assert_eq!(args, vec![Value::from(5)]),
            other => panic!("Expected RESULT, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(dealer.pending_count(), 0);
        assert_eq!(dealer.invocation_count(), 0);
    }

    #[tokio::test]
    async fn test_invocation_error_passes_through() {
        let dealer = Dealer::new(None);
        let (callee, mut callee_rx) = test_session(1, "realm1");
        let (caller, mut rx) = test_session(2, "realm1");
        dealer.register_callee(&callee, "com.example.div").unwrap();

        dealer.call(&caller, 3, "com.example.div", &Dict::new(), vec![1.into(), 0.into()], Dict::new());
        let request = match next(&mut callee_rx).await {
            WampMessage::Invocation { request, .. } => request,
            other => panic!("Expected INVOCATION, got {:?}", other),
        };

        dealer.invocation_error(
            1,
            request,
            WampError::from_wire("com.example.error.div_by_zero", vec!["nope".into()], Dict::new()),
        );

        match next(&mut rx).await {
            WampMessage::Error {
                request_type,
                request,
                error,
                args,
                ..
            } => {
                assert_eq!(request_type, MessageType::Call);
                assert_eq!(request, 3);
                assert_eq!(error, "com.example.error.div_by_zero");
                assert_eq!(args, vec![Value::from("nope")]);
            }
            other => panic!("Expected ERROR, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_callee_loss_fails_pending_calls() {
        let dealer = Dealer::new(None);
        let (callee, mut callee_rx) = test_session(1, "realm1");
        let (caller, mut rx) = test_session(2, "realm1");
        dealer.register_callee(&callee, "com.example.add").unwrap();

        dealer.call(&caller, 1, "com.example.add", &Dict::new(), vec![], Dict::new());
        let _ = next(&mut callee_rx).await;

        dealer.session_lost(1);

        assert_eq!(error_uri(&next(&mut rx).await), "wamp.error.callee_gone");
        assert_eq!(dealer.pending_count(), 0);
        assert_eq!(dealer.registration_count(), 0);
        assert_eq!(dealer.lookup("com.example.add"), None);
    }

    #[tokio::test]
    async fn test_caller_loss_cancels_pending_calls() {
        let dealer = Dealer::new(None);
        let (callee, mut callee_rx) = test_session(1, "realm1");
        let (caller, _rx) = test_session(2, "realm1");
        dealer.register_callee(&callee, "com.example.add").unwrap();

        dealer.call(&caller, 1, "com.example.add", &Dict::new(), vec![], Dict::new());
        let request = match next(&mut callee_rx).await {
            WampMessage::Invocation { request, .. } => request,
            other => panic!("Expected INVOCATION, got {:?}", other),
        };

        dealer.session_lost(2);
        assert_eq!(dealer.pending_count(), 0);
        assert_eq!(dealer.invocation_count(), 0);

        // A late YIELD is dropped
        dealer.yield_result(1, request, vec![], Dict::new());
        assert_eq!(dealer.registration_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout() {
        let dealer = Dealer::new(None);
        let (callee, mut callee_rx) = test_session(1, "realm1");
        let (caller, mut rx) = test_session(2, "realm1");
        dealer.register_callee(&callee, "com.example.slow").unwrap();

        let mut options = Dict::new();
        options.insert("timeout".into(), Value::from(100));
        dealer.call(&caller, 1, "com.example.slow", &options, vec![], Dict::new());

        let (request, details) = match next(&mut callee_rx).await {
            WampMessage::Invocation { request, details, .. } => (request, details),
            other => panic!("Expected INVOCATION, got {:?}", other),
        };
        assert_eq!(details["timeout"], Value::from(100));

        assert_eq!(error_uri(&next(&mut rx).await), "wamp.error.timeout");
        assert_eq!(dealer.pending_count(), 0);
        assert_eq!(dealer.invocation_count(), 0);

        // The callee's late answer goes nowhere
        dealer.yield_result(1, request, vec![], Dict::new());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_calls_release_invocations() {
        let dealer = Dealer::new(Some(Duration::from_millis(10)));
        let (callee, mut callee_rx) = test_session(1, "realm1");
        let (caller, mut rx) = test_session(2, "realm1");
        dealer.register_callee(&callee, "com.example.silent").unwrap();

        for request in 1..=20 {
            dealer.call(&caller, request, "com.example.silent", &Dict::new(), vec![], Dict::new());
        }
        assert_eq!(dealer.invocation_count(), 20);

        for _ in 0..20 {
            assert!(matches!(next(&mut callee_rx).await, WampMessage::Invocation { .. }));
            assert_eq!(error_uri(&next(&mut rx).await), "wamp.error.timeout");
        }
        assert_eq!(dealer.pending_count(), 0);
        assert_eq!(dealer.invocation_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_timeout_not_fired_after_result() {
        let dealer = Dealer::new(Some(Duration::from_millis(50)));
        dealer.register(echo("com.example.echo")).unwrap();
        let (caller, mut rx) = test_session(1, "realm1");

        dealer.call(&caller, 1, "com.example.echo", &Dict::new(), vec![1.into()], Dict::new());
        assert!(matches!(next(&mut rx).await, WampMessage::Result { .. }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disclose_caller() {
        let dealer = Dealer::new(None);
        let (callee, mut callee_rx) = test_session(1, "realm1");
        let (caller, _rx) = test_session(2, "realm1");
        dealer.register_callee(&callee, "com.example.who").unwrap();

        let mut options = Dict::new();
        options.insert("disclose_me".into(), Value::Bool(true));
        dealer.call(&caller, 1, "com.example.who", &options, vec![], Dict::new());

        match next(&mut callee_rx).await {
            WampMessage::Invocation { details, .. } => {
                assert_eq!(details["caller"], Value::from(2));
            }
            other => panic!("Expected INVOCATION, got {:?}", other),
        }
    }
}
