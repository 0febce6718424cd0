//! RPC operations.
//!
//! An [`RpcOperation`] is whatever a registration routes calls to. Two
//! implementations exist: [`LocalRpcOperation`] runs a Rust handler inside
//! the router, [`CalleeRpcOperation`] forwards the call to a remote callee
//! session as an INVOCATION. The dealer never needs to know which one it
//! holds.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use concord_protocol::{Dict, Id, List, Value, WampMessage};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{ErrorKind, WampError};
use crate::id::IdGenerator;
use crate::session::{SessionHandle, SessionId};

/// A successful call outcome.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallResult {
    pub args: List,
    pub kwargs: Dict,
}

impl CallResult {
    #[must_use]
    pub fn new(args: List, kwargs: Dict) -> Self {
        Self { args, kwargs }
    }

    /// A result carrying one positional value.
    #[must_use]
    pub fn value(value: impl Into<Value>) -> Self {
        Self {
            args: vec![value.into()],
            kwargs: Dict::new(),
        }
    }
}

/// The terminal outcome of a call.
pub type CallOutcome = Result<CallResult, WampError>;

/// Receives the outcome of an invocation. Consumed on delivery, so it can
/// fire at most once.
pub trait RpcCallback: Send + Sync {
    fn deliver(self: Box<Self>, outcome: CallOutcome);
}

impl<F> RpcCallback for F
where
    F: FnOnce(CallOutcome) + Send + Sync,
{
    fn deliver(self: Box<Self>, outcome: CallOutcome) {
        (*self)(outcome);
    }
}

/// Per-call information handed to an operation.
#[derive(Debug, Clone)]
pub struct InvocationDetails {
    pub caller: SessionId,
    /// The caller's CALL request id.
    pub request: Id,
    pub caller_authid: Option<String>,
    pub procedure: String,
    /// Whether the caller asked to be disclosed to the callee.
    pub disclose_caller: bool,
    pub timeout: Option<Duration>,
}

/// Something a procedure name can be bound to.
pub trait RpcOperation: Send + Sync {
    /// The procedure this operation serves.
    fn procedure(&self) -> &str;

    /// Start an invocation. Must not block; the outcome is delivered
    /// through `callback`, possibly from another task.
    fn invoke(&self, callback: Box<dyn RpcCallback>, details: InvocationDetails, args: List, kwargs: Dict);
}

/// A declared parameter of a local procedure.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcParameter {
    pub name: String,
    pub optional: bool,
    pub default: Value,
}

impl RpcParameter {
    #[must_use]
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            optional: false,
            default: Value::Null,
        }
    }

    #[must_use]
    pub fn optional(name: impl Into<String>, default: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            optional: true,
            default: default.into(),
        }
    }
}

/// How a list returned by a local procedure is sent to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectionResultTreatment {
    /// The list is one positional result.
    #[default]
    SingleValue,
    /// Each element becomes its own positional result.
    Multivalued,
}

/// Shape of a local procedure, fixed at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationDescriptor {
    pub procedure: String,
    pub parameters: Vec<RpcParameter>,
    pub has_result: bool,
    pub collection_treatment: CollectionResultTreatment,
}

impl OperationDescriptor {
    #[must_use]
    pub fn new(procedure: impl Into<String>) -> Self {
        Self {
            procedure: procedure.into(),
            parameters: Vec::new(),
            has_result: true,
            collection_treatment: CollectionResultTreatment::SingleValue,
        }
    }

    #[must_use]
    pub fn param(mut self, parameter: RpcParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// The procedure returns nothing; RESULT carries no arguments.
    #[must_use]
    pub fn no_result(mut self) -> Self {
        self.has_result = false;
        self
    }

    #[must_use]
    pub fn multivalued(mut self) -> Self {
        self.collection_treatment = CollectionResultTreatment::Multivalued;
        self
    }

    /// Bind call arguments to the declared parameters.
    ///
    /// Positional arguments fill parameters left to right, keyword
    /// arguments fill the rest by name, and absent optional parameters
    /// take their default.
    ///
    /// # Errors
    ///
    /// Returns `wamp.error.invalid_argument` on a missing, duplicate or
    /// unexpected argument.
    pub fn bind(&self, args: List, mut kwargs: Dict) -> Result<Vec<(String, Value)>, WampError> {
        if args.len() > self.parameters.len() {
            return Err(invalid_argument(format!(
                "{} takes at most {} positional arguments, got {}",
                self.procedure,
                self.parameters.len(),
                args.len()
            )));
        }

        let mut positional = args.into_iter();
        let mut bound = Vec::with_capacity(self.parameters.len());

        for parameter in &self.parameters {
            let value = match positional.next() {
                Some(value) => {
                    if kwargs.contains_key(&parameter.name) {
                        return Err(invalid_argument(format!(
                            "argument '{}' given both by position and by name",
                            parameter.name
                        )));
                    }
                    value
                }
                None => match kwargs.remove(&parameter.name) {
                    Some(value) => value,
                    None if parameter.optional => parameter.default.clone(),
                    None => {
                        return Err(invalid_argument(format!(
                            "missing required argument '{}'",
                            parameter.name
                        )));
                    }
                },
            };
            bound.push((parameter.name.clone(), value));
        }

        if let Some(unexpected) = kwargs.keys().next() {
            return Err(invalid_argument(format!(
                "unexpected keyword argument '{unexpected}'"
            )));
        }

        Ok(bound)
    }

    /// Shape a handler's return value into a call result.
    #[must_use]
    pub fn shape_result(&self, value: Value) -> CallResult {
        if !self.has_result {
            return CallResult::default();
        }
        match (self.collection_treatment, value) {
            (CollectionResultTreatment::Multivalued, Value::List(items)) => {
                CallResult::new(items, Dict::new())
            }
            (_, value) => CallResult::value(value),
        }
    }
}

fn invalid_argument(message: String) -> WampError {
    WampError::with_message(ErrorKind::InvalidArgument, message)
}

/// Arguments bound to a local procedure's parameters.
#[derive(Debug, Clone)]
pub struct Arguments {
    values: Vec<(String, Value)>,
    details: InvocationDetails,
}

impl Arguments {
    /// The raw value bound to a parameter.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Deserialize a parameter into a native type.
    ///
    /// # Errors
    ///
    /// Returns `wamp.error.invalid_argument` if the parameter is not
    /// declared or has the wrong shape.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, WampError> {
        let value = self
            .value(name)
            .ok_or_else(|| invalid_argument(format!("no parameter named '{name}'")))?;
        value
            .to_native()
            .map_err(|e| invalid_argument(format!("argument '{name}': {e}")))
    }

    #[must_use]
    pub fn details(&self) -> &InvocationDetails {
        &self.details
    }
}

type Handler = dyn Fn(Arguments) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

/// A procedure implemented in Rust and run inside the router.
pub struct LocalRpcOperation {
    descriptor: OperationDescriptor,
    handler: Arc<Handler>,
}

impl LocalRpcOperation {
    /// Wrap an async handler.
    pub fn new<H, Fut>(descriptor: OperationDescriptor, handler: H) -> Self
    where
        H: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            descriptor,
            handler: Arc::new(move |args: Arguments| handler(args).boxed()),
        }
    }

    /// Wrap a synchronous handler.
    pub fn sync<H>(descriptor: OperationDescriptor, handler: H) -> Self
    where
        H: Fn(Arguments) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        Self::new(descriptor, move |args: Arguments| {
            let handler = Arc::clone(&handler);
            async move { handler(args) }
        })
    }

    #[must_use]
    pub fn descriptor(&self) -> &OperationDescriptor {
        &self.descriptor
    }
}

/// Translate a handler failure into a wire error.
///
/// A [`WampError`] passes through; anything else keeps only its message.
fn translate(error: anyhow::Error) -> WampError {
    match error.downcast::<WampError>() {
        Ok(wamp) => wamp,
        Err(other) => WampError::with_message(ErrorKind::RuntimeError, other.to_string()),
    }
}

impl RpcOperation for LocalRpcOperation {
    fn procedure(&self) -> &str {
        &self.descriptor.procedure
    }

    fn invoke(&self, callback: Box<dyn RpcCallback>, details: InvocationDetails, args: List, kwargs: Dict) {
        let values = match self.descriptor.bind(args, kwargs) {
            Ok(values) => values,
            Err(e) => {
                callback.deliver(Err(e));
                return;
            }
        };

        let handler = Arc::clone(&self.handler);
        let descriptor = self.descriptor.clone();
        let arguments = Arguments { values, details };

        tokio::spawn(async move {
            // The handler is called inside the guarded future so that a
            // panic while building the future is caught as well.
            let run = async move { handler(arguments).await };
            let outcome = match AssertUnwindSafe(run).catch_unwind().await {
                Ok(Ok(value)) => Ok(descriptor.shape_result(value)),
                Ok(Err(error)) => Err(translate(error)),
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "procedure panicked".to_string());
                    warn!(procedure = %descriptor.procedure, %message, "Local procedure panicked");
                    Err(WampError::with_message(ErrorKind::RuntimeError, message))
                }
            };
            callback.deliver(outcome);
        });
    }
}

impl fmt::Debug for LocalRpcOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRpcOperation")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

struct PendingInvocation {
    callee: SessionId,
    caller: (SessionId, Id),
    callback: Box<dyn RpcCallback>,
}

/// Invocations sent to remote callees and awaiting YIELD or ERROR.
#[derive(Default)]
pub(crate) struct InvocationTable {
    pending: DashMap<Id, PendingInvocation>,
    ids: IdGenerator,
}

impl InvocationTable {
    fn insert(&self, callee: SessionId, caller: (SessionId, Id), callback: Box<dyn RpcCallback>) -> Id {
        let request = self.ids.next();
        self.pending.insert(
            request,
            PendingInvocation {
                callee,
                caller,
                callback,
            },
        );
        request
    }

    /// Deliver the callee's answer. Returns `false` for unknown, late or
    /// duplicate answers, and for answers from a session that does not
    /// own the invocation.
    pub(crate) fn complete(&self, callee: SessionId, request: Id, outcome: CallOutcome) -> bool {
        match self.pending.remove_if(&request, |_, p| p.callee == callee) {
            Some((_, invocation)) => {
                invocation.callback.deliver(outcome);
                true
            }
            None => false,
        }
    }

    /// Fail every invocation routed to `callee` with `wamp.error.callee_gone`.
    pub(crate) fn callee_lost(&self, callee: SessionId) -> usize {
        let requests: Vec<Id> = self
            .pending
            .iter()
            .filter(|p| p.callee == callee)
            .map(|p| *p.key())
            .collect();

        let mut failed = 0;
        for request in requests {
            if let Some((_, invocation)) = self.pending.remove(&request) {
                invocation
                    .callback
                    .deliver(Err(WampError::with_message(ErrorKind::CalleeGone, "callee left the realm")));
                failed += 1;
            }
        }
        failed
    }

    /// Drop invocations whose caller left; their outcome has nowhere to go.
    pub(crate) fn caller_lost(&self, caller: SessionId) {
        self.pending.retain(|_, p| p.caller.0 != caller);
    }

    /// Drop the invocation serving one call, e.g. after the call timed out.
    /// Returns the dropped invocation's callee and request id.
    pub(crate) fn abandon(&self, caller: SessionId, call: Id) -> Option<(SessionId, Id)> {
        let request = self
            .pending
            .iter()
            .find(|p| p.caller == (caller, call))
            .map(|p| *p.key())?;
        self.pending
            .remove_if(&request, |_, p| p.caller == (caller, call))
            .map(|(request, p)| (p.callee, request))
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Forwards calls to a callee session as INVOCATION messages.
pub struct CalleeRpcOperation {
    procedure: String,
    registration: Id,
    callee: SessionHandle,
    invocations: Arc<InvocationTable>,
}

impl CalleeRpcOperation {
    pub(crate) fn new(
        procedure: impl Into<String>,
        registration: Id,
        callee: SessionHandle,
        invocations: Arc<InvocationTable>,
    ) -> Self {
        Self {
            procedure: procedure.into(),
            registration,
            callee,
            invocations,
        }
    }
}

impl RpcOperation for CalleeRpcOperation {
    fn procedure(&self) -> &str {
        &self.procedure
    }

    fn invoke(&self, callback: Box<dyn RpcCallback>, details: InvocationDetails, args: List, kwargs: Dict) {
        let request = self.invocations.insert(self.callee.id(), (details.caller, details.request), callback);

        let mut invocation_details = Dict::new();
        if details.disclose_caller {
            invocation_details.insert("caller".into(), Value::from(details.caller));
            if let Some(authid) = &details.caller_authid {
                invocation_details.insert("caller_authid".into(), Value::from(authid.as_str()));
            }
        }
        if let Some(timeout) = details.timeout {
            invocation_details.insert("timeout".into(), Value::from(timeout.as_millis() as u64));
        }

        let message = WampMessage::Invocation {
            request,
            registration: self.registration,
            details: invocation_details,
            args,
            kwargs,
        };

        if !self.callee.send(message) {
            debug!(callee = self.callee.id(), procedure = %self.procedure, "Callee gone before invocation");
            self.invocations.complete(
                self.callee.id(),
                request,
                Err(WampError::with_message(ErrorKind::CalleeGone, "callee left the realm")),
            );
        }
    }
}

impl fmt::Debug for CalleeRpcOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalleeRpcOperation")
            .field("procedure", &self.procedure)
            .field("registration", &self.registration)
            .field("callee", &self.callee.id())
            .finish()
    }
}
