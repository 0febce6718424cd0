//! Message types for the WAMP v2 protocol.
//!
//! Messages are the fundamental unit of communication between peers and the
//! router. On the wire every message is a list whose first element is the
//! numeric [`MessageType`]; [`WampMessage::to_value`] and
//! [`WampMessage::from_value`] convert between the two representations.

use crate::error::ProtocolError;
use crate::value::{Dict, List, Value};

/// Protocol identifier (session, request, registration, subscription,
/// publication). Always in `0..=MAX_ID`.
pub type Id = u64;

/// Largest identifier that survives a round trip through IEEE doubles.
pub const MAX_ID: Id = 1 << 53;

/// Message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Hello = 1,
    Welcome = 2,
    Abort = 3,
    Challenge = 4,
    Authenticate = 5,
    Goodbye = 6,
    Error = 8,
    Publish = 16,
    Published = 17,
    Subscribe = 32,
    Subscribed = 33,
    Unsubscribe = 34,
    Unsubscribed = 35,
    Event = 36,
    Call = 48,
    Result = 50,
    Register = 64,
    Registered = 65,
    Unregister = 66,
    Unregistered = 67,
    Invocation = 68,
    Yield = 70,
}

impl From<MessageType> for u64 {
    fn from(mt: MessageType) -> u64 {
        mt as u64
    }
}

impl TryFrom<u64> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u64) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(MessageType::Hello),
            2 => Ok(MessageType::Welcome),
            3 => Ok(MessageType::Abort),
            4 => Ok(MessageType::Challenge),
            5 => Ok(MessageType::Authenticate),
            6 => Ok(MessageType::Goodbye),
            8 => Ok(MessageType::Error),
            16 => Ok(MessageType::Publish),
            17 => Ok(MessageType::Published),
            32 => Ok(MessageType::Subscribe),
            33 => Ok(MessageType::Subscribed),
            34 => Ok(MessageType::Unsubscribe),
            35 => Ok(MessageType::Unsubscribed),
            36 => Ok(MessageType::Event),
            48 => Ok(MessageType::Call),
            50 => Ok(MessageType::Result),
            64 => Ok(MessageType::Register),
            65 => Ok(MessageType::Registered),
            66 => Ok(MessageType::Unregister),
            67 => Ok(MessageType::Unregistered),
            68 => Ok(MessageType::Invocation),
            70 => Ok(MessageType::Yield),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum WampMessage {
    /// Session open request from a peer.
    Hello { realm: String, details: Dict },

    /// Session accepted by the router.
    Welcome { session: Id, details: Dict },

    /// Session refused before it was established.
    Abort { details: Dict, reason: String },

    /// Authentication challenge from the router.
    Challenge { auth_method: String, extra: Dict },

    /// Response to a challenge.
    Authenticate { signature: String, extra: Dict },

    /// Session close, sent by either side.
    Goodbye { details: Dict, reason: String },

    /// Error reply to a request.
    Error {
        request_type: MessageType,
        request: Id,
        details: Dict,
        error: String,
        args: List,
        kwargs: Dict,
    },

    Publish {
        request: Id,
        options: Dict,
        topic: String,
        args: List,
        kwargs: Dict,
    },

    Published { request: Id, publication: Id },

    Subscribe {
        request: Id,
        options: Dict,
        topic: String,
    },

    Subscribed { request: Id, subscription: Id },

    Unsubscribe { request: Id, subscription: Id },

    Unsubscribed { request: Id },

    /// A publication delivered to a subscriber.
    Event {
        subscription: Id,
        publication: Id,
        details: Dict,
        args: List,
        kwargs: Dict,
    },

    Call {
        request: Id,
        options: Dict,
        procedure: String,
        args: List,
        kwargs: Dict,
    },

    Result {
        request: Id,
        details: Dict,
        args: List,
        kwargs: Dict,
    },

    Register {
        request: Id,
        options: Dict,
        procedure: String,
    },

    Registered { request: Id, registration: Id },

    Unregister { request: Id, registration: Id },

    Unregistered { request: Id },

    /// A call forwarded to the callee.
    Invocation {
        request: Id,
        registration: Id,
        details: Dict,
        args: List,
        kwargs: Dict,
    },

    /// The callee's result for an invocation.
    Yield {
        request: Id,
        options: Dict,
        args: List,
        kwargs: Dict,
    },
}

impl WampMessage {
    /// Get the message type.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            WampMessage::Hello { .. } => MessageType::Hello,
            WampMessage::Welcome { .. } => MessageType::Welcome,
            WampMessage::Abort { .. } => MessageType::Abort,
            WampMessage::Challenge { .. } => MessageType::Challenge,
            WampMessage::Authenticate { .. } => MessageType::Authenticate,
            WampMessage::Goodbye { .. } => MessageType::Goodbye,
            WampMessage::Error { .. } => MessageType::Error,
            WampMessage::Publish { .. } => MessageType::Publish,
            WampMessage::Published { .. } => MessageType::Published,
            WampMessage::Subscribe { .. } => MessageType::Subscribe,
            WampMessage::Subscribed { .. } => MessageType::Subscribed,
            WampMessage::Unsubscribe { .. } => MessageType::Unsubscribe,
            WampMessage::Unsubscribed { .. } => MessageType::Unsubscribed,
            WampMessage::Event { .. } => MessageType::Event,
            WampMessage::Call { .. } => MessageType::Call,
            WampMessage::Result { .. } => MessageType::Result,
            WampMessage::Register { .. } => MessageType::Register,
            WampMessage::Registered { .. } => MessageType::Registered,
            WampMessage::Unregister { .. } => MessageType::Unregister,
            WampMessage::Unregistered { .. } => MessageType::Unregistered,
            WampMessage::Invocation { .. } => MessageType::Invocation,
            WampMessage::Yield { .. } => MessageType::Yield,
        }
    }

    /// Create a new Hello message.
    #[must_use]
    pub fn hello(realm: impl Into<String>, details: Dict) -> Self {
        WampMessage::Hello {
            realm: realm.into(),
            details,
        }
    }

    /// Create a new Abort message with a human readable message.
    #[must_use]
    pub fn abort(reason: impl Into<String>, message: impl Into<String>) -> Self {
        let mut details = Dict::new();
        details.insert("message".into(), Value::String(message.into()));
        WampMessage::Abort {
            details,
            reason: reason.into(),
        }
    }

    /// Create a new Goodbye message.
    #[must_use]
    pub fn goodbye(reason: impl Into<String>) -> Self {
        WampMessage::Goodbye {
            details: Dict::new(),
            reason: reason.into(),
        }
    }

    /// Create an Error reply to `request`.
    #[must_use]
    pub fn error(
        request_type: MessageType,
        request: Id,
        error: impl Into<String>,
        args: List,
        kwargs: Dict,
    ) -> Self {
        WampMessage::Error {
            request_type,
            request,
            details: Dict::new(),
            error: error.into(),
            args,
            kwargs,
        }
    }

    /// Create a new Call message.
    #[must_use]
    pub fn call(request: Id, procedure: impl Into<String>, args: List, kwargs: Dict) -> Self {
        WampMessage::Call {
            request,
            options: Dict::new(),
            procedure: procedure.into(),
            args,
            kwargs,
        }
    }

    /// Create a new Register message.
    #[must_use]
    pub fn register(request: Id, procedure: impl Into<String>) -> Self {
        WampMessage::Register {
            request,
            options: Dict::new(),
            procedure: procedure.into(),
        }
    }

    /// Create a new Subscribe message.
    #[must_use]
    pub fn subscribe(request: Id, topic: impl Into<String>) -> Self {
        WampMessage::Subscribe {
            request,
            options: Dict::new(),
            topic: topic.into(),
        }
    }

    /// Create a new Publish message.
    #[must_use]
    pub fn publish(request: Id, topic: impl Into<String>, args: List, kwargs: Dict) -> Self {
        WampMessage::Publish {
            request,
            options: Dict::new(),
            topic: topic.into(),
            args,
            kwargs,
        }
    }

    /// Create a new Yield message.
    #[must_use]
    pub fn yield_result(request: Id, args: List, kwargs: Dict) -> Self {
        WampMessage::Yield {
            request,
            options: Dict::new(),
            args,
            kwargs,
        }
    }

    /// Convert into the list representation used on the wire.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut out = ListBuilder::new(self.message_type());
        match self {
            WampMessage::Hello { realm, details } => out.str(realm).dict(details),
            WampMessage::Welcome { session, details } => out.id(*session).dict(details),
            WampMessage::Abort { details, reason } => out.dict(details).str(reason),
            WampMessage::Challenge { auth_method, extra } => out.str(auth_method).dict(extra),
            WampMessage::Authenticate { signature, extra } => out.str(signature).dict(extra),
            WampMessage::Goodbye { details, reason } => out.dict(details).str(reason),
            WampMessage::Error {
                request_type,
                request,
                details,
                error,
                args,
                kwargs,
            } => out
                .id(u64::from(*request_type))
                .id(*request)
                .dict(details)
                .str(error)
                .payload(args, kwargs),
            WampMessage::Publish {
                request,
                options,
                topic,
                args,
                kwargs,
            } => out.id(*request).dict(options).str(topic).payload(args, kwargs),
            WampMessage::Published {
                request,
                publication,
            } => out.id(*request).id(*publication),
            WampMessage::Subscribe {
                request,
                options,
                topic,
            } => out.id(*request).dict(options).str(topic),
            WampMessage::Subscribed {
                request,
                subscription,
            } => out.id(*request).id(*subscription),
            WampMessage::Unsubscribe {
                request,
                subscription,
            } => out.id(*request).id(*subscription),
            WampMessage::Unsubscribed { request } => out.id(*request),
            WampMessage::Event {
                subscription,
                publication,
                details,
                args,
                kwargs,
            } => out
                .id(*subscription)
                .id(*publication)
                .dict(details)
                .payload(args, kwargs),
            WampMessage::Call {
                request,
                options,
                procedure,
                args,
                kwargs,
            } => out
                .id(*request)
                .dict(options)
                .str(procedure)
                .payload(args, kwargs),
            WampMessage::Result {
                request,
                details,
                args,
                kwargs,
            } => out.id(*request).dict(details).payload(args, kwargs),
            WampMessage::Register {
                request,
                options,
                procedure,
            } => out.id(*request).dict(options).str(procedure),
            WampMessage::Registered {
                request,
                registration,
            } => out.id(*request).id(*registration),
            WampMessage::Unregister {
                request,
                registration,
            } => out.id(*request).id(*registration),
            WampMessage::Unregistered { request } => out.id(*request),
            WampMessage::Invocation {
                request,
                registration,
                details,
                args,
                kwargs,
            } => out
                .id(*request)
                .id(*registration)
                .dict(details)
                .payload(args, kwargs),
            WampMessage::Yield {
                request,
                options,
                args,
                kwargs,
            } => out.id(*request).dict(options).payload(args, kwargs),
        };
        out.finish()
    }

    /// Parse the list representation used on the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a list, the type code is unknown,
    /// or a field is missing or has the wrong type.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::List(items) = value else {
            return Err(ProtocolError::InvalidMessage(format!(
                "expected a list, got {}",
                value.kind()
            )));
        };
        let mut fields = Fields::new(items);
        let code = fields.id("message type")?;
        let message_type = MessageType::try_from(code)?;

        let message = match message_type {
            MessageType::Hello => WampMessage::Hello {
                realm: fields.string("realm")?,
                details: fields.dict("details")?,
            },
            MessageType::Welcome => WampMessage::Welcome {
                session: fields.id("session")?,
                details: fields.dict("details")?,
            },
            MessageType::Abort => WampMessage::Abort {
                details: fields.dict("details")?,
                reason: fields.string("reason")?,
            },
            MessageType::Challenge => WampMessage::Challenge {
                auth_method: fields.string("auth method")?,
                extra: fields.dict("extra")?,
            },
            MessageType::Authenticate => WampMessage::Authenticate {
                signature: fields.string("signature")?,
                extra: fields.dict("extra")?,
            },
            MessageType::Goodbye => WampMessage::Goodbye {
                details: fields.dict("details")?,
                reason: fields.string("reason")?,
            },
            MessageType::Error => WampMessage::Error {
                request_type: MessageType::try_from(fields.id("request type")?)?,
                request: fields.id("request")?,
                details: fields.dict("details")?,
                error: fields.string("error")?,
                args: fields.args()?,
                kwargs: fields.kwargs()?,
            },
            MessageType::Publish => WampMessage::Publish {
                request: fields.id("request")?,
                options: fields.dict("options")?,
                topic: fields.string("topic")?,
                args: fields.args()?,
                kwargs: fields.kwargs()?,
            },
            MessageType::Published => WampMessage::Published {
                request: fields.id("request")?,
                publication: fields.id("publication")?,
            },
            MessageType::Subscribe => WampMessage::Subscribe {
                request: fields.id("request")?,
                options: fields.dict("options")?,
                topic: fields.string("topic")?,
            },
            MessageType::Subscribed => WampMessage::Subscribed {
                request: fields.id("request")?,
                subscription: fields.id("subscription")?,
            },
            MessageType::Unsubscribe => WampMessage::Unsubscribe {
                request: fields.id("request")?,
                subscription: fields.id("subscription")?,
            },
            MessageType::Unsubscribed => WampMessage::Unsubscribed {
                request: fields.id("request")?,
            },
            MessageType::Event => WampMessage::Event {
                subscription: fields.id("subscription")?,
                publication: fields.id("publication")?,
                details: fields.dict("details")?,
                args: fields.args()?,
                kwargs: fields.kwargs()?,
            },
            MessageType::Call => WampMessage::Call {
                request: fields.id("request")?,
                options: fields.dict("options")?,
                procedure: fields.string("procedure")?,
                args: fields.args()?,
                kwargs: fields.kwargs()?,
            },
            MessageType::Result => WampMessage::Result {
                request: fields.id("request")?,
                details: fields.dict("details")?,
                args: fields.args()?,
                kwargs: fields.kwargs()?,
            },
            MessageType::Register => WampMessage::Register {
                request: fields.id("request")?,
                options: fields.dict("options")?,
                procedure: fields.string("procedure")?,
            },
            MessageType::Registered => WampMessage::Registered {
                request: fields.id("request")?,
                registration: fields.id("registration")?,
            },
            MessageType::Unregister => WampMessage::Unregister {
                request: fields.id("request")?,
                registration: fields.id("registration")?,
            },
            MessageType::Unregistered => WampMessage::Unregistered {
                request: fields.id("request")?,
            },
            MessageType::Invocation => WampMessage::Invocation {
                request: fields.id("request")?,
                registration: fields.id("registration")?,
                details: fields.dict("details")?,
                args: fields.args()?,
                kwargs: fields.kwargs()?,
            },
            MessageType::Yield => WampMessage::Yield {
                request: fields.id("request")?,
                options: fields.dict("options")?,
                args: fields.args()?,
                kwargs: fields.kwargs()?,
            },
        };

        fields.finish(message_type)?;
        Ok(message)
    }
}

/// Builds the wire list for a message.
struct ListBuilder {
    items: List,
}

impl ListBuilder {
    fn new(message_type: MessageType) -> Self {
        Self {
            items: vec![Value::from(u64::from(message_type))],
        }
    }

    fn id(&mut self, id: Id) -> &mut Self {
        self.items.push(Value::from(id));
        self
    }

    fn str(&mut self, s: &str) -> &mut Self {
        self.items.push(Value::from(s));
        self
    }

    fn dict(&mut self, d: &Dict) -> &mut Self {
        self.items.push(Value::Dict(d.clone()));
        self
    }

    /// Arguments are omitted when empty; keyword arguments force positional ones.
    fn payload(&mut self, args: &List, kwargs: &Dict) -> &mut Self {
        if !kwargs.is_empty() {
            self.items.push(Value::List(args.clone()));
            self.items.push(Value::Dict(kwargs.clone()));
        } else if !args.is_empty() {
            self.items.push(Value::List(args.clone()));
        }
        self
    }

    fn finish(self) -> Value {
        Value::List(self.items)
    }
}

/// Reads the fields of a wire list in order.
struct Fields {
    items: std::vec::IntoIter<Value>,
}

impl Fields {
    fn new(items: List) -> Self {
        Self {
            items: items.into_iter(),
        }
    }

    fn next(&mut self, name: &str) -> Result<Value, ProtocolError> {
        self.items
            .next()
            .ok_or_else(|| ProtocolError::InvalidMessage(format!("missing {name}")))
    }

    fn id(&mut self, name: &str) -> Result<Id, ProtocolError> {
        match self.next(name)? {
            Value::Integer(i) if (0..=MAX_ID as i64).contains(&i) => Ok(i as Id),
            other => Err(ProtocolError::InvalidMessage(format!(
                "{name} must be an id, got {}",
                other.kind()
            ))),
        }
    }

    fn string(&mut self, name: &str) -> Result<String, ProtocolError> {
        match self.next(name)? {
            Value::String(s) => Ok(s),
            other => Err(ProtocolError::InvalidMessage(format!(
                "{name} must be a string, got {}",
                other.kind()
            ))),
        }
    }

    fn dict(&mut self, name: &str) -> Result<Dict, ProtocolError> {
        match self.next(name)? {
            Value::Dict(d) => Ok(d),
            other => Err(ProtocolError::InvalidMessage(format!(
                "{name} must be a dict, got {}",
                other.kind()
            ))),
        }
    }

    fn args(&mut self) -> Result<List, ProtocolError> {
        match self.items.next() {
            None => Ok(List::new()),
            Some(Value::List(l)) => Ok(l),
            Some(other) => Err(ProtocolError::InvalidMessage(format!(
                "arguments must be a list, got {}",
                other.kind()
            ))),
        }
    }

    fn kwargs(&mut self) -> Result<Dict, ProtocolError> {
        match self.items.next() {
            None => Ok(Dict::new()),
            Some(Value::Dict(d)) => Ok(d),
            Some(other) => Err(ProtocolError::InvalidMessage(format!(
                "keyword arguments must be a dict, got {}",
                other.kind()
            ))),
        }
    }

    fn finish(mut self, message_type: MessageType) -> Result<(), ProtocolError> {
        match self.items.next() {
            None => Ok(()),
            Some(_) => Err(ProtocolError::InvalidMessage(format!(
                "trailing fields in {message_type:?}"
            ))),
        }
    }
}
