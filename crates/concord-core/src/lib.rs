//! # concord-core
//!
//! Routing core of the concord router.
//!
//! - **Realm** - isolated routing domain, created on first use
//! - **Dealer** - routes calls to registered procedures
//! - **Broker** - fans publications out to subscribers
//! - **RpcOperation** - local procedures and remote callees behind one trait
//! - **Router** - handshake, authentication and the per-session loop
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│   Router    │────▶│    Realm    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │              │         │
//!                            ▼              ▼         ▼
//!                     ┌─────────────┐  ┌────────┐ ┌────────┐
//!                     │  Sessions   │  │ Dealer │ │ Broker │
//!                     └─────────────┘  └────────┘ └────────┘
//! ```
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use concord_core::Router;
//! use concord_protocol::JsonFormatter;
//! use concord_transport::ConnectionListener;
//!
//! let router = Arc::new(Router::new());
//! let listener = ConnectionListener::new();
//! listener.register_binding("wamp.2.json", JsonFormatter)?;
//! router.listen(listener.subscribe("wamp.2.json")?);
//! ```

pub mod auth;
pub mod broker;
pub mod dealer;
pub mod error;
mod handler;
pub mod id;
pub mod meta;
pub mod realm;
pub mod router;
pub mod rpc;
pub mod session;
pub mod uri;

pub use auth::{AuthInfo, Authenticator, Challenge, TicketAuthenticator};
pub use broker::{Broker, PublishOptions};
pub use dealer::{Dealer, RegistrationHandle};
pub use error::{ErrorKind, HandshakeError, RouterError, WampError};
pub use realm::{Realm, RealmContainer};
pub use router::{Router, RouterConfig, RouterStats};
pub use rpc::{
    Arguments, CallOutcome, CallResult, CalleeRpcOperation, CollectionResultTreatment,
    InvocationDetails, LocalRpcOperation, OperationDescriptor, RpcCallback, RpcOperation,
    RpcParameter,
};
pub use session::{SessionDetails, SessionEvent, SessionHandle, SessionId, SessionRegistry};
