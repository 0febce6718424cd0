//! Connection listener.
//!
//! The listener owns the set of bindings (binding name + formatter). Raw
//! connections handed to [`ConnectionListener::accept`] are framed with the
//! binding's formatter and announced to every current subscriber of that
//! binding. Subscribers only see connections accepted after they
//! subscribed, and exactly one of them claims each connection.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use concord_protocol::Formatter;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::framed::FramedConnection;
use crate::traits::{Accepted, Connection, RawConnection, Transport, TransportError};

const ANNOUNCE_CAPACITY: usize = 64;

type Framer = dyn Fn(Box<dyn RawConnection>) -> Box<dyn Connection> + Send + Sync;

struct Binding {
    framer: Box<Framer>,
    tx: broadcast::Sender<AcceptedConnection>,
}

/// Registry of bindings and the announcement channel for each.
pub struct ConnectionListener {
    bindings: DashMap<String, Binding>,
    disposed: AtomicBool,
}

impl ConnectionListener {
    #[must_use]
    pub fn new() -> Self {
        Self {
            bindings: DashMap::new(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Register a binding that frames its connections with `formatter`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::DuplicateBinding`] if `name` is taken.
    pub fn register_binding<F>(&self, name: impl Into<String>, formatter: F) -> Result<(), TransportError>
    where
        F: Formatter + Clone,
    {
        if self.is_disposed() {
            return Err(TransportError::ListenerDisposed);
        }

        let name = name.into();
        match self.bindings.entry(name.clone()) {
            Entry::Occupied(_) => Err(TransportError::DuplicateBinding(name)),
            Entry::Vacant(slot) => {
                let binding = name.clone();
                let framer = move |raw: Box<dyn RawConnection>| -> Box<dyn Connection> {
                    Box::new(FramedConnection::new(raw, formatter.clone(), binding.clone()))
                };
                let (tx, _) = broadcast::channel(ANNOUNCE_CAPACITY);
                slot.insert(Binding {
                    framer: Box::new(framer),
                    tx,
                });
                info!(binding = %name, "Registered binding");
                Ok(())
            }
        }
    }

    /// Subscribe to connections accepted on `name` from now on.
    ///
    /// # Errors
    ///
    /// Returns an error if the binding is unknown or the listener is disposed.
    pub fn subscribe(&self, name: &str) -> Result<ConnectionStream, TransportError> {
        if self.is_disposed() {
            return Err(TransportError::ListenerDisposed);
        }

        let binding = self
            .bindings
            .get(name)
            .ok_or_else(|| TransportError::UnknownBinding(name.to_string()))?;

        Ok(ConnectionStream {
            binding: name.to_string(),
            rx: binding.tx.subscribe(),
        })
    }

    /// Frame a raw connection and announce it to the binding's subscribers.
    ///
    /// # Errors
    ///
    /// Returns an error if the binding is unknown, nobody is subscribed, or
    /// the listener is disposed. The raw connection is dropped in that case.
    pub fn accept(&self, name: &str, raw: Box<dyn RawConnection>) -> Result<(), TransportError> {
        if self.is_disposed() {
            return Err(TransportError::ListenerDisposed);
        }

        let binding = self
            .bindings
            .get(name)
            .ok_or_else(|| TransportError::UnknownBinding(name.to_string()))?;

        let id = raw.id().clone();
        let connection = (binding.framer)(raw);
        let accepted = AcceptedConnection {
            binding: Arc::from(name),
            slot: Arc::new(Mutex::new(Some(connection))),
        };

        match binding.tx.send(accepted) {
            Ok(receivers) => {
                debug!(conn = %id, binding = %name, receivers, "Announced connection");
                Ok(())
            }
            Err(_) => Err(TransportError::NoSubscriber(name.to_string())),
        }
    }

    /// Names of all registered bindings.
    #[must_use]
    pub fn binding_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bindings.iter().map(|b| b.key().clone()).collect();
        names.sort();
        names
    }

    /// Stop accepting and end every subscriber's stream.
    ///
    /// Connections already claimed by subscribers stay open.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.bindings.clear();
            info!("Connection listener disposed");
        }
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl Default for ConnectionListener {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionListener")
            .field("bindings", &self.binding_names())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// A newly accepted connection, shared among subscribers until claimed.
#[derive(Clone)]
pub struct AcceptedConnection {
    binding: Arc<str>,
    slot: Arc<Mutex<Option<Box<dyn Connection>>>>,
}

impl AcceptedConnection {
    /// The binding the connection arrived on.
    #[must_use]
    pub fn binding(&self) -> &str {
        &self.binding
    }

    /// Claim the connection. Only the first caller gets it.
    #[must_use]
    pub fn take(&self) -> Option<Box<dyn Connection>> {
        self.slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }
}

impl fmt::Debug for AcceptedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptedConnection")
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

/// Stream of connections accepted on one binding.
#[derive(Debug)]
pub struct ConnectionStream {
    binding: String,
    rx: broadcast::Receiver<AcceptedConnection>,
}

impl ConnectionStream {
    #[must_use]
    pub fn binding(&self) -> &str {
        &self.binding
    }

    /// Wait for the next connection. Returns `None` once the listener is
    /// disposed.
    pub async fn next(&mut self) -> Option<AcceptedConnection> {
        loop {
            match self.rx.recv().await {
                Ok(accepted) => return Some(accepted),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(binding = %self.binding, skipped, "Connection stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Pump connections from a transport into the listener until it is disposed.
pub async fn serve(transport: Arc<dyn Transport>, listener: Arc<ConnectionListener>) {
    info!(transport = transport.name(), "Serving transport");

    while !listener.is_disposed() {
        match transport.accept().await {
            Ok(Accepted {
                binding,
                connection,
            }) => {
                if let Err(e) = listener.accept(&binding, connection) {
                    warn!(transport = transport.name(), binding = %binding, error = %e, "Dropped connection");
                }
            }
            Err(TransportError::ConnectionClosed) => break,
            Err(e) => {
                warn!(transport = transport.name(), error = %e, "Accept failed");
            }
        }
    }

    debug!(transport = transport.name(), "Transport stopped");
}
