//! Realms and the realm container.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::broker::Broker;
use crate::dealer::Dealer;
use crate::session::SessionId;

/// An isolated routing domain.
pub struct Realm {
    name: String,
    dealer: Dealer,
    broker: Broker,
}

impl Realm {
    #[must_use]
    pub fn new(name: impl Into<String>, call_timeout: Option<Duration>) -> Self {
        Self {
            name: name.into(),
            dealer: Dealer::new(call_timeout),
            broker: Broker::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn dealer(&self) -> &Dealer {
        &self.dealer
    }

    #[must_use]
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Remove everything a departed session left behind.
    pub fn session_lost(&self, session: SessionId) {
        debug!(realm = %self.name, session, "Cleaning up session");
        self.broker.session_lost(session);
        self.dealer.session_lost(session);
    }
}

impl std::fmt::Debug for Realm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Realm")
            .field("name", &self.name)
            .field("registrations", &self.dealer.registration_count())
            .field("topics", &self.broker.topic_count())
            .finish()
    }
}

/// All realms of a router, keyed by name.
///
/// Realms are created on first reference and live as long as the
/// container.
#[derive(Default)]
pub struct RealmContainer {
    realms: DashMap<String, Arc<Realm>>,
    call_timeout: Option<Duration>,
}

impl RealmContainer {
    #[must_use]
    pub fn new(call_timeout: Option<Duration>) -> Self {
        Self {
            realms: DashMap::new(),
            call_timeout,
        }
    }

    /// Get a realm, creating it if needed. Concurrent callers with the same
    /// name get the same instance.
    pub fn get_or_create(&self, name: &str) -> Arc<Realm> {
        self.get_or_create_with(name, |_| {})
    }

    /// Like [`get_or_create`](Self::get_or_create), running `init` on a
    /// freshly created realm before anyone else can see it.
    pub fn get_or_create_with(&self, name: &str, init: impl FnOnce(&Arc<Realm>)) -> Arc<Realm> {
        if let Some(realm) = self.realms.get(name) {
            return Arc::clone(&realm);
        }

        match self.realms.entry(name.to_string()) {
            Entry::Occupied(existing) => Arc::clone(existing.get()),
            Entry::Vacant(slot) => {
                let realm = Arc::new(Realm::new(name, self.call_timeout));
                init(&realm);
                slot.insert(Arc::clone(&realm));
                info!(realm = name, "Created realm");
                realm
            }
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Realm>> {
        self.realms.get(name).map(|r| Arc::clone(&r))
    }

    /// Realm names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.realms.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.realms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.realms.is_empty()
    }

    /// Iterate over a snapshot of all realms.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Realm>> {
        self.realms.iter().map(|r| Arc::clone(r.value())).collect()
    }
}
