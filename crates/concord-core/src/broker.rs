//! Publish/subscribe routing.

use std::collections::{HashMap, HashSet};

use concord_protocol::{Dict, Id, List, Value, WampMessage};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::error::RouterError;
use crate::id::{next_publication_id, IdGenerator};
use crate::session::{SessionHandle, SessionId};

struct Topic {
    subscription: Id,
    subscribers: HashMap<SessionId, SessionHandle>,
}

/// Options carried by a PUBLISH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    /// Reply with PUBLISHED, and report errors.
    pub acknowledge: bool,
    /// Skip the publisher even if it is subscribed.
    pub exclude_me: bool,
    pub exclude: HashSet<SessionId>,
    /// When set, only these sessions receive the event.
    pub eligible: Option<HashSet<SessionId>>,
    /// Put the publisher's session id in EVENT details.
    pub disclose_me: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            acknowledge: false,
            exclude_me: true,
            exclude: HashSet::new(),
            eligible: None,
            disclose_me: false,
        }
    }
}

fn session_set(value: &Value) -> HashSet<SessionId> {
    value
        .as_list()
        .map(|items| items.iter().filter_map(Value::as_u64).collect())
        .unwrap_or_default()
}

impl PublishOptions {
    /// Read options from a PUBLISH options dict. Unknown keys are ignored.
    #[must_use]
    pub fn from_dict(options: &Dict) -> Self {
        let flag = |key: &str, default: bool| options.get(key).and_then(Value::as_bool).unwrap_or(default);
        Self {
            acknowledge: flag("acknowledge", false),
            exclude_me: flag("exclude_me", true),
            exclude: options.get("exclude").map(session_set).unwrap_or_default(),
            eligible: options.get("eligible").map(session_set),
            disclose_me: flag("disclose_me", false),
        }
    }

    fn admits(&self, publisher: Option<SessionId>, subscriber: SessionId) -> bool {
        if self.exclude_me && publisher == Some(subscriber) {
            return false;
        }
        if self.exclude.contains(&subscriber) {
            return false;
        }
        self.eligible.as_ref().map_or(true, |e| e.contains(&subscriber))
    }
}

/// Per-realm event router.
#[derive(Default)]
pub struct Broker {
    topics: DashMap<String, Topic>,
    by_id: DashMap<Id, String>,
    ids: IdGenerator,
}

impl Broker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a session to a topic.
    ///
    /// All subscribers of a topic share one subscription id; subscribing
    /// again returns the same id.
    pub fn subscribe(&self, session: &SessionHandle, topic: &str) -> Id {
        let mut entry = match self.topics.entry(topic.to_string()) {
            Entry::Occupied(occupied) => occupied.into_ref(),
            Entry::Vacant(vacant) => {
                let subscription = self.ids.next();
                self.by_id.insert(subscription, topic.to_string());
                vacant.insert(Topic {
                    subscription,
                    subscribers: HashMap::new(),
                })
            }
        };

        entry.subscribers.insert(session.id(), session.clone());
        let subscription = entry.subscription;
        debug!(topic, subscription, session = session.id(), "Subscribed");
        subscription
    }

    /// Remove a session from a subscription.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::NoSuchSubscription`] if the session is not
    /// subscribed under this id.
    pub fn unsubscribe(&self, session: SessionId, subscription: Id) -> Result<(), RouterError> {
        let topic = self
            .by_id
            .get(&subscription)
            .map(|t| t.clone())
            .ok_or(RouterError::NoSuchSubscription(subscription))?;

        let removed = match self.topics.get_mut(&topic) {
            Some(mut entry) if entry.subscription == subscription => {
                entry.subscribers.remove(&session).is_some()
            }
            _ => false,
        };
        if !removed {
            return Err(RouterError::NoSuchSubscription(subscription));
        }

        self.drop_if_empty(&topic, subscription);
        debug!(topic = %topic, subscription, session, "Unsubscribed");
        Ok(())
    }

    fn drop_if_empty(&self, topic: &str, subscription: Id) {
        if self
            .topics
            .remove_if(topic, |_, t| t.subscription == subscription && t.subscribers.is_empty())
            .is_some()
        {
            self.by_id.remove(&subscription);
            trace!(topic, subscription, "Topic has no subscribers left");
        }
    }

    /// Publish an event and return the publication id.
    ///
    /// The subscriber set is snapshotted before delivery. A subscriber
    /// whose session is gone is skipped without affecting the others.
    pub fn publish(
        &self,
        publisher: Option<SessionId>,
        topic: &str,
        options: &PublishOptions,
        args: List,
        kwargs: Dict,
    ) -> Id {
        let publication = next_publication_id();

        let snapshot = match self.topics.get(topic) {
            Some(entry) => (
                entry.subscription,
                entry
                    .subscribers
                    .iter()
                    .filter(|(id, _)| options.admits(publisher, **id))
                    .map(|(_, handle)| handle.clone())
                    .collect::<Vec<_>>(),
            ),
            None => {
                trace!(topic, publication, "No subscribers");
                return publication;
            }
        };
        let (subscription, receivers) = snapshot;

        let mut details = Dict::new();
        if options.disclose_me {
            if let Some(publisher) = publisher {
                details.insert("publisher".into(), Value::from(publisher));
            }
        }
        details.insert("topic".into(), Value::from(topic));

        let mut delivered = 0usize;
        for receiver in &receivers {
            let event = WampMessage::Event {
                subscription,
                publication,
                details: details.clone(),
                args: args.clone(),
                kwargs: kwargs.clone(),
            };
            if receiver.send(event) {
                delivered += 1;
            } else {
                debug!(topic, session = receiver.id(), "Subscriber gone, event dropped");
            }
        }

        trace!(topic, publication, delivered, "Published");
        publication
    }

    /// Drop every subscription a session holds.
    pub fn session_lost(&self, session: SessionId) {
        let mut emptied = Vec::new();
        for mut entry in self.topics.iter_mut() {
            if entry.subscribers.remove(&session).is_some() && entry.subscribers.is_empty() {
                emptied.push((entry.key().clone(), entry.subscription));
            }
        }

        let count = emptied.len();
        for (topic, subscription) in emptied {
            self.drop_if_empty(&topic, subscription);
        }
        if count > 0 {
            debug!(session, topics = count, "Broker cleaned up session");
        }
    }

    /// Subscription id for a topic.
    #[must_use]
    pub fn lookup(&self, topic: &str) -> Option<Id> {
        self.topics.get(topic).map(|t| t.subscription)
    }

    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Number of (session, topic) pairs.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.topics.iter().map(|t| t.subscribers.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::test_session;

    fn event_args(message: WampMessage) -> List {
        match message {
            WampMessage::Event { args, .. } => args,
            other => panic!("Expected EVENT, got {:?}", other),
        }
    }

    #[test]
    fn test_shared_subscription_id() {
        let broker = Broker::new();
        let (a, _rx_a) = test_session(1, "realm1");
        let (b, _rx_b) = test_session(2, "realm1");

        let first = broker.subscribe(&a, "com.example.t");
        assert_eq!(broker.subscribe(&b, "com.example.t"), first);
        assert_eq!(broker.subscribe(&a, "com.example.t"), first);
        assert_eq!(broker.subscription_count(), 2);
        assert_eq!(broker.topic_count(), 1);
    }

    #[test]
    fn test_publish_snapshot() {
        let broker = Broker::new();
        let (a, mut rx_a) = test_session(1, "realm1");
        let (late, mut rx_late) = test_session(3, "realm1");
        broker.subscribe(&a, "com.example.t");

        broker.publish(Some(2), "com.example.t", &PublishOptions::default(), vec![1.into()], Dict::new());
        broker.subscribe(&late, "com.example.t");

        assert_eq!(event_args(rx_a.try_recv().unwrap()), vec![Value::from(1)]);
        assert!(rx_late.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let broker = Broker::new();
        let first = broker.publish(None, "com.example.empty", &PublishOptions::default(), vec![], Dict::new());
        let second = broker.publish(None, "com.example.empty", &PublishOptions::default(), vec![], Dict::new());
        assert!(second > first);
        assert_eq!(broker.topic_count(), 0);
    }

    #[test]
    fn test_exclude_me_and_eligible() {
        let broker = Broker::new();
        let (a, mut rx_a) = test_session(1, "realm1");
        let (b, mut rx_b) = test_session(2, "realm1");
        let (c, mut rx_c) = test_session(3, "realm1");
        for s in [&a, &b, &c] {
            broker.subscribe(s, "com.example.t");
        }

        broker.publish(Some(1), "com.example.t", &PublishOptions::default(), vec![], Dict::new());
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_ok());

        let mut dict = Dict::new();
        dict.insert("exclude_me".into(), Value::Bool(false));
        dict.insert("eligible".into(), Value::List(vec![1.into(), 3.into()]));
        dict.insert("exclude".into(), Value::List(vec![3.into()]));
        let options = PublishOptions::from_dict(&dict);
        broker.publish(Some(1), "com.example.t", &options, vec![], Dict::new());

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn test_disclose_publisher() {
        let broker = Broker::new();
        let (a, mut rx_a) = test_session(1, "realm1");
        broker.subscribe(&a, "com.example.t");

        let options = PublishOptions {
            disclose_me: true,
            ..PublishOptions::default()
        };
        broker.publish(Some(7), "com.example.t", &options, vec![], Dict::new());

        match rx_a.try_recv().unwrap() {
            WampMessage::Event { details, .. } => assert_eq!(details["publisher"], Value::from(7)),
            other => panic!("Expected EVENT, got {:?}", other),
        }
    }

    #[test]
    fn test_dead_subscriber_does_not_block_others() {
        let broker = Broker::new();
        let (a, rx_a) = test_session(1, "realm1");
        let (b, mut rx_b) = test_session(2, "realm1");
        broker.subscribe(&a, "com.example.t");
        broker.subscribe(&b, "com.example.t");
        drop(rx_a);

        broker.publish(None, "com.example.t", &PublishOptions::default(), vec![], Dict::new());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn test_unsubscribe_ownership() {
        let broker = Broker::new();
        let (a, _rx_a) = test_session(1, "realm1");
        let id = broker.subscribe(&a, "com.example.t");

        assert!(matches!(broker.unsubscribe(2, id), Err(RouterError::NoSuchSubscription(_))));
        broker.unsubscribe(1, id).unwrap();
        assert_eq!(broker.topic_count(), 0);
        assert_eq!(broker.lookup("com.example.t"), None);
        assert!(broker.unsubscribe(1, id).is_err());
    }

    #[test]
    fn test_session_lost() {
        let broker = Broker::new();
        let (a, _rx_a) = test_session(1, "realm1");
        let (b, _rx_b) = test_session(2, "realm1");
        broker.subscribe(&a, "com.example.one");
        broker.subscribe(&a, "com.example.two");
        broker.subscribe(&b, "com.example.two");

        broker.session_lost(1);
        assert_eq!(broker.topic_count(), 1);
        assert_eq!(broker.subscription_count(), 1);
        assert!(broker.lookup("com.example.one").is_none());
    }

    #[test]
    fn test_per_subscriber_order() {
        let broker = Broker::new();
        let (a, mut rx_a) = test_session(1, "realm1");
        broker.subscribe(&a, "com.example.t");

        for i in 0..10 {
            broker.publish(None, "com.example.t", &PublishOptions::default(), vec![Value::from(i)], Dict::new());
        }
        for i in 0..10 {
            assert_eq!(event_args(rx_a.try_recv().unwrap()), vec![Value::from(i)]);
        }
    }
}
