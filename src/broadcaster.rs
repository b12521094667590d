//! Fan-out of records and notices to every connected subscriber.

use std::{
    collections::HashMap,
    fmt::Display,
    sync::{Arc, Weak},
};

use tokio::sync::RwLock;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{actions::Outbound, error::Error};

/// Identifies a subscriber for as long as it is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Something which wants broadcasts.
pub trait Subscriber: Send + Sync {
    /// Hand over a message. Must not block.
    ///
    /// An error means this subscriber is done and should be forgotten.
    fn deliver(&self, message: &Outbound) -> Result<(), Error>;
}

/// The set of subscribers, and broadcasting to them.
///
/// Only weak references are kept, so a subscriber which is dropped
/// is forgotten at the next broadcast.
#[derive(Clone, Default)]
pub struct Broadcaster {
    subscribers: Arc<RwLock<HashMap<SubscriberId, Weak<dyn Subscriber>>>>,
}

impl Broadcaster {
    /// A broadcaster without subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber.
    pub async fn add<S: Subscriber + 'static>(&self, subscriber: &Arc<S>) -> SubscriberId {
        let id = SubscriberId::new();
        let subscriber: Arc<dyn Subscriber> = subscriber.clone();

        self.subscribers
            .write()
            .await
            .insert(id, Arc::downgrade(&subscriber));

        debug!(%id, "Subscriber added");
        id
    }

    /// Forget a subscriber.
    ///
    /// Once this returns, no broadcast delivers to it anymore.
    /// Returns whether it was registered.
    pub async fn remove(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.write().await.remove(&id).is_some();
        debug!(%id, %removed, "Subscriber removed");

        removed
    }

    /// Deliver to everyone registered right now.
    /// Returns how many deliveries succeeded.
    pub async fn broadcast(&self, message: &Outbound) -> usize {
        let mut delivered = 0;
        let mut gone = vec![];

        {
            let subscribers = self.subscribers.read().await;

            for (id, subscriber) in subscribers.iter() {
                let result = match subscriber.upgrade() {
                    Some(subscriber) => subscriber.deliver(message),
                    None => Err(Error::SubscriberGone),
                };

                match result {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        trace!(%id, %e, "Delivery failed");
                        gone.push(*id);
                    }
                }
            }
        }

        if !gone.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in gone {
                subscribers.remove(&id);
                debug!(%id, "Evicted subscriber");
            }
        }

        delivered
    }

    /// How many subscribers are registered.
    pub async fn len(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Whether there are no subscribers.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
