//! Topic subscription registry.
//!
//! Maps a [`TopicKey`] to at most one live broker subscription plus the
//! handler that receives its messages. Registering a key that is already
//! present replaces the entry and hands back the old transport handle so the
//! caller can cancel it; frames still in flight for that old handle no longer
//! resolve to a handler and are dropped.

use std::collections::HashMap;

use ride_types::{ChatMessage, LocationUpdate, RideEvent, RideSnapshot, TopicKey, TypesError};
use tracing::{trace, warn};

use crate::transport::{Frame, SubscriptionId};

/// Callback invoked with the raw body of every message on a subscription.
pub type Handler = Box<dyn FnMut(&str) + Send>;

/// Payload types a subscription can be decoded into.
pub trait Decode: Sized {
    /// Parse a message body.
    fn decode(body: &str) -> Result<Self, TypesError>;
}

impl Decode for RideEvent {
    fn decode(body: &str) -> Result<Self, TypesError> {
        RideEvent::from_json(body)
    }
}

impl Decode for LocationUpdate {
    fn decode(body: &str) -> Result<Self, TypesError> {
        LocationUpdate::from_json(body)
    }
}

impl Decode for ChatMessage {
    fn decode(body: &str) -> Result<Self, TypesError> {
        ChatMessage::from_json(body)
    }
}

impl Decode for RideSnapshot {
    fn decode(body: &str) -> Result<Self, TypesError> {
        RideSnapshot::from_json(body)
    }
}

/// Wrap a typed callback into a [`Handler`].
///
/// Bodies that fail to decode are logged and dropped; the subscription
/// stays alive.
pub fn typed_handler<T, F>(key: &TopicKey, mut on_message: F) -> Handler
where
    T: Decode,
    F: FnMut(T) + Send + 'static,
{
    let topic = key.to_string();
    Box::new(move |body: &str| match T::decode(body) {
        Ok(message) => on_message(message),
        Err(e) => warn!(%topic, error = %e, "dropping malformed message"),
    })
}

struct Entry {
    destination: String,
    handle: Option<SubscriptionId>,
    handler: Handler,
}

/// Registered topics, their live handles and handlers.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<TopicKey, Entry>,
    order: Vec<TopicKey>,
    by_handle: HashMap<SubscriptionId, TopicKey>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key`, replacing any existing entry.
    ///
    /// Returns the replaced entry's live handle, which the caller must
    /// unsubscribe.
    pub fn insert(
        &mut self,
        key: TopicKey,
        destination: String,
        handler: Handler,
    ) -> Option<SubscriptionId> {
        let old = self.remove(&key);
        self.order.push(key.clone());
        self.entries.insert(
            key,
            Entry {
                destination,
                handle: None,
                handler,
            },
        );
        old
    }

    /// Attach a transport handle to a registered, unbound key.
    ///
    /// Returns `false` if the key is gone or already bound.
    pub fn bind(&mut self, key: &TopicKey, handle: SubscriptionId) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        if entry.handle.is_some() {
            return false;
        }
        self.by_handle.insert(handle.clone(), key.clone());
        entry.handle = Some(handle);
        true
    }

    /// Destination for a key that still needs a subscription.
    pub fn unbound_destination(&self, key: &TopicKey) -> Option<String> {
        self.entries
            .get(key)
            .filter(|entry| entry.handle.is_none())
            .map(|entry| entry.destination.clone())
    }

    /// Remove a key. Returns its live handle, if it had one.
    pub fn remove(&mut self, key: &TopicKey) -> Option<SubscriptionId> {
        let entry = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        let handle = entry.handle?;
        self.by_handle.remove(&handle);
        Some(handle)
    }

    /// Forget every live handle (the link is gone) and return all keys in
    /// registration order for re-subscription.
    pub fn unbind_all(&mut self) -> Vec<TopicKey> {
        self.by_handle.clear();
        for entry in self.entries.values_mut() {
            entry.handle = None;
        }
        self.order.clone()
    }

    /// Remove everything. Returns the live handles to unsubscribe.
    pub fn drain(&mut self) -> Vec<SubscriptionId> {
        let handles = self
            .order
            .iter()
            .filter_map(|key| self.entries.get(key).and_then(|e| e.handle.clone()))
            .collect();
        self.entries.clear();
        self.order.clear();
        self.by_handle.clear();
        handles
    }

    /// Hand a frame to the handler of its subscription.
    ///
    /// Returns `false` if the frame belongs to no current subscription.
    pub fn dispatch(&mut self, frame: &Frame) -> bool {
        let Some(key) = self.by_handle.get(&frame.subscription) else {
            trace!(subscription = %frame.subscription, "frame for unknown subscription");
            return false;
        };
        match self.entries.get_mut(key) {
            Some(entry) => {
                (entry.handler)(&frame.body);
                true
            }
            None => false,
        }
    }

    /// Whether `key` is registered.
    pub fn contains(&self, key: &TopicKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Whether `key` has a live handle.
    pub fn is_bound(&self, key: &TopicKey) -> bool {
        self.entries.get(key).is_some_and(|e| e.handle.is_some())
    }

    /// Registered keys in registration order.
    pub fn keys(&self) -> &[TopicKey] {
        &self.order
    }

    /// Number of registered keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("keys", &self.order)
            .field("bound", &self.by_handle.len())
            .finish()
    }
}
