//! Channels, their subscribers and listeners.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bayeux_core::{ChannelId, ClientId, Message};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};

use crate::session::ServerSession;

/// Hook run for every message published to a channel, before broadcast.
pub trait ChannelListener: Send + Sync {
    /// Inspect or rewrite `message`. Return `false` to stop delivery.
    fn on_message(
        &self,
        channel: &ServerChannel,
        from: Option<&ServerSession>,
        message: &mut Message,
    ) -> bool;
}

impl<F> ChannelListener for F
where
    F: Fn(&ServerChannel, Option<&ServerSession>, &mut Message) -> bool + Send + Sync,
{
    fn on_message(
        &self,
        channel: &ServerChannel,
        from: Option<&ServerSession>,
        message: &mut Message,
    ) -> bool {
        self(channel, from, message)
    }
}

/// A channel known to the server.
pub struct ServerChannel {
    id: ChannelId,
    persistent: AtomicBool,
    lazy: AtomicBool,
    lazy_timeout: Mutex<Option<Duration>>,
    subscribers: DashMap<ClientId, Arc<ServerSession>>,
    listeners: RwLock<Vec<Arc<dyn ChannelListener>>>,
}

impl fmt::Debug for ServerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerChannel")
            .field("id", &self.id)
            .field("lazy", &self.is_lazy())
            .field("lazy_timeout", &self.lazy_timeout())
            .field("subscribers", &self.subscribers.len())
            .finish_non_exhaustive()
    }
}

impl ServerChannel {
    fn new(id: ChannelId) -> Self {
        Self {
            id,
            persistent: AtomicBool::new(false),
            lazy: AtomicBool::new(false),
            lazy_timeout: Mutex::new(None),
            subscribers: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Channel name.
    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    /// Whether the channel outlives its last subscriber.
    pub fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::Acquire)
    }

    /// Keep the channel when it has no subscribers.
    pub fn set_persistent(&self, persistent: bool) {
        self.persistent.store(persistent, Ordering::Release);
    }

    /// Whether messages on this channel are delivered lazily.
    pub fn is_lazy(&self) -> bool {
        self.lazy.load(Ordering::Acquire)
    }

    /// Mark the channel lazy.
    pub fn set_lazy(&self, lazy: bool) {
        self.lazy.store(lazy, Ordering::Release);
    }

    /// Per-channel delay overriding the global default.
    pub fn lazy_timeout(&self) -> Option<Duration> {
        *self.lazy_timeout.lock()
    }

    /// Set the per-channel delay. A non-zero delay also makes the channel lazy.
    pub fn set_lazy_timeout(&self, timeout: Option<Duration>) {
        *self.lazy_timeout.lock() = timeout;
        if timeout.is_some_and(|t| !t.is_zero()) {
            self.set_lazy(true);
        }
    }

    /// Add a subscriber. Returns `true` if it was not subscribed yet.
    pub fn subscribe(&self, session: Arc<ServerSession>) -> bool {
        self.subscribers
            .insert(session.id().clone(), session)
            .is_none()
    }

    /// Remove a subscriber. Returns `true` if it was subscribed.
    pub fn unsubscribe(&self, id: &ClientId) -> bool {
        self.subscribers.remove(id).is_some()
    }

    /// Current subscribers.
    pub fn subscribers(&self) -> Vec<Arc<ServerSession>> {
        self.subscribers.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Register a listener.
    pub fn add_listener(&self, listener: Arc<dyn ChannelListener>) {
        self.listeners.write().push(listener);
    }

    /// Run listeners in registration order. `false` if any vetoed.
    pub fn notify_listeners(&self, from: Option<&ServerSession>, message: &mut Message) -> bool {
        let listeners = self.listeners.read().clone();
        listeners
            .iter()
            .all(|listener| listener.on_message(self, from, message))
    }

    fn is_unused(&self) -> bool {
        !self.is_persistent()
            && self.subscribers.is_empty()
            && self.listeners.read().is_empty()
            && !self.is_lazy()
    }
}

/// Result of [`ChannelRegistry::create_if_absent`].
#[derive(Debug, Clone)]
pub struct MarkedReference<T> {
    /// The existing or new value.
    pub reference: T,
    /// Whether this call created it.
    pub created: bool,
}

/// All channels by name.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: DashMap<ChannelId, Arc<ServerChannel>>,
}

impl ChannelRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create `id`. `init` runs only on creation, under the map
    /// lock, so it must not touch the registry.
    pub fn create_if_absent(
        &self,
        id: &ChannelId,
        init: impl FnOnce(&ServerChannel),
    ) -> MarkedReference<Arc<ServerChannel>> {
        match self.channels.entry(id.clone()) {
            Entry::Occupied(entry) => MarkedReference {
                reference: Arc::clone(entry.get()),
                created: false,
            },
            Entry::Vacant(entry) => {
                let channel = ServerChannel::new(id.clone());
                init(&channel);
                let channel = Arc::new(channel);
                let _ = entry.insert(Arc::clone(&channel));
                MarkedReference {
                    reference: channel,
                    created: true,
                }
            }
        }
    }

    /// Look up a channel.
    pub fn get(&self, id: &ChannelId) -> Option<Arc<ServerChannel>> {
        self.channels.get(id).map(|c| Arc::clone(c.value()))
    }

    /// Remove a channel.
    pub fn remove(&self, id: &ChannelId) -> Option<Arc<ServerChannel>> {
        self.channels.remove(id).map(|(_, c)| c)
    }

    /// Remove `id` if it is not persistent, not lazy and nobody uses it.
    pub fn remove_if_unused(&self, id: &ChannelId) -> bool {
        self.channels.remove_if(id, |_, c| c.is_unused()).is_some()
    }

    /// Sessions that receive a broadcast on `id`: its own subscribers plus
    /// subscribers of every wildcard channel matching it, each once.
    pub fn subscribers_for(&self, id: &ChannelId) -> Vec<Arc<ServerSession>> {
        let mut seen = HashSet::new();
        let mut result = Vec::new();
        let candidates = std::iter::once(id.clone()).chain(id.wild_ancestors());
        for name in candidates {
            let Some(channel) = self.get(&name) else {
                continue;
            };
            for session in channel.subscribers() {
                if seen.insert(session.id().clone()) {
                    result.push(session);
                }
            }
        }
        result
    }

    /// Nearest lazy wildcard channel matching `id`.
    pub fn lazy_wildcard_ancestor(&self, id: &ChannelId) -> Option<Arc<ServerChannel>> {
        id.wild_ancestors()
            .iter()
            .filter_map(|name| self.get(name))
            .find(|channel| channel.is_lazy())
    }

    /// Known channel names.
    pub fn ids(&self) -> Vec<ChannelId> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    /// Channel count.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether no channels exist.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
