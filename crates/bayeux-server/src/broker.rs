//! Shared server state: channels, sessions and the publish path.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bayeux_core::{ChannelId, ClientId, Message};
use bayeux_settings::TransportSettings;
use metrics::{counter, gauge};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace};

use crate::error::PublishError;
use crate::lazy::LazyMessageScheduler;
use crate::metrics::{PUBLISHES_TOTAL, SESSIONS_ACTIVE, SESSIONS_EXPIRED_TOTAL};
use crate::registry::ChannelRegistry;
use crate::session::{ServerSession, SessionRegistry};

/// Everything transports share.
#[derive(Debug)]
pub struct Broker {
    settings: TransportSettings,
    channels: ChannelRegistry,
    sessions: SessionRegistry,
    lazy: Arc<LazyMessageScheduler>,
    next_exchange: AtomicU64,
}

impl Broker {
    /// Empty broker.
    pub fn new(settings: TransportSettings) -> Self {
        let lazy = Arc::new(LazyMessageScheduler::new(settings.max_lazy_timeout()));
        Self {
            settings,
            channels: ChannelRegistry::new(),
            sessions: SessionRegistry::new(),
            lazy,
            next_exchange: AtomicU64::new(1),
        }
    }

    /// Transport settings.
    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Channel registry.
    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    /// Session registry.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Lazy delivery scheduler.
    pub fn lazy(&self) -> &Arc<LazyMessageScheduler> {
        &self.lazy
    }

    /// Id for the next request/response exchange.
    pub fn next_exchange_id(&self) -> u64 {
        self.next_exchange.fetch_add(1, Ordering::Relaxed)
    }

    /// Create and register a session.
    pub fn create_session(&self) -> Arc<ServerSession> {
        let session = Arc::new(ServerSession::new(
            ClientId::new(),
            Arc::clone(&self.lazy),
            self.settings.expiration_grace(),
        ));
        self.sessions.insert(Arc::clone(&session));
        gauge!(SESSIONS_ACTIVE).increment(1.0);
        info!(session_id = %session.id(), "session created");
        session
    }

    /// Look up a live session.
    pub fn session(&self, id: &ClientId) -> Option<Arc<ServerSession>> {
        self.sessions.get(id)
    }

    /// Unregister and tear down a session. Returns `false` if unknown.
    pub fn remove_session(&self, id: &ClientId, reason: &str) -> bool {
        let Some(session) = self.sessions.remove(id) else {
            return false;
        };
        for channel in session.subscriptions() {
            if let Some(server_channel) = self.channels.get(&channel) {
                let _ = server_channel.unsubscribe(id);
            }
            let _ = self.channels.remove_if_unused(&channel);
        }
        session.teardown();
        gauge!(SESSIONS_ACTIVE).decrement(1.0);
        info!(session_id = %id, reason, "session removed");
        true
    }

    /// Subscribe `session` to `channel`, creating the channel if needed.
    pub fn subscribe(&self, session: &Arc<ServerSession>, channel: &ChannelId) -> bool {
        let server_channel = self.channels.create_if_absent(channel, |_| {}).reference;
        let added = server_channel.subscribe(Arc::clone(session));
        let _ = session.add_subscription(channel.clone());
        debug!(session_id = %session.id(), channel = %channel, added, "subscribed");
        added
    }

    /// Remove a subscription. Returns `false` if there was none.
    pub fn unsubscribe(&self, session: &ServerSession, channel: &ChannelId) -> bool {
        let removed = self
            .channels
            .get(channel)
            .is_some_and(|c| c.unsubscribe(session.id()));
        let _ = session.remove_subscription(channel);
        let _ = self.channels.remove_if_unused(channel);
        debug!(session_id = %session.id(), channel = %channel, removed, "unsubscribed");
        removed
    }

    /// Broadcast `message` to every subscriber of its channel.
    ///
    /// Channel listeners run first and may rewrite or veto the message.
    /// Service channels only run listeners. Returns how many sessions the
    /// message was scheduled for.
    #[instrument(skip_all, fields(channel = %message.channel))]
    pub fn publish(
        &self,
        from: Option<&Arc<ServerSession>>,
        mut message: Message,
    ) -> Result<usize, PublishError> {
        let channel = message.channel_id()?;
        if channel.is_meta() || channel.is_wildcard() {
            return Err(PublishError::NotPublishable(channel));
        }
        let origin = if from.is_some() { "client" } else { "server" };
        counter!(PUBLISHES_TOTAL, "origin" => origin).increment(1);

        if let Some(server_channel) = self.channels.get(&channel) {
            if !server_channel.notify_listeners(from.map(|s| &**s), &mut message) {
                debug!("publish vetoed by listener");
                return Ok(0);
            }
        }
        if channel.is_service() {
            return Ok(0);
        }

        let mut delay = self.lazy.resolve_delay(&self.channels, &channel);
        if delay.is_zero() && message.lazy {
            delay = self.lazy.default_delay();
        }
        message.lazy = !delay.is_zero();

        let subscribers = self.channels.subscribers_for(&channel);
        let message = Arc::new(message);
        for session in &subscribers {
            self.lazy.schedule(session, Arc::clone(&message), delay);
        }
        trace!(subscribers = subscribers.len(), ?delay, "published");
        Ok(subscribers.len())
    }

    /// Server-side publish of `data` on `channel`.
    pub fn publish_data(&self, channel: &str, data: Value) -> Result<usize, PublishError> {
        self.publish(None, Message::publish(channel, data))
    }

    /// Remove sessions whose expiration elapsed at `now`.
    pub fn sweep(&self, now: Instant) -> Vec<ClientId> {
        let expired = self.sessions.expired(now);
        for id in &expired {
            if self.remove_session(id, "expired") {
                counter!(SESSIONS_EXPIRED_TOTAL).increment(1);
            }
        }
        expired
    }

    /// Resume every suspended connect, used on shutdown.
    pub fn wake_all(&self) -> usize {
        self.sessions.all().iter().filter(|s| s.wake()).count()
    }
}
