//! Lazy message delivery.
//!
//! A lazy message is not pushed to subscribers right away: it sits on a
//! timer and becomes visible to each session once its delay elapses. The
//! delay of a broadcast is resolved from the channel tree:
//!
//! 1. the channel's own lazy timeout, if set;
//! 2. else the nearest lazy wildcard channel matching it (`/a/b/*`,
//!    `/a/b/**`, `/a/**`, `/**`), using that channel's timeout or the
//!    global default;
//! 3. else the global default, if the channel itself is lazy;
//! 4. else zero.
//!
//! A plain parent (`/a` for `/a/b`) never makes its children lazy.

use std::sync::Arc;
use std::time::Duration;

use bayeux_core::{ChannelId, Message};
use metrics::{counter, gauge};
use tracing::{debug, trace};

use crate::metrics::{LAZY_DELIVERIES_PENDING, LAZY_DELIVERIES_TOTAL};
use crate::registry::ChannelRegistry;
use crate::session::ServerSession;

/// Computes delivery delays and runs delayed deliveries.
#[derive(Debug, Clone)]
pub struct LazyMessageScheduler {
    default_delay: Duration,
}

impl LazyMessageScheduler {
    /// Scheduler with the global default delay.
    pub fn new(default_delay: Duration) -> Self {
        Self { default_delay }
    }

    /// The global default delay.
    pub fn default_delay(&self) -> Duration {
        self.default_delay
    }

    /// Delay for a broadcast on `channel`.
    pub fn resolve_delay(&self, channels: &ChannelRegistry, channel: &ChannelId) -> Duration {
        let own = channels.get(channel);
        if let Some(timeout) = own.as_ref().and_then(|c| c.lazy_timeout()) {
            return timeout;
        }
        if let Some(ancestor) = channels.lazy_wildcard_ancestor(channel) {
            return ancestor.lazy_timeout().unwrap_or(self.default_delay);
        }
        if own.is_some_and(|c| c.is_lazy()) {
            return self.default_delay;
        }
        Duration::ZERO
    }

    /// Delay for a single-session delivery: only messages flagged lazy wait.
    pub fn direct_delay(&self, message: &Message) -> Duration {
        if message.lazy {
            self.default_delay
        } else {
            Duration::ZERO
        }
    }

    /// Deliver `message` to `session` after `delay`.
    ///
    /// With a zero delay the message is queued and the session woken now.
    /// Otherwise a task waits out the delay; teardown of the session
    /// cancels it.
    pub fn schedule(&self, session: &Arc<ServerSession>, message: Arc<Message>, delay: Duration) {
        if delay.is_zero() {
            session.enqueue_and_wake(message);
            return;
        }

        let session = Arc::clone(session);
        let cancelled = session.lazy_cancel_token();
        session.lazy_task_started();
        gauge!(LAZY_DELIVERIES_PENDING).increment(1.0);
        trace!(session_id = %session.id(), channel = %message.channel, ?delay, "lazy delivery scheduled");

        drop(tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancelled.cancelled() => {
                    debug!(session_id = %session.id(), channel = %message.channel, "lazy delivery cancelled");
                }
                () = tokio::time::sleep(delay) => {
                    counter!(LAZY_DELIVERIES_TOTAL).increment(1);
                    session.enqueue_and_wake(message);
                }
            }
            gauge!(LAZY_DELIVERIES_PENDING).decrement(1.0);
            session.lazy_task_finished();
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bayeux_core::ClientId;
    use serde_json::json;

    const DEFAULT: Duration = Duration::from_millis(1000);

    fn lazy() -> Arc<LazyMessageScheduler> {
        Arc::new(LazyMessageScheduler::new(DEFAULT))
    }

    fn id(name: &str) -> ChannelId {
        ChannelId::new(name).unwrap()
    }

    fn session(lazy: &Arc<LazyMessageScheduler>) -> Arc<ServerSession> {
        Arc::new(ServerSession::new(
            ClientId::new(),
            Arc::clone(lazy),
            Duration::from_secs(60),
        ))
    }

    #[test]
    fn plain_channel_is_immediate() {
        let channels = ChannelRegistry::new();
        let _ = channels.create_if_absent(&id("/plain"), |_| {});
        assert_eq!(lazy().resolve_delay(&channels, &id("/plain")), Duration::ZERO);
        assert_eq!(lazy().resolve_delay(&channels, &id("/unknown")), Duration::ZERO);
    }

    #[test]
    fn lazy_channel_uses_global_default() {
        let channels = ChannelRegistry::new();
        let _ = channels.create_if_absent(&id("/testLazy"), |c| c.set_lazy(true));
        assert_eq!(lazy().resolve_delay(&channels, &id("/testLazy")), DEFAULT);
    }

    #[test]
    fn own_override_wins() {
        let channels = ChannelRegistry::new();
        let _ = channels.create_if_absent(&id("/foo/*"), |c| {
            c.set_lazy_timeout(Some(Duration::from_millis(4000)));
        });
        let _ = channels.create_if_absent(&id("/foo/bar"), |c| {
            c.set_lazy_timeout(Some(Duration::from_millis(250)));
        });
        assert_eq!(
            lazy().resolve_delay(&channels, &id("/foo/bar")),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn direct_parent_does_not_propagate() {
        let channels = ChannelRegistry::new();
        let _ = channels.create_if_absent(&id("/foo"), |c| c.set_lazy(true));
        let _ = channels.create_if_absent(&id("/foo/bar"), |_| {});
        assert_eq!(lazy().resolve_delay(&channels, &id("/foo/bar")), Duration::ZERO);
    }

    #[test]
    fn wildcard_ancestor_propagates() {
        let channels = ChannelRegistry::new();
        let _ = channels.create_if_absent(&id("/foo/*"), |c| c.set_lazy(true));
        assert_eq!(lazy().resolve_delay(&channels, &id("/foo/bar")), DEFAULT);
        // `*` only covers direct children.
        assert_eq!(lazy().resolve_delay(&channels, &id("/foo/bar/baz")), Duration::ZERO);
    }

    #[test]
    fn nearest_wildcard_ancestor_wins() {
        let channels = ChannelRegistry::new();
        let _ = channels.create_if_absent(&id("/**"), |c| {
            c.set_lazy_timeout(Some(Duration::from_millis(3000)));
        });
        let _ = channels.create_if_absent(&id("/a/**"), |c| {
            c.set_lazy_timeout(Some(Duration::from_millis(2000)));
        });
        let _ = channels.create_if_absent(&id("/a/b/*"), |c| c.set_lazy(true));
        assert_eq!(lazy().resolve_delay(&channels, &id("/a/b/c")), DEFAULT);
        assert_eq!(
            lazy().resolve_delay(&channels, &id("/a/x/y")),
            Duration::from_millis(2000)
        );
        assert_eq!(
            lazy().resolve_delay(&channels, &id("/z")),
            Duration::from_millis(3000)
        );
    }

    #[test]
    fn non_lazy_wildcard_is_skipped() {
        let channels = ChannelRegistry::new();
        let _ = channels.create_if_absent(&id("/a/*"), |_| {});
        let _ = channels.create_if_absent(&id("/a/**"), |c| c.set_lazy(true));
        assert_eq!(lazy().resolve_delay(&channels, &id("/a/b")), DEFAULT);
    }

    #[test]
    fn direct_delay_follows_message_flag() {
        let mut msg = Message::publish("/x", json!(1));
        assert_eq!(lazy().direct_delay(&msg), Duration::ZERO);
        msg.lazy = true;
        assert_eq!(lazy().direct_delay(&msg), DEFAULT);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_delivery_fires_after_delay() {
        let lazy = lazy();
        let s = session(&lazy);
        lazy.schedule(&s, Arc::new(Message::publish("/l", json!(1))), DEFAULT);
        assert_eq!(s.pending_lazy(), 1);

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert!(s.queue().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(s.queue().len(), 1);
        assert_eq!(s.pending_lazy(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shorter_delay_delivers_first() {
        let lazy = lazy();
        let s = session(&lazy);
        lazy.schedule(&s, Arc::new(Message::publish("/long", json!("long"))), Duration::from_millis(2000));
        lazy.schedule(&s, Arc::new(Message::publish("/short", json!("short"))), Duration::from_millis(500));

        tokio::time::sleep(Duration::from_millis(2100)).await;
        let order: Vec<_> = s.queue().drain().iter().map(|m| m.channel.clone()).collect();
        assert_eq!(order, vec!["/short", "/long"]);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_cancels_pending_deliveries() {
        let lazy = lazy();
        let s = session(&lazy);
        lazy.schedule(&s, Arc::new(Message::publish("/l", json!(1))), DEFAULT);
        lazy.schedule(&s, Arc::new(Message::publish("/l", json!(2))), DEFAULT);
        assert_eq!(s.pending_lazy(), 2);

        s.teardown();
        tokio::time::sleep(DEFAULT * 2).await;
        assert!(s.queue().is_empty());
        assert_eq!(s.pending_lazy(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn session_deliver_honours_lazy_flag() {
        let lazy = lazy();
        let s = session(&lazy);
        s.deliver(Message::publish("/d", json!("now")));
        assert_eq!(s.queue().len(), 1);

        let mut delayed = Message::publish("/d", json!("later"));
        delayed.lazy = true;
        s.deliver(delayed);
        assert_eq!(s.queue().len(), 1);
        tokio::time::sleep(DEFAULT + Duration::from_millis(1)).await;
        assert_eq!(s.queue().len(), 2);
    }
}
