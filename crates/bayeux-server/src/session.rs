//! Server-side sessions and the session registry.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bayeux_core::{ChannelId, ClientId, Message};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::lazy::LazyMessageScheduler;
use crate::long_poll::Scheduler;
use crate::queue::SessionQueue;

#[derive(Clone, Copy, Debug)]
struct Expiration {
    deadline: Instant,
    cycle: u64,
}

/// One client session, created by a handshake.
#[derive(Debug)]
pub struct ServerSession {
    id: ClientId,
    queue: SessionQueue,
    lazy: Arc<LazyMessageScheduler>,
    scheduler: Mutex<Option<Arc<dyn Scheduler>>>,
    connected: AtomicBool,
    removed: AtomicBool,
    connect_cycle: AtomicU64,
    expiration: Mutex<Option<Expiration>>,
    subscriptions: Mutex<BTreeSet<ChannelId>>,
    lazy_tasks: CancellationToken,
    pending_lazy: AtomicUsize,
    created_at: Instant,
}

impl ServerSession {
    /// New session that expires after `grace` unless it connects.
    pub fn new(id: ClientId, lazy: Arc<LazyMessageScheduler>, grace: Duration) -> Self {
        let now = Instant::now();
        Self {
            id,
            queue: SessionQueue::new(),
            lazy,
            scheduler: Mutex::new(None),
            connected: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            connect_cycle: AtomicU64::new(0),
            expiration: Mutex::new(Some(Expiration {
                deadline: now + grace,
                cycle: 0,
            })),
            subscriptions: Mutex::new(BTreeSet::new()),
            lazy_tasks: CancellationToken::new(),
            pending_lazy: AtomicUsize::new(0),
            created_at: now,
        }
    }

    /// The session id.
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Messages waiting for the next response.
    pub fn queue(&self) -> &SessionQueue {
        &self.queue
    }

    /// When the handshake happened.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Deliver `message` to this session only.
    ///
    /// Immediate unless the message itself is flagged lazy, in which case
    /// the global lazy delay applies.
    pub fn deliver(self: &Arc<Self>, message: Message) {
        let delay = self.lazy.direct_delay(&message);
        self.lazy.schedule(self, Arc::new(message), delay);
    }

    /// Queue `message` and resume a suspended connect, if any.
    pub fn enqueue_and_wake(&self, message: Arc<Message>) {
        if self.is_removed() {
            trace!(session_id = %self.id, "dropping message for removed session");
            return;
        }
        self.queue.push(message);
        let _ = self.wake();
    }

    /// Resume the suspended connect. Returns `true` if one was resumed.
    pub fn wake(&self) -> bool {
        let scheduler = self.scheduler.lock().clone();
        scheduler.is_some_and(|s| s.wake())
    }

    /// Install the scheduler of a newly suspended connect.
    ///
    /// A still-armed previous scheduler is cancelled first. If messages
    /// arrived while the connect was being processed it is woken at once.
    pub fn suspend(&self, scheduler: Arc<dyn Scheduler>) {
        let previous = self.scheduler.lock().replace(Arc::clone(&scheduler));
        if let Some(previous) = previous {
            if previous.cancel() {
                debug!(session_id = %self.id, "previous meta/connect superseded");
            }
        }
        if self.is_removed() {
            let _ = scheduler.cancel();
        } else if !self.queue.is_empty() {
            let _ = scheduler.wake();
        }
    }

    /// Resolve the suspended connect, if any, as superseded.
    ///
    /// Returns `true` if a still-armed connect was cancelled.
    pub fn cancel_suspended(&self) -> bool {
        let previous = self.scheduler.lock().take();
        let cancelled = previous.is_some_and(|s| s.cancel());
        if cancelled {
            debug!(session_id = %self.id, "previous meta/connect superseded");
        }
        cancelled
    }

    /// Whether a connect is suspended right now.
    pub fn has_armed_scheduler(&self) -> bool {
        self.scheduler.lock().as_ref().is_some_and(|s| !s.is_fired())
    }

    /// Start a new meta/connect cycle. Pending expiration is cancelled.
    pub fn begin_connect(&self) -> u64 {
        let cycle = self.connect_cycle.fetch_add(1, Ordering::AcqRel) + 1;
        *self.expiration.lock() = None;
        cycle
    }

    /// Current meta/connect cycle.
    pub fn connect_cycle(&self) -> u64 {
        self.connect_cycle.load(Ordering::Acquire)
    }

    /// Mark connected. Returns whether it already was.
    pub fn mark_connected(&self) -> bool {
        self.connected.swap(true, Ordering::AcqRel)
    }

    /// Whether a connect has been answered.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Arm expiration `grace` from now, unless a newer cycle started.
    pub fn schedule_expiration(&self, cycle: u64, grace: Duration) {
        let mut expiration = self.expiration.lock();
        if self.connect_cycle() != cycle {
            trace!(session_id = %self.id, cycle, "stale expiration ignored");
            return;
        }
        *expiration = Some(Expiration {
            deadline: Instant::now() + grace,
            cycle,
        });
    }

    /// Current expiration deadline.
    pub fn expiration_deadline(&self) -> Option<Instant> {
        self.expiration.lock().map(|e| e.deadline)
    }

    /// Whether the sweeper may reclaim this session at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        let expired = self
            .expiration
            .lock()
            .is_some_and(|e| e.deadline <= now && e.cycle == self.connect_cycle());
        expired && !self.has_armed_scheduler()
    }

    pub(crate) fn add_subscription(&self, channel: ChannelId) -> bool {
        self.subscriptions.lock().insert(channel)
    }

    pub(crate) fn remove_subscription(&self, channel: &ChannelId) -> bool {
        self.subscriptions.lock().remove(channel)
    }

    /// Channels this session subscribed to.
    pub fn subscriptions(&self) -> Vec<ChannelId> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    /// Token cancelled when the session goes away.
    pub fn lazy_cancel_token(&self) -> CancellationToken {
        self.lazy_tasks.clone()
    }

    /// Delayed deliveries not yet fired.
    pub fn pending_lazy(&self) -> usize {
        self.pending_lazy.load(Ordering::Acquire)
    }

    pub(crate) fn lazy_task_started(&self) {
        let _ = self.pending_lazy.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn lazy_task_finished(&self) {
        let _ = self.pending_lazy.fetch_sub(1, Ordering::AcqRel);
    }

    /// Whether the session was torn down.
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Cancel delayed deliveries and the suspended connect, drop the queue.
    pub(crate) fn teardown(&self) {
        if self.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.lazy_tasks.cancel();
        let scheduler = self.scheduler.lock().take();
        if let Some(scheduler) = scheduler {
            let _ = scheduler.cancel();
        }
        self.queue.clear();
        self.connected.store(false, Ordering::Release);
        self.subscriptions.lock().clear();
    }
}

/// Arms a session's expiration once a response has been written.
///
/// Dropping it arms too, so an exchange abandoned by its client still leaves
/// the session eligible for sweeping.
#[derive(Debug)]
pub struct ExpirationArm {
    session: Arc<ServerSession>,
    cycle: u64,
    grace: Duration,
}

impl ExpirationArm {
    /// Arm for `cycle` with `grace`.
    pub fn new(session: Arc<ServerSession>, cycle: u64, grace: Duration) -> Self {
        Self {
            session,
            cycle,
            grace,
        }
    }

    /// Arm now.
    pub fn arm(self) {
        drop(self);
    }
}

impl Drop for ExpirationArm {
    fn drop(&mut self) {
        self.session.schedule_expiration(self.cycle, self.grace);
    }
}

/// Live sessions by id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<ClientId, Arc<ServerSession>>,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session.
    pub fn insert(&self, session: Arc<ServerSession>) {
        let _ = self.sessions.insert(session.id().clone(), session);
    }

    /// Look up a session.
    pub fn get(&self, id: &ClientId) -> Option<Arc<ServerSession>> {
        self.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    /// Unregister a session. Teardown is the caller's job.
    pub fn remove(&self, id: &ClientId) -> Option<Arc<ServerSession>> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    /// Sessions the sweeper may reclaim at `now`.
    pub fn expired(&self, now: Instant) -> Vec<ClientId> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// All sessions.
    pub fn all(&self) -> Vec<Arc<ServerSession>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Live session count.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
