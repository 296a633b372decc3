//! Suspend/resume of a held `/meta/connect`.
//!
//! A suspended connect is resolved exactly once, by whichever comes first:
//! the deadline timer, an external wake (a message became available) or a
//! cancellation (a newer connect or session teardown). Firing only hands the
//! connect reply back through a oneshot channel; the response itself is
//! written later by the transport.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bayeux_core::Message;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::metrics::{LONG_POLL_RESUMES_TOTAL, LONG_POLLS_SUSPENDED};
use crate::transport::exchange::ExchangeContext;

/// How a suspended connect was resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resume {
    /// The deadline elapsed.
    Timeout,
    /// Something became deliverable.
    Woken,
    /// Superseded or torn down. The reply is not sent.
    Cancelled,
}

impl Resume {
    /// Label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Woken => "woken",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Sent to the waiting exchange when its scheduler fires.
#[derive(Debug)]
pub struct Resumed {
    /// The held connect reply.
    pub reply: Message,
    /// What fired.
    pub outcome: Resume,
}

/// Handle to one suspended exchange.
pub trait Scheduler: Send + Sync + fmt::Debug {
    /// Resume now because something is deliverable.
    ///
    /// Returns `true` if this call fired the scheduler.
    fn wake(&self) -> bool;

    /// Resolve as superseded. No-op once fired.
    ///
    /// Returns `true` if this call fired the scheduler.
    fn cancel(&self) -> bool;

    /// Whether the scheduler already fired.
    fn is_fired(&self) -> bool;
}

/// Builds schedulers for suspended connects.
///
/// Transports hold one of these so tests and embedders can swap the
/// suspension strategy.
pub trait SchedulerFactory: Send + Sync {
    /// Suspend `reply` for at most `timeout`, resolving through `resume`.
    fn new_scheduler(
        &self,
        ctx: &ExchangeContext,
        resume: oneshot::Sender<Resumed>,
        reply: Message,
        timeout: Duration,
    ) -> Arc<dyn Scheduler>;
}

/// Default factory producing [`LongPollScheduler`]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct LongPollSchedulerFactory;

impl SchedulerFactory for LongPollSchedulerFactory {
    fn new_scheduler(
        &self,
        ctx: &ExchangeContext,
        resume: oneshot::Sender<Resumed>,
        reply: Message,
        timeout: Duration,
    ) -> Arc<dyn Scheduler> {
        LongPollScheduler::schedule(ctx, resume, reply, timeout)
    }
}

/// Timer-backed [`Scheduler`].
pub struct LongPollScheduler {
    exchange_id: u64,
    fired: AtomicBool,
    pending: Mutex<Option<(oneshot::Sender<Resumed>, Message)>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for LongPollScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LongPollScheduler")
            .field("exchange_id", &self.exchange_id)
            .field("fired", &self.is_fired())
            .finish_non_exhaustive()
    }
}

impl LongPollScheduler {
    /// Arm a scheduler whose deadline is `timeout` from now.
    pub fn schedule(
        ctx: &ExchangeContext,
        resume: oneshot::Sender<Resumed>,
        reply: Message,
        timeout: Duration,
    ) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            exchange_id: ctx.id(),
            fired: AtomicBool::new(false),
            pending: Mutex::new(Some((resume, reply))),
            timer: Mutex::new(None),
        });
        gauge!(LONG_POLLS_SUSPENDED).increment(1.0);
        debug!(exchange = ctx.id(), ?timeout, "meta/connect suspended");

        let timer = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = scheduler.fire(Resume::Timeout);
            })
        };
        *scheduler.timer.lock() = Some(timer);
        scheduler
    }

    fn fire(&self, outcome: Resume) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            trace!(exchange = self.exchange_id, outcome = outcome.as_str(), "already fired");
            return false;
        }
        let timer = self.timer.lock().take();
        if outcome != Resume::Timeout {
            if let Some(timer) = timer {
                timer.abort();
            }
        }
        gauge!(LONG_POLLS_SUSPENDED).decrement(1.0);
        counter!(LONG_POLL_RESUMES_TOTAL, "outcome" => outcome.as_str()).increment(1);

        if let Some((resume, reply)) = self.pending.lock().take() {
            if resume.send(Resumed { reply, outcome }).is_err() {
                debug!(exchange = self.exchange_id, "exchange gone before resume");
            }
        }
        debug!(exchange = self.exchange_id, outcome = outcome.as_str(), "meta/connect resumed");
        true
    }
}

impl Scheduler for LongPollScheduler {
    fn wake(&self) -> bool {
        self.fire(Resume::Woken)
    }

    fn cancel(&self) -> bool {
        self.fire(Resume::Cancelled)
    }

    fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}
