//! One request/response exchange.

use std::sync::Arc;
use std::time::Duration;

use bayeux_core::Message;
use bayeux_settings::TransportSettings;
use metrics::{counter, histogram};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ExchangeError;
use crate::long_poll::{Resume, Resumed, SchedulerFactory};
use crate::metrics::{EXCHANGE_DURATION_SECONDS, MESSAGES_WRITTEN_TOTAL, RESPONSES_TOTAL};
use crate::session::{ExpirationArm, ServerSession};
use crate::transport::writer::ResponseWriter;

/// Transport an exchange arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    /// `POST /cometd`.
    LongPolling,
    /// A frame on `/cometd/ws`.
    WebSocket,
}

impl TransportKind {
    /// Label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LongPolling => "long-polling",
            Self::WebSocket => "websocket",
        }
    }
}

/// Per-exchange values threaded through processing and writing.
#[derive(Clone, Debug)]
pub struct ExchangeContext {
    id: u64,
    transport: TransportKind,
    started_at: Instant,
}

impl ExchangeContext {
    /// Context for exchange `id`, started now.
    pub fn new(id: u64, transport: TransportKind) -> Self {
        Self {
            id,
            transport,
            started_at: Instant::now(),
        }
    }

    /// Exchange id, unique per broker.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Transport.
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// When the exchange started.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }
}

#[derive(Debug)]
struct PendingConnect {
    reply: Message,
    index: usize,
    timeout: Duration,
}

/// Replies and delivery state collected while processing one batch.
#[derive(Debug)]
pub struct Exchange {
    ctx: ExchangeContext,
    replies: Vec<Message>,
    session: Option<Arc<ServerSession>>,
    pending_connect: Option<PendingConnect>,
    expiration: Option<ExpirationArm>,
    deliver_queued: bool,
}

impl Exchange {
    /// Empty exchange.
    pub fn new(ctx: ExchangeContext) -> Self {
        Self {
            ctx,
            replies: Vec::new(),
            session: None,
            pending_connect: None,
            expiration: None,
            deliver_queued: false,
        }
    }

    /// The exchange context.
    pub fn ctx(&self) -> &ExchangeContext {
        &self.ctx
    }

    /// Replies so far, in request order.
    pub fn replies(&self) -> &[Message] {
        &self.replies
    }

    /// Session the queued messages are drained from.
    pub fn session(&self) -> Option<&Arc<ServerSession>> {
        self.session.as_ref()
    }

    /// Whether queued messages go into this response.
    pub fn delivers_queued(&self) -> bool {
        self.deliver_queued
    }

    /// Append a reply.
    pub fn push_reply(&mut self, reply: Message) {
        self.replies.push(reply);
    }

    /// Bind the session of this batch. The first session wins.
    pub fn attach_session(&mut self, session: &Arc<ServerSession>, deliver_queued: bool) {
        match &self.session {
            Some(existing) if existing.id() != session.id() => return,
            Some(_) => {}
            None => self.session = Some(Arc::clone(session)),
        }
        self.deliver_queued |= deliver_queued;
    }

    /// Arm the session's expiration once the response is out, or when the
    /// exchange is dropped.
    pub fn track_expiration(&mut self, expiration: ExpirationArm) {
        self.expiration = Some(expiration);
    }

    /// Whether a connect reply is being held.
    pub fn has_pending_connect(&self) -> bool {
        self.pending_connect.is_some()
    }

    /// Hold `reply` until the session has something to deliver or
    /// `timeout` elapses.
    pub fn defer_connect(&mut self, reply: Message, timeout: Duration) {
        self.pending_connect = Some(PendingConnect {
            index: self.replies.len(),
            reply,
            timeout,
        });
    }

    /// Suspend on the held connect, if any, and put its reply back in place
    /// once resumed.
    ///
    /// Returns `None` when nothing was held.
    pub async fn resume(
        &mut self,
        factory: &dyn SchedulerFactory,
    ) -> Result<Option<Resume>, ExchangeError> {
        let Some(pending) = self.pending_connect.take() else {
            return Ok(None);
        };
        let Some(session) = self.session.clone() else {
            self.replies.insert(pending.index.min(self.replies.len()), pending.reply);
            return Ok(None);
        };

        let (tx, rx) = oneshot::channel();
        let scheduler = factory.new_scheduler(&self.ctx, tx, pending.reply, pending.timeout);
        session.suspend(scheduler);

        match rx.await {
            Ok(Resumed {
                reply,
                outcome: outcome @ (Resume::Timeout | Resume::Woken),
            }) => {
                self.replies.insert(pending.index.min(self.replies.len()), reply);
                Ok(Some(outcome))
            }
            Ok(Resumed {
                outcome: Resume::Cancelled,
                ..
            })
            | Err(_) => {
                debug!(exchange = self.ctx.id(), session_id = %session.id(), "meta/connect superseded");
                Err(ExchangeError::Superseded)
            }
        }
    }

    /// Move a held connect into its own exchange so the other replies can be
    /// sent right away. The returned exchange carries the session, the
    /// expiration tracking and queued delivery.
    pub fn split_pending_connect(&mut self) -> Option<Exchange> {
        let mut pending = self.pending_connect.take()?;
        pending.index = 0;
        let deferred = Exchange {
            ctx: self.ctx.clone(),
            replies: Vec::new(),
            session: self.session.clone(),
            pending_connect: Some(pending),
            expiration: self.expiration.take(),
            deliver_queued: true,
        };
        self.deliver_queued = false;
        Some(deferred)
    }

    /// Snapshot the session queue and build the response writer.
    ///
    /// Messages queued after this call go to a later response.
    pub fn into_writer(self, settings: &TransportSettings) -> ResponseWriter {
        let messages = match (&self.session, self.deliver_queued) {
            (Some(session), true) => session.queue().drain(),
            _ => Vec::new(),
        };
        let ctx = self.ctx;
        ResponseWriter::new(messages, self.replies)
            .with_handshake_delivery(settings.allow_message_delivery_during_handshake)
            .with_expiration(self.expiration)
            .on_complete(move |summary| {
                let transport = ctx.transport().as_str();
                counter!(RESPONSES_TOTAL, "transport" => transport).increment(1);
                counter!(MESSAGES_WRITTEN_TOTAL, "transport" => transport)
                    .increment(summary.messages as u64);
                histogram!(EXCHANGE_DURATION_SECONDS, "transport" => transport)
                    .record(ctx.started_at().elapsed().as_secs_f64());
                debug!(
                    exchange = ctx.id(),
                    messages = summary.messages,
                    replies = summary.replies,
                    bytes = summary.bytes,
                    "response written"
                );
            })
    }
}
