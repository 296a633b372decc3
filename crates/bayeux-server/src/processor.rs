//! Meta channel handling and client publishes.

use std::sync::Arc;
use std::time::Duration;

use bayeux_core::channel::{
    META_CONNECT, META_DISCONNECT, META_HANDSHAKE, META_SUBSCRIBE, META_UNSUBSCRIBE,
};
use bayeux_core::{Advice, ChannelId, Message, ProtocolError};
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::broker::Broker;
use crate::error::ExchangeError;
use crate::session::{ExpirationArm, ServerSession};
use crate::transport::exchange::Exchange;

/// Protocol version announced in handshake replies.
pub const BAYEUX_VERSION: &str = "1.0";

/// Connection types a client may pick.
pub const SUPPORTED_CONNECTION_TYPES: [&str; 2] = ["long-polling", "websocket"];

/// Turns a batch of inbound messages into replies on an [`Exchange`].
#[derive(Debug, Clone)]
pub struct Processor {
    broker: Arc<Broker>,
}

impl Processor {
    /// Processor over `broker`.
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    /// The broker.
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Process `batch` in request order.
    #[instrument(skip_all, fields(exchange = exchange.ctx().id(), messages = batch.len()))]
    pub fn process(&self, exchange: &mut Exchange, batch: Vec<Message>) {
        for message in batch {
            match message.channel.as_str() {
                META_HANDSHAKE => self.handshake(exchange, &message),
                META_CONNECT => self.connect(exchange, &message),
                META_SUBSCRIBE => self.subscribe(exchange, &message),
                META_UNSUBSCRIBE => self.unsubscribe(exchange, &message),
                META_DISCONNECT => self.disconnect(exchange, &message),
                _ if message.is_meta() => {
                    let mut reply = Message::reply_to(&message);
                    reply.fail(ProtocolError::BadRequest, &message.channel);
                    exchange.push_reply(reply);
                }
                _ => self.publish(exchange, message),
            }
        }
    }

    /// Process `batch` on its own task so a panic fails only this exchange.
    pub async fn process_isolated(
        self: &Arc<Self>,
        mut exchange: Exchange,
        batch: Vec<Message>,
    ) -> Result<Exchange, ExchangeError> {
        let processor = Arc::clone(self);
        let exchange = tokio::spawn(async move {
            processor.process(&mut exchange, batch);
            exchange
        })
        .await?;
        Ok(exchange)
    }

    fn known_session(&self, message: &Message) -> Option<Arc<ServerSession>> {
        message
            .client_id
            .as_ref()
            .and_then(|id| self.broker.session(id))
    }

    fn unknown_client(exchange: &mut Exchange, message: &Message) {
        let mut reply = Message::reply_to(message);
        reply.client_id.clone_from(&message.client_id);
        reply.fail(ProtocolError::UnknownClient, "");
        reply.advice = Some(Advice::handshake());
        debug!(channel = %message.channel, "unknown client");
        exchange.push_reply(reply);
    }

    fn retry_advice(&self) -> Advice {
        let settings = self.broker.settings();
        Advice::retry(settings.interval_ms, settings.timeout_ms)
    }

    fn handshake(&self, exchange: &mut Exchange, message: &Message) {
        let session = self.broker.create_session();
        let mut reply = Message::reply_to(message);
        reply.client_id = Some(session.id().clone());
        reply.succeed();
        reply.put("version", BAYEUX_VERSION);
        reply.put("supportedConnectionTypes", json!(SUPPORTED_CONNECTION_TYPES));
        reply.advice = Some(self.retry_advice());
        exchange.attach_session(
            &session,
            self.broker.settings().allow_message_delivery_during_handshake,
        );
        exchange.push_reply(reply);
    }

    fn connect(&self, exchange: &mut Exchange, message: &Message) {
        let Some(session) = self.known_session(message) else {
            Self::unknown_client(exchange, message);
            return;
        };
        let cycle = session.begin_connect();
        let _ = session.cancel_suspended();
        let was_connected = session.mark_connected();
        exchange.attach_session(&session, true);
        exchange.track_expiration(ExpirationArm::new(
            Arc::clone(&session),
            cycle,
            self.broker.settings().expiration_grace(),
        ));

        let mut reply = Message::reply_to(message);
        reply.client_id = Some(session.id().clone());
        reply.succeed();
        reply.advice = Some(self.retry_advice());

        let configured = self.broker.settings().timeout();
        let timeout = message
            .advised_timeout()
            .map_or(configured, |ms| configured.min(Duration::from_millis(ms)));
        let hold = was_connected
            && !timeout.is_zero()
            && session.queue().is_empty()
            && !exchange.has_pending_connect();
        if hold {
            exchange.defer_connect(reply, timeout);
        } else {
            exchange.push_reply(reply);
        }
    }

    fn subscribe(&self, exchange: &mut Exchange, message: &Message) {
        self.subscription(exchange, message, true);
    }

    fn unsubscribe(&self, exchange: &mut Exchange, message: &Message) {
        self.subscription(exchange, message, false);
    }

    fn subscription(&self, exchange: &mut Exchange, message: &Message, subscribe: bool) {
        let Some(session) = self.known_session(message) else {
            Self::unknown_client(exchange, message);
            return;
        };
        exchange.attach_session(&session, self.delivers_on_any_request());

        let mut reply = Message::reply_to(message);
        reply.client_id = Some(session.id().clone());
        reply.subscription.clone_from(&message.subscription);
        match message.subscription.as_deref().map(ChannelId::new) {
            None => reply.fail(ProtocolError::MissingSubscription, ""),
            Some(Err(err)) => {
                debug!(error = %err, "bad subscription");
                reply.fail(
                    ProtocolError::InvalidChannel,
                    message.subscription.as_deref().unwrap_or_default(),
                );
            }
            Some(Ok(channel)) if channel.is_meta() => {
                reply.fail(ProtocolError::Forbidden, channel.as_str());
            }
            Some(Ok(channel)) => {
                if subscribe {
                    let _ = self.broker.subscribe(&session, &channel);
                } else {
                    let _ = self.broker.unsubscribe(&session, &channel);
                }
                reply.succeed();
            }
        }
        exchange.push_reply(reply);
    }

    fn disconnect(&self, exchange: &mut Exchange, message: &Message) {
        let Some(session) = self.known_session(message) else {
            Self::unknown_client(exchange, message);
            return;
        };
        let _ = self.broker.remove_session(session.id(), "disconnect");
        let mut reply = Message::reply_to(message);
        reply.client_id = Some(session.id().clone());
        reply.succeed();
        exchange.push_reply(reply);
    }

    fn publish(&self, exchange: &mut Exchange, message: Message) {
        let Some(session) = self.known_session(&message) else {
            Self::unknown_client(exchange, &message);
            return;
        };
        exchange.attach_session(&session, self.delivers_on_any_request());

        let mut reply = Message::reply_to(&message);
        let mut outbound = Message::publish(
            message.channel.clone(),
            message.data.unwrap_or(Value::Null),
        );
        outbound.id = message.id;
        outbound.ext = message.ext;
        match self.broker.publish(Some(&session), outbound) {
            Ok(_) => reply.succeed(),
            Err(err) => {
                warn!(session_id = %session.id(), error = %err, "publish refused");
                reply.fail(ProtocolError::InvalidChannel, &message.channel);
            }
        }
        exchange.push_reply(reply);
    }

    fn delivers_on_any_request(&self) -> bool {
        !self.broker.settings().meta_connect_delivery_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::long_poll::{LongPollSchedulerFactory, Resume};
    use crate::transport::exchange::{ExchangeContext, TransportKind};
    use bayeux_core::{ClientId, Reconnect};
    use bayeux_settings::TransportSettings;

    fn processor_with(settings: TransportSettings) -> Processor {
        Processor::new(Arc::new(Broker::new(settings)))
    }

    fn processor() -> Processor {
        processor_with(TransportSettings::default())
    }

    fn run(processor: &Processor, batch: Vec<Message>) -> Exchange {
        let mut exchange = Exchange::new(ExchangeContext::new(1, TransportKind::LongPolling));
        processor.process(&mut exchange, batch);
        exchange
    }

    fn request(channel: &str, client: Option<&ClientId>) -> Message {
        let mut m = Message::new(channel);
        m.client_id = client.cloned();
        m.id = Some(json!("1"));
        m
    }

    fn handshake(processor: &Processor) -> ClientId {
        let ex = run(processor, vec![request(META_HANDSHAKE, None)]);
        ex.replies()[0].client_id.clone().unwrap()
    }

    #[test]
    fn handshake_creates_session() {
        let p = processor();
        let ex = run(&p, vec![request(META_HANDSHAKE, None)]);
        let reply = &ex.replies()[0];
        assert_eq!(reply.successful, Some(true));
        assert_eq!(reply.id, Some(json!("1")));
        assert_eq!(reply.get("version"), Some(&json!("1.0")));
        assert_eq!(
            reply.get("supportedConnectionTypes"),
            Some(&json!(["long-polling", "websocket"]))
        );
        assert_eq!(reply.advice.as_ref().unwrap().reconnect, Some(Reconnect::Retry));
        assert!(p.broker().session(reply.client_id.as_ref().unwrap()).is_some());
        assert!(!ex.delivers_queued());
    }

    #[test]
    fn unknown_client_is_told_to_handshake() {
        let p = processor();
        let ghost = ClientId::from_raw("ghost");
        for channel in [META_CONNECT, META_SUBSCRIBE, META_DISCONNECT, "/chat"] {
            let ex = run(&p, vec![request(channel, Some(&ghost))]);
            let reply = &ex.replies()[0];
            assert_eq!(reply.successful, Some(false), "{channel}");
            assert_eq!(reply.error.as_deref(), Some("402::Unknown client"));
            assert_eq!(reply.advice, Some(Advice::handshake()));
        }
    }

    #[tokio::test]
    async fn first_connect_replies_immediately() {
        let p = processor();
        let id = handshake(&p);
        let ex = run(&p, vec![request(META_CONNECT, Some(&id))]);
        assert!(!ex.has_pending_connect());
        assert_eq!(ex.replies()[0].successful, Some(true));
        assert!(ex.delivers_queued());
    }

    #[tokio::test]
    async fn later_connect_is_held() {
        let p = processor();
        let id = handshake(&p);
        let _ = run(&p, vec![request(META_CONNECT, Some(&id))]);
        let ex = run(&p, vec![request(META_CONNECT, Some(&id))]);
        assert!(ex.has_pending_connect());
        assert!(ex.replies().is_empty());
    }

    #[tokio::test]
    async fn queued_messages_or_zero_timeout_skip_the_hold() {
        let p = processor();
        let id = handshake(&p);
        let _ = run(&p, vec![request(META_CONNECT, Some(&id))]);

        let mut zero = request(META_CONNECT, Some(&id));
        zero.advice = Some(Advice {
            timeout: Some(0),
            ..Advice::default()
        });
        assert!(!run(&p, vec![zero]).has_pending_connect());

        let session = p.broker().session(&id).unwrap();
        session.queue().push(Arc::new(Message::publish("/a", json!(1))));
        assert!(!run(&p, vec![request(META_CONNECT, Some(&id))]).has_pending_connect());
    }

    #[tokio::test]
    async fn subscribe_errors() {
        let p = processor();
        let id = handshake(&p);

        let missing = run(&p, vec![request(META_SUBSCRIBE, Some(&id))]);
        assert_eq!(missing.replies()[0].error.as_deref(), Some("403::Missing subscription"));

        let mut bad = request(META_SUBSCRIBE, Some(&id));
        bad.subscription = Some("no-slash".into());
        let bad = run(&p, vec![bad]);
        assert_eq!(bad.replies()[0].error.as_deref(), Some("403:no-slash:Invalid channel"));

        let mut meta = request(META_SUBSCRIBE, Some(&id));
        meta.subscription = Some("/meta/connect".into());
        let meta = run(&p, vec![meta]);
        assert_eq!(meta.replies()[0].error.as_deref(), Some("403:/meta/connect:Forbidden"));
    }

    #[tokio::test]
    async fn subscribe_publish_unsubscribe() {
        let p = processor();
        let id = handshake(&p);
        let mut sub = request(META_SUBSCRIBE, Some(&id));
        sub.subscription = Some("/chat/*".into());
        let ex = run(&p, vec![sub]);
        assert_eq!(ex.replies()[0].successful, Some(true));
        assert_eq!(ex.replies()[0].subscription.as_deref(), Some("/chat/*"));

        let mut publish = request("/chat/room", Some(&id));
        publish.data = Some(json!({"text": "hi"}));
        let ex = run(&p, vec![publish]);
        assert_eq!(ex.replies()[0].successful, Some(true));
        let session = p.broker().session(&id).unwrap();
        let queued = session.queue().drain();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].data, Some(json!({"text": "hi"})));
        assert_eq!(queued[0].id, Some(json!("1")));

        let mut unsub = request(META_UNSUBSCRIBE, Some(&id));
        unsub.subscription = Some("/chat/*".into());
        let _ = run(&p, vec![unsub]);
        assert!(session.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn publishing_to_wildcard_fails() {
        let p = processor();
        let id = handshake(&p);
        let ex = run(&p, vec![request("/chat/*", Some(&id))]);
        assert_eq!(ex.replies()[0].error.as_deref(), Some("403:/chat/*:Invalid channel"));
    }

    #[tokio::test]
    async fn unknown_meta_channel_is_bad_request() {
        let p = processor();
        let ex = run(&p, vec![request("/meta/bogus", None)]);
        assert_eq!(ex.replies()[0].error.as_deref(), Some("400:/meta/bogus:Bad request"));
    }

    #[tokio::test]
    async fn disconnect_removes_session() {
        let p = processor();
        let id = handshake(&p);
        let ex = run(&p, vec![request(META_DISCONNECT, Some(&id))]);
        assert_eq!(ex.replies()[0].successful, Some(true));
        assert!(p.broker().session(&id).is_none());
    }

    #[tokio::test]
    async fn meta_connect_delivery_only_limits_draining() {
        let p = processor_with(TransportSettings {
            meta_connect_delivery_only: true,
            ..TransportSettings::default()
        });
        let id = handshake(&p);
        let mut sub = request(META_SUBSCRIBE, Some(&id));
        sub.subscription = Some("/x".into());
        assert!(!run(&p, vec![sub]).delivers_queued());
        assert!(run(&p, vec![request(META_CONNECT, Some(&id))]).delivers_queued());
    }

    #[tokio::test]
    async fn handshake_delivery_when_allowed() {
        let p = processor_with(TransportSettings {
            allow_message_delivery_during_handshake: true,
            ..TransportSettings::default()
        });
        assert!(run(&p, vec![request(META_HANDSHAKE, None)]).delivers_queued());
    }

    #[tokio::test(start_paused = true)]
    async fn advised_timeout_is_capped() {
        let p = processor_with(TransportSettings {
            timeout_ms: 1_000,
            ..TransportSettings::default()
        });
        let id = handshake(&p);
        let _ = run(&p, vec![request(META_CONNECT, Some(&id))]);
        let mut long = request(META_CONNECT, Some(&id));
        long.advice = Some(Advice {
            timeout: Some(60_000),
            ..Advice::default()
        });
        let mut ex = run(&p, vec![long]);
        let start = tokio::time::Instant::now();
        let outcome = ex.resume(&LongPollSchedulerFactory).await.unwrap();
        assert_eq!(outcome, Some(Resume::Timeout));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(ex.replies()[0].successful, Some(true));
    }

    #[tokio::test]
    async fn isolated_processing_returns_the_exchange() {
        let p = Arc::new(processor());
        let exchange = Exchange::new(ExchangeContext::new(1, TransportKind::LongPolling));
        let ok = p
            .process_isolated(exchange, vec![request(META_HANDSHAKE, None)])
            .await
            .unwrap();
        assert_eq!(ok.replies().len(), 1);
    }
}
