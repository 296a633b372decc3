//! WebSocket transport: `GET /cometd/ws`.
//!
//! Every inbound text (or UTF-8 binary) frame is one message batch. Replies
//! go back as one JSON array frame. A `/meta/connect` that has to wait is
//! split off and answered by its own frame once it resumes, so the socket
//! keeps accepting batches in the meantime.

pub mod connection;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use bayeux_core::{ConnectionId, Message};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::broker::Broker;
use crate::long_poll::SchedulerFactory;
use crate::metrics::{EXCHANGES_TOTAL, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL};
use crate::processor::Processor;
use crate::transport::{bad_request_reply, server_error_reply};
use crate::transport::exchange::{Exchange, ExchangeContext, TransportKind};

pub use connection::WsConnection;

const OUTBOUND_CAPACITY: usize = 256;

/// Runs upgraded sockets.
pub struct WebSocketTransport {
    broker: Arc<Broker>,
    processor: Arc<Processor>,
    scheduler_factory: Arc<dyn SchedulerFactory>,
    heartbeat_interval: Duration,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish_non_exhaustive()
    }
}

impl WebSocketTransport {
    /// Transport pinging every `heartbeat_interval`.
    pub fn new(
        broker: Arc<Broker>,
        processor: Arc<Processor>,
        scheduler_factory: Arc<dyn SchedulerFactory>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            broker,
            processor,
            scheduler_factory,
            heartbeat_interval,
        }
    }

    /// Serve `ws` until the client leaves, stops answering pings or
    /// `shutdown` fires.
    #[instrument(skip_all, fields(connection_id))]
    pub async fn run(self: Arc<Self>, ws: WebSocket, shutdown: CancellationToken) {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
        let closed = shutdown.child_token();
        let connection = Arc::new(WsConnection::new(ConnectionId::new(), tx, closed.clone()));
        let _ = tracing::Span::current().record("connection_id", connection.id().as_str());

        info!("websocket connected");
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

        let outbound = {
            let connection = Arc::clone(&connection);
            let closed = closed.clone();
            let interval = self.heartbeat_interval;
            let pong_timeout = interval * 2;
            tokio::spawn(async move {
                let mut ping = tokio::time::interval(interval);
                let _ = ping.tick().await;
                loop {
                    tokio::select! {
                        () = closed.cancelled() => break,
                        frame = rx.recv() => {
                            let Some(text) = frame else { break };
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        _ = ping.tick() => {
                            if !connection.check_alive() && connection.last_pong_elapsed() > pong_timeout {
                                warn!(timeout = ?pong_timeout, "client unresponsive, closing");
                                break;
                            }
                            if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = ws_tx.close().await;
                closed.cancel();
            })
        };

        loop {
            let frame = tokio::select! {
                () = closed.cancelled() => break,
                frame = ws_rx.next() => frame,
            };
            let Some(Ok(frame)) = frame else { break };
            let text = match frame {
                WsMessage::Text(text) => text.as_str().to_owned(),
                WsMessage::Binary(data) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => text,
                    Err(_) => {
                        debug!(len = data.len(), "ignoring non-UTF-8 binary frame");
                        continue;
                    }
                },
                WsMessage::Ping(_) | WsMessage::Pong(_) => {
                    connection.mark_alive();
                    continue;
                }
                WsMessage::Close(_) => break,
            };
            connection.mark_alive();
            self.handle_frame(&connection, &text).await;
        }

        closed.cancel();
        let _ = outbound.await;
        gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        info!(
            client_id = connection.client_id().as_ref().map(ToString::to_string),
            dropped = connection.drop_count(),
            age = ?connection.age(),
            "websocket disconnected"
        );
    }

    async fn handle_frame(self: &Arc<Self>, connection: &Arc<WsConnection>, text: &str) {
        let ctx = ExchangeContext::new(self.broker.next_exchange_id(), TransportKind::WebSocket);
        let mut exchange = match Message::parse_batch(text) {
            Ok(batch) => match self
                .processor
                .process_isolated(Exchange::new(ctx.clone()), batch)
                .await
            {
                Ok(exchange) => exchange,
                Err(err) => {
                    warn!(error = %err, "websocket batch failed");
                    counter!(EXCHANGES_TOTAL, "outcome" => err.kind()).increment(1);
                    let mut exchange = Exchange::new(ctx);
                    exchange.push_reply(server_error_reply(&err.to_string()));
                    exchange
                }
            },
            Err(err) => {
                let mut exchange = Exchange::new(ctx);
                exchange.push_reply(bad_request_reply(&err.to_string()));
                exchange
            }
        };
        if let Some(session) = exchange.session() {
            connection.bind_client(session.id().clone());
        }

        let deferred = exchange.split_pending_connect();
        if !exchange.replies().is_empty() || exchange.delivers_queued() {
            self.send(connection, exchange).await;
        }

        if let Some(mut deferred) = deferred {
            let this = Arc::clone(self);
            let connection = Arc::clone(connection);
            let closed = connection.closed().clone();
            drop(tokio::spawn(async move {
                let resumed = tokio::select! {
                    () = closed.cancelled() => return,
                    resumed = deferred.resume(this.scheduler_factory.as_ref()) => resumed,
                };
                match resumed {
                    Ok(_) => this.send(&connection, deferred).await,
                    Err(err) => debug!(error = %err, "held connect dropped"),
                }
            }));
        }
    }

    async fn send(&self, connection: &WsConnection, exchange: Exchange) {
        let writer = exchange.into_writer(self.broker.settings());
        match writer.render().await {
            Ok((bytes, _)) => match String::from_utf8(bytes.to_vec()) {
                Ok(frame) => {
                    if !connection.send(frame).await {
                        debug!("socket closed before response was queued");
                    }
                }
                Err(err) => warn!(error = %err, "response is not UTF-8"),
            },
            Err(err) => warn!(error = %err, "failed to render response"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::long_poll::LongPollSchedulerFactory;
    use crate::registry::ServerChannel;
    use crate::session::ServerSession;
    use bayeux_core::{ChannelId, ClientId};
    use bayeux_settings::TransportSettings;
    use serde_json::{Value, json};

    fn transport() -> Arc<WebSocketTransport> {
        let broker = Arc::new(Broker::new(TransportSettings::default()));
        let processor = Arc::new(Processor::new(Arc::clone(&broker)));
        Arc::new(WebSocketTransport::new(
            broker,
            processor,
            Arc::new(LongPollSchedulerFactory),
            Duration::from_secs(30),
        ))
    }

    fn connection(capacity: usize) -> (Arc<WsConnection>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = WsConnection::new(ConnectionId::new(), tx, CancellationToken::new());
        (Arc::new(conn), rx)
    }

    async fn next_batch(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
        serde_json::from_str(&rx.recv().await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn backed_up_socket_keeps_drained_messages() {
        let t = transport();
        let (conn, mut rx) = connection(1);
        assert!(conn.send("[]".into()).await);

        let session = t.broker.create_session();
        session.queue().push(Arc::new(Message::publish("/a", json!(1))));
        let mut exchange = Exchange::new(ExchangeContext::new(1, TransportKind::WebSocket));
        exchange.attach_session(&session, true);

        let sending = {
            let t = Arc::clone(&t);
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { t.send(&conn, exchange).await })
        };
        assert_eq!(rx.recv().await.unwrap(), "[]");
        sending.await.unwrap();

        let batch = next_batch(&mut rx).await;
        assert_eq!(batch[0]["channel"], "/a");
        assert_eq!(batch[0]["data"], 1);
        assert!(session.queue().is_empty());
        assert_eq!(conn.drop_count(), 0);
    }

    #[tokio::test]
    async fn failed_batch_is_answered() {
        let t = transport();
        let (conn, mut rx) = connection(8);

        let handshake = json!([{"channel": "/meta/handshake"}]).to_string();
        t.handle_frame(&conn, &handshake).await;
        let replies = next_batch(&mut rx).await;
        let client_id = replies[0]["clientId"].as_str().unwrap().to_string();
        assert_eq!(conn.client_id(), Some(ClientId::from_raw(client_id.clone())));

        let boom = ChannelId::new("/boom").unwrap();
        let channel = t.broker.channels().create_if_absent(&boom, |_| {}).reference;
        channel.add_listener(Arc::new(
            |_: &ServerChannel, _: Option<&ServerSession>, _: &mut Message| -> bool {
                panic!("listener failed")
            },
        ));

        let publish = json!([{"channel": "/boom", "clientId": client_id, "data": 1}]).to_string();
        t.handle_frame(&conn, &publish).await;
        let replies = next_batch(&mut rx).await;
        assert_eq!(replies[0]["channel"], "/meta/unsuccessful");
        assert_eq!(replies[0]["successful"], false);
        assert_eq!(replies[0]["error"], "500::Server error");
    }

    #[tokio::test]
    async fn superseded_held_connect_is_not_answered() {
        let t = transport();
        let (conn, mut rx) = connection(8);

        t.handle_frame(&conn, &json!([{"channel": "/meta/handshake"}]).to_string())
            .await;
        let client_id = next_batch(&mut rx).await[0]["clientId"]
            .as_str()
            .unwrap()
            .to_string();
        let connect = json!([{"channel": "/meta/connect", "clientId": client_id}]).to_string();
        t.handle_frame(&conn, &connect).await;
        let _ = next_batch(&mut rx).await;

        t.handle_frame(&conn, &connect).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let session = t.broker.session(&ClientId::from_raw(client_id.clone())).unwrap();
        assert!(session.has_armed_scheduler());

        let zero = json!([{
            "channel": "/meta/connect",
            "clientId": client_id,
            "advice": {"timeout": 0},
        }])
        .to_string();
        t.handle_frame(&conn, &zero).await;
        let replies = next_batch(&mut rx).await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["successful"], true);
        assert!(!session.has_armed_scheduler());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }
}
