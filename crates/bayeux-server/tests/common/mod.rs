//! Shared helpers: boot a server on an ephemeral port and speak Bayeux to it.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bayeux_core::ChannelId;
use bayeux_server::{BayeuxServer, Broker, ShutdownCoordinator};
use bayeux_settings::{BayeuxSettings, TransportSettings};
use serde_json::{Value, json};
use tokio::net::TcpListener;

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub struct TestServer {
    pub addr: std::net::SocketAddr,
    pub broker: Arc<Broker>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub client: reqwest::Client,
}

impl TestServer {
    pub async fn boot(transport: TransportSettings) -> Self {
        let settings = BayeuxSettings {
            transport,
            ..BayeuxSettings::default()
        };
        let server = BayeuxServer::new(settings);
        let broker = Arc::clone(server.broker());
        let shutdown = Arc::clone(server.shutdown());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(tokio::spawn(server.serve(listener)));
        Self {
            addr,
            broker,
            shutdown,
            client: reqwest::Client::new(),
        }
    }

    pub fn cometd_url(&self) -> String {
        format!("http://{}/cometd", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/cometd/ws", self.addr)
    }

    /// POST a batch, returning status and the reply array.
    pub async fn post_raw(&self, batch: &Value) -> (reqwest::StatusCode, Vec<Value>) {
        let resp = tokio::time::timeout(
            TIMEOUT,
            self.client.post(self.cometd_url()).json(batch).send(),
        )
        .await
        .expect("request timed out")
        .unwrap();
        let status = resp.status();
        let body = resp.bytes().await.unwrap();
        let replies = serde_json::from_slice(&body).unwrap_or_default();
        (status, replies)
    }

    pub async fn post(&self, batch: Value) -> Vec<Value> {
        let (status, replies) = self.post_raw(&batch).await;
        assert_eq!(status, reqwest::StatusCode::OK);
        replies
    }

    pub async fn handshake(&self) -> String {
        let replies = self
            .post(json!([{
                "channel": "/meta/handshake",
                "version": "1.0",
                "supportedConnectionTypes": ["long-polling"],
            }]))
            .await;
        assert_eq!(replies[0]["successful"], true);
        replies[0]["clientId"].as_str().unwrap().to_string()
    }

    pub async fn subscribe(&self, client_id: &str, channel: &str) {
        let replies = self
            .post(json!([{
                "channel": "/meta/subscribe",
                "clientId": client_id,
                "subscription": channel,
            }]))
            .await;
        let reply = replies
            .iter()
            .find(|r| r["channel"] == "/meta/subscribe")
            .unwrap();
        assert_eq!(reply["successful"], true, "{reply}");
    }

    pub async fn connect(&self, client_id: &str) -> Vec<Value> {
        self.post(connect_message(client_id)).await
    }

    /// Handshake, subscribe to `channels` and burn the first (immediate) connect.
    pub async fn connected_client(&self, channels: &[&str]) -> String {
        let client_id = self.handshake().await;
        for channel in channels {
            self.subscribe(&client_id, channel).await;
        }
        let replies = self.connect(&client_id).await;
        assert_eq!(replies.last().unwrap()["successful"], true);
        client_id
    }

    /// Make `name` lazy, optionally with its own timeout.
    pub fn lazy_channel(&self, name: &str, timeout: Option<Duration>) {
        let id = ChannelId::new(name).unwrap();
        let _ = self.broker.channels().create_if_absent(&id, |channel| {
            channel.set_persistent(true);
            channel.set_lazy(true);
            channel.set_lazy_timeout(timeout);
        });
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

pub fn connect_message(client_id: &str) -> Value {
    json!([{
        "channel": "/meta/connect",
        "clientId": client_id,
        "connectionType": "long-polling",
    }])
}

/// Settings with a long hold and the given global lazy delay.
pub fn transport(max_lazy_timeout_ms: u64) -> TransportSettings {
    TransportSettings {
        timeout_ms: 8_000,
        max_lazy_timeout_ms,
        ..TransportSettings::default()
    }
}

/// Published messages (non-meta) in a reply array.
pub fn deliveries(replies: &[Value]) -> Vec<&Value> {
    replies
        .iter()
        .filter(|r| !r["channel"].as_str().unwrap_or_default().starts_with("/meta/"))
        .collect()
}
