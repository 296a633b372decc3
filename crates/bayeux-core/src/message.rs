//! Protocol messages.
//!
//! One [`Message`] type is used for inbound requests, outbound replies and
//! published application data. Fields the server does not interpret are kept
//! in [`Message::other`] and written back out unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::channel::{ChannelId, META_CONNECT, META_HANDSHAKE};
use crate::errors::{ChannelNameError, ProtocolError};
use crate::ids::ClientId;

/// What a client should do after receiving a reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reconnect {
    /// Issue another `/meta/connect`.
    Retry,
    /// Start over with `/meta/handshake`.
    Handshake,
    /// Stop.
    None,
}

/// Connection advice attached to handshake and connect replies.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Advice {
    /// Reconnect policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<Reconnect>,
    /// Milliseconds the client waits before the next connect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    /// Milliseconds the server may hold a connect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl Advice {
    /// `{"reconnect":"retry","interval":..,"timeout":..}`
    pub fn retry(interval_ms: u64, timeout_ms: u64) -> Self {
        Self {
            reconnect: Some(Reconnect::Retry),
            interval: Some(interval_ms),
            timeout: Some(timeout_ms),
        }
    }

    /// `{"reconnect":"handshake","interval":0}`
    pub fn handshake() -> Self {
        Self {
            reconnect: Some(Reconnect::Handshake),
            interval: Some(0),
            timeout: None,
        }
    }
}

/// A protocol message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Target channel name, kept raw so invalid names can be answered.
    pub channel: String,
    /// Correlation id, echoed back on replies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// Session the message belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    /// Application payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Outcome of a meta request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,
    /// Protocol error string, see [`ProtocolError`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Channel named by subscribe/unsubscribe.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
    /// Transport requested by a connect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
    /// Connection advice.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advice: Option<Advice>,
    /// Extension fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<Map<String, Value>>,
    /// Everything else.
    #[serde(flatten)]
    pub other: Map<String, Value>,
    /// Delivery may be deferred by the lazy scheduler. Never serialized.
    #[serde(skip)]
    pub lazy: bool,
}

impl Message {
    /// Empty message on `channel`.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..Self::default()
        }
    }

    /// Application data message.
    pub fn publish(channel: impl Into<String>, data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::new(channel)
        }
    }

    /// Reply skeleton for `request`: same channel and id.
    pub fn reply_to(request: &Message) -> Self {
        Self {
            id: request.id.clone(),
            ..Self::new(request.channel.clone())
        }
    }

    /// Parse the channel name.
    pub fn channel_id(&self) -> Result<ChannelId, ChannelNameError> {
        ChannelId::new(self.channel.as_str())
    }

    /// Whether this is on `/meta/connect`.
    pub fn is_meta_connect(&self) -> bool {
        self.channel == META_CONNECT
    }

    /// Whether this is on `/meta/handshake`.
    pub fn is_handshake(&self) -> bool {
        self.channel == META_HANDSHAKE
    }

    /// Whether this is on any `/meta/` channel.
    pub fn is_meta(&self) -> bool {
        self.channel.starts_with("/meta/")
    }

    /// Mark a reply successful.
    pub fn succeed(&mut self) {
        self.successful = Some(true);
        self.error = None;
    }

    /// Mark a reply failed with a protocol error.
    pub fn fail(&mut self, error: ProtocolError, args: &str) {
        self.successful = Some(false);
        self.error = Some(error.render(args));
    }

    /// Set an extra top-level field.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let _ = self.other.insert(key.into(), value.into());
    }

    /// Read an extra top-level field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.other.get(key)
    }

    /// Timeout the client asked for in its connect advice.
    pub fn advised_timeout(&self) -> Option<u64> {
        self.advice.as_ref().and_then(|a| a.timeout)
    }

    /// Serialize to JSON bytes.
    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Parse a request body: either one message object or an array of them.
    pub fn parse_batch(json: &str) -> serde_json::Result<Vec<Message>> {
        Self::parse_batch_value(serde_json::from_str(json)?)
    }

    /// Same as [`Message::parse_batch`] from an already decoded value.
    pub fn parse_batch_value(value: Value) -> serde_json::Result<Vec<Message>> {
        match value {
            Value::Array(items) => items.into_iter().map(serde_json::from_value).collect(),
            other => Ok(vec![serde_json::from_value(other)?]),
        }
    }
}
