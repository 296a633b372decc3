//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a settings
//! file may name only the fields it changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 8080 },
///   "transport": { "maxLazyTimeoutMs": 1000 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BayeuxSettings {
    /// Network settings.
    pub server: ServerSettings,
    /// Long-poll, lazy delivery and session expiration settings.
    pub transport: TransportSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl BayeuxSettings {
    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.transport.validate()
    }
}

/// Server network settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port, `0` picks a free one.
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Interval between WebSocket pings in milliseconds.
    pub heartbeat_interval_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_connections: 1024,
            heartbeat_interval_ms: 30_000,
        }
    }
}

/// Transport behaviour shared by the long-polling and WebSocket transports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportSettings {
    /// How long a `/meta/connect` is held when nothing is queued.
    pub timeout_ms: u64,
    /// Advised pause between the end of one connect and the next.
    pub interval_ms: u64,
    /// Grace period after a connect response before the session expires.
    pub max_interval_ms: u64,
    /// Delivery delay for lazy channels without their own timeout.
    pub max_lazy_timeout_ms: u64,
    /// Maximum request body (or WebSocket frame) in bytes, `0` for unlimited.
    pub max_message_size: usize,
    /// HTTP status for a connect superseded by a newer one.
    pub duplicate_meta_connect_status: u16,
    /// Deliver queued messages in the handshake response.
    pub allow_message_delivery_during_handshake: bool,
    /// Deliver queued messages only in `/meta/connect` responses.
    pub meta_connect_delivery_only: bool,
    /// How often expired sessions are swept.
    pub sweep_period_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            interval_ms: 0,
            max_interval_ms: 10_000,
            max_lazy_timeout_ms: 5_000,
            max_message_size: 0,
            duplicate_meta_connect_status: 500,
            allow_message_delivery_during_handshake: false,
            meta_connect_delivery_only: false,
            sweep_period_ms: 997,
        }
    }
}

impl TransportSettings {
    /// Long-poll hold time.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Global lazy delivery delay.
    pub fn max_lazy_timeout(&self) -> Duration {
        Duration::from_millis(self.max_lazy_timeout_ms)
    }

    /// Time a session survives without a connect after its last response.
    pub fn expiration_grace(&self) -> Duration {
        Duration::from_millis(self.interval_ms.saturating_add(self.max_interval_ms))
    }

    /// Sweeper period.
    pub fn sweep_period(&self) -> Duration {
        Duration::from_millis(self.sweep_period_ms)
    }

    /// Body size limit, `None` when unlimited.
    pub fn message_size_limit(&self) -> Option<usize> {
        (self.max_message_size > 0).then_some(self.max_message_size)
    }

    fn validate(&self) -> Result<()> {
        if self.sweep_period_ms == 0 {
            return Err(SettingsError::InvalidValue {
                key: "transport.sweepPeriodMs",
                reason: "must be greater than 0".into(),
            });
        }
        if !(100..=599).contains(&self.duplicate_meta_connect_status) {
            return Err(SettingsError::InvalidValue {
                key: "transport.duplicateMetaConnectStatus",
                reason: format!("{} is not an HTTP status", self.duplicate_meta_connect_status),
            });
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level filter, overridden by `RUST_LOG`.
    pub level: String,
    /// Emit JSON lines instead of human readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
