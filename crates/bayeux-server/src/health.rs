//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live sessions.
    pub sessions: usize,
    /// Known channels.
    pub channels: usize,
    /// Open WebSocket connections.
    pub connections: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    sessions: usize,
    channels: usize,
    connections: usize,
) -> HealthResponse {
    HealthResponse {
        status: "ok",
        uptime_secs: start_time.elapsed().as_secs(),
        sessions,
        channels,
        connections,
    }
}
