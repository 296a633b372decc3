//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Call once at startup, before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Exchanges handled (counter, labels: transport, outcome).
pub const EXCHANGES_TOTAL: &str = "bayeux_exchanges_total";
/// Exchange duration from request arrival to response start (histogram, labels: transport).
pub const EXCHANGE_DURATION_SECONDS: &str = "bayeux_exchange_duration_seconds";
/// Response bodies fully written (counter, labels: transport).
pub const RESPONSES_TOTAL: &str = "bayeux_responses_total";
/// Queued messages written into responses (counter, labels: transport).
pub const MESSAGES_WRITTEN_TOTAL: &str = "bayeux_messages_written_total";
/// Request bodies rejected for size (counter).
pub const OVERSIZED_REQUESTS_TOTAL: &str = "bayeux_oversized_requests_total";
/// Long polls currently suspended (gauge).
pub const LONG_POLLS_SUSPENDED: &str = "bayeux_long_polls_suspended";
/// Long poll resumptions (counter, labels: outcome).
pub const LONG_POLL_RESUMES_TOTAL: &str = "bayeux_long_poll_resumes_total";
/// Delayed deliveries waiting to fire (gauge).
pub const LAZY_DELIVERIES_PENDING: &str = "bayeux_lazy_deliveries_pending";
/// Delayed deliveries that fired (counter).
pub const LAZY_DELIVERIES_TOTAL: &str = "bayeux_lazy_deliveries_total";
/// Live sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "bayeux_sessions_active";
/// Sessions removed by the sweeper (counter).
pub const SESSIONS_EXPIRED_TOTAL: &str = "bayeux_sessions_expired_total";
/// Messages published (counter, labels: origin).
pub const PUBLISHES_TOTAL: &str = "bayeux_publishes_total";
/// WebSocket connections opened (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "bayeux_ws_connections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "bayeux_ws_connections_active";
