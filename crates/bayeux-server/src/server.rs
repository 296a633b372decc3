//! `BayeuxServer`: Axum HTTP + WebSocket server.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use bayeux_settings::BayeuxSettings;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::health::{self, HealthResponse};
use crate::long_poll::{LongPollSchedulerFactory, SchedulerFactory};
use crate::metrics;
use crate::processor::Processor;
use crate::shutdown::ShutdownCoordinator;
use crate::sweeper::spawn_sweeper;
use crate::transport::LongPollTransport;
use crate::websocket::WebSocketTransport;

/// Long-poll endpoint.
pub const COMETD_PATH: &str = "/cometd";
/// WebSocket endpoint.
pub const COMETD_WS_PATH: &str = "/cometd/ws";

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Sessions and channels.
    pub broker: Arc<Broker>,
    /// `POST /cometd` handler.
    pub long_poll: Arc<LongPollTransport>,
    /// `GET /cometd/ws` handler.
    pub websocket: Arc<WebSocketTransport>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// Open WebSocket connections.
    pub connections: Arc<AtomicUsize>,
    /// Upgrade limit.
    pub max_connections: usize,
    /// Per-frame limit for WebSocket messages.
    pub max_message_size: Option<usize>,
}

/// The Bayeux server.
pub struct BayeuxServer {
    settings: BayeuxSettings,
    broker: Arc<Broker>,
    processor: Arc<Processor>,
    scheduler_factory: Arc<dyn SchedulerFactory>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
    connections: Arc<AtomicUsize>,
    start_time: Instant,
}

impl BayeuxServer {
    /// Create a new server.
    pub fn new(settings: BayeuxSettings) -> Self {
        let broker = Arc::new(Broker::new(settings.transport.clone()));
        let processor = Arc::new(Processor::new(Arc::clone(&broker)));
        Self {
            settings,
            broker,
            processor,
            scheduler_factory: Arc::new(LongPollSchedulerFactory),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics: None,
            connections: Arc::new(AtomicUsize::new(0)),
            start_time: Instant::now(),
        }
    }

    /// Suspend held connects through `factory` instead of the default timer.
    #[must_use]
    pub fn with_scheduler_factory(mut self, factory: Arc<dyn SchedulerFactory>) -> Self {
        self.scheduler_factory = factory;
        self
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Get the broker.
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server settings.
    pub fn settings(&self) -> &BayeuxSettings {
        &self.settings
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let heartbeat = Duration::from_millis(self.settings.server.heartbeat_interval_ms.max(1));
        let state = AppState {
            broker: Arc::clone(&self.broker),
            long_poll: Arc::new(LongPollTransport::new(
                Arc::clone(&self.broker),
                Arc::clone(&self.processor),
                Arc::clone(&self.scheduler_factory),
            )),
            websocket: Arc::new(WebSocketTransport::new(
                Arc::clone(&self.broker),
                Arc::clone(&self.processor),
                Arc::clone(&self.scheduler_factory),
                heartbeat,
            )),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
            connections: Arc::clone(&self.connections),
            max_connections: self.settings.server.max_connections,
            max_message_size: self.settings.transport.message_size_limit(),
        };

        Router::new()
            .route(
                COMETD_PATH,
                post(long_poll_handler).layer(DefaultBodyLimit::disable()),
            )
            .route(COMETD_WS_PATH, get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Serve on `listener` until the shutdown coordinator fires.
    ///
    /// Suspended long polls are woken as soon as shutdown starts so their
    /// responses drain before the listener closes.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        let token = self.shutdown.token();
        self.shutdown.track(spawn_sweeper(
            Arc::clone(&self.broker),
            self.settings.transport.sweep_period(),
            token.clone(),
        ));
        let broker = Arc::clone(&self.broker);
        let released = token.clone();
        self.shutdown.track(tokio::spawn(async move {
            released.cancelled().await;
            let woken = broker.wake_all();
            info!(woken, "shutdown started, held connects released");
        }));

        info!(addr = %listener.local_addr()?, "bayeux server listening");
        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(token.cancelled_owned())
            .await;
        if let Err(err) = &result {
            warn!(error = %err, "server stopped with error");
        }

        let aborted = self.shutdown.drain(SHUTDOWN_TIMEOUT).await;
        info!(sessions = self.broker.sessions().len(), aborted, "bayeux server stopped");
        result
    }
}

/// POST /cometd
async fn long_poll_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    state.long_poll.handle(&headers, body).await
}

/// Decrements the connection count when the socket task ends.
struct ConnectionSlot(Arc<AtomicUsize>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        let _ = self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// GET /cometd/ws
async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let previous = state.connections.fetch_add(1, Ordering::AcqRel);
    let slot = ConnectionSlot(Arc::clone(&state.connections));
    if previous >= state.max_connections {
        warn!(max = state.max_connections, "websocket connection limit reached");
        drop(slot);
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    }

    let ws = match state.max_message_size {
        Some(limit) => ws.max_message_size(limit).max_frame_size(limit),
        None => ws,
    };
    let transport = Arc::clone(&state.websocket);
    let token = state.shutdown.token();
    ws.on_upgrade(move |socket| async move {
        let _slot = slot;
        transport.run(socket, token).await;
    })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.broker.sessions().len(),
        state.broker.channels().len(),
        state.connections.load(Ordering::Acquire),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
