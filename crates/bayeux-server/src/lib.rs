//! # bayeux-server
//!
//! Bayeux publish/subscribe server over Axum.
//!
//! - `POST /cometd`: HTTP long-polling with a streamed, state-machine response writer
//! - `GET /cometd/ws`: the same protocol over a `WebSocket`, one batch per frame
//! - Sessions with per-client queues, suspended `/meta/connect` and expiration
//! - Channels with wildcard subscriptions, listeners and lazy (delayed) delivery
//! - `/health` and Prometheus `/metrics`
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod broker;
pub mod error;
pub mod health;
pub mod lazy;
pub mod long_poll;
pub mod metrics;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod sweeper;
pub mod transport;
pub mod websocket;

pub use broker::Broker;
pub use error::{ExchangeError, PublishError};
pub use lazy::LazyMessageScheduler;
pub use long_poll::{LongPollSchedulerFactory, Scheduler, SchedulerFactory};
pub use processor::Processor;
pub use registry::{ChannelListener, ChannelRegistry, ServerChannel};
pub use server::{AppState, BayeuxServer};
pub use session::{ServerSession, SessionRegistry};
pub use shutdown::ShutdownCoordinator;
