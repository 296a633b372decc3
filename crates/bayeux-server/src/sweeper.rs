//! Periodic removal of expired sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broker::Broker;

/// Sweep `broker` every `period` until `cancel` fires.
pub fn spawn_sweeper(
    broker: Arc<Broker>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let _ = ticks.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticks.tick() => {
                    let expired = broker.sweep(Instant::now());
                    if !expired.is_empty() {
                        info!(count = expired.len(), "expired sessions removed");
                    }
                }
            }
        }
        debug!("sweeper stopped");
    })
}
