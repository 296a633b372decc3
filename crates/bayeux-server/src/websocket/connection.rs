//! Per-socket state shared by the read loop, deferred connects and the
//! outbound writer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bayeux_core::{ClientId, ConnectionId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// One upgraded WebSocket.
#[derive(Debug)]
pub struct WsConnection {
    id: ConnectionId,
    client_id: Mutex<Option<ClientId>>,
    tx: mpsc::Sender<String>,
    closed: CancellationToken,
    connected_at: Instant,
    alive: AtomicBool,
    last_pong: Mutex<Instant>,
    dropped_frames: AtomicU64,
}

impl WsConnection {
    /// Connection writing frames into `tx` until `closed` fires.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<String>, closed: CancellationToken) -> Self {
        let now = Instant::now();
        Self {
            id,
            client_id: Mutex::new(None),
            tx,
            closed,
            connected_at: now,
            alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Remember the session handshaken over this socket.
    pub fn bind_client(&self, client_id: ClientId) {
        *self.client_id.lock() = Some(client_id);
    }

    /// Session handshaken over this socket, if any.
    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id.lock().clone()
    }

    /// Cancelled once the socket is closing.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    /// Queue a text frame, waiting while the writer is backed up.
    ///
    /// `false` if the socket closed before the frame could be queued.
    pub async fn send(&self, frame: String) -> bool {
        let sent = tokio::select! {
            biased;
            () = self.closed.cancelled() => false,
            sent = self.tx.send(frame) => sent.is_ok(),
        };
        if !sent {
            let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    /// Frames lost to a closed socket.
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Record a pong or any other sign of life.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Take the alive flag.
    pub fn check_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the last pong.
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Time since the upgrade.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
