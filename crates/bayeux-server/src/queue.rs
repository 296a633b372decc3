//! Per-session outbound message queue.

use std::collections::VecDeque;
use std::sync::Arc;

use bayeux_core::Message;
use parking_lot::Mutex;

/// Ordered buffer of messages waiting for the session's next response.
///
/// Publishers, lazy timers and response writers race on it, so every
/// operation takes the lock briefly and never across an await.
#[derive(Debug, Default)]
pub struct SessionQueue {
    inner: Mutex<VecDeque<Arc<Message>>>,
}

impl SessionQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message.
    pub fn push(&self, message: Arc<Message>) {
        self.inner.lock().push_back(message);
    }

    /// Take everything queued right now. Later pushes stay for the next drain.
    pub fn drain(&self) -> Vec<Arc<Message>> {
        self.inner.lock().drain(..).collect()
    }

    /// Queued message count.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Drop everything queued.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}
