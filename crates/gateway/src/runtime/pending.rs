//! Per-slot pending-message queue for mid-task injection.
//!
//! When a message arrives for a session slot that already has a turn
//! running, it is queued here instead of being dropped. The running turn
//! drains its queue at the start of every tool-loop iteration and injects
//! the messages as synthetic user turns before the next think step, so a
//! busy slot never silently loses a message.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Queued messages for sessions whose turn is currently in flight.
pub struct PendingMessageQueue {
    inner: Mutex<HashMap<String, Vec<String>>>,
}

impl Default for PendingMessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingMessageQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a message for a busy session. Returns the queue depth after
    /// insertion (so callers can report it back to the sender).
    pub fn push(&self, session_key: &str, message: impl Into<String>) -> usize {
        let mut inner = self.inner.lock();
        let queue = inner.entry(session_key.to_owned()).or_default();
        queue.push(message.into());
        queue.len()
    }

    /// Drain all messages queued for a session. Empty if none are pending.
    /// Called once per tool-loop iteration — the running turn is the only
    /// consumer, so a plain remove is race-free under the session lock.
    pub fn drain(&self, session_key: &str) -> Vec<String> {
        self.inner.lock().remove(session_key).unwrap_or_default()
    }

    /// Current queue depth for a session, without draining it.
    pub fn depth(&self, session_key: &str) -> usize {
        self.inner
            .lock()
            .get(session_key)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_increments_depth() {
        let q = PendingMessageQueue::new();
        assert_eq!(q.push("s1", "hello"), 1);
        assert_eq!(q.push("s1", "world"), 2);
        assert_eq!(q.depth("s1"), 2);
    }

    #[test]
    fn drain_returns_in_order_and_empties() {
        let q = PendingMessageQueue::new();
        q.push("s1", "a");
        q.push("s1", "b");
        assert_eq!(q.drain("s1"), vec!["a".to_string(), "b".to_string()]);
        assert!(q.drain("s1").is_empty());
    }

    #[test]
    fn sessions_are_independent() {
        let q = PendingMessageQueue::new();
        q.push("s1", "a");
        q.push("s2", "b");
        assert_eq!(q.drain("s1"), vec!["a".to_string()]);
        assert_eq!(q.depth("s2"), 1);
    }
}
