//! Event sinks for notable node events.
//!
//! The node reports joins, failed requests and expired entries through the
//! [`EventSink`] it was constructed with. [`TracingSink`] forwards events to
//! `tracing`; [`MemorySink`] buffers them so a console can page through them.

use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::info;

/// Receiver of discrete log lines emitted by the DHT engine.
pub trait EventSink: Send + Sync + 'static {
    fn log(&self, message: String);
}

/// Forwards every event as an `info` record under the `kademlia::events` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn log(&self, message: String) {
        info!(target: "kademlia::events", "{message}");
    }
}

/// Buffers events in memory, split into unread and already-read lines.
#[derive(Debug, Default)]
pub struct MemorySink {
    inner: Mutex<MemoryLog>,
}

#[derive(Debug, Default)]
struct MemoryLog {
    unread: VecDeque<String>,
    read: Vec<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pop the oldest unread event and move it to the history.
    pub fn read_new(&self) -> Option<String> {
        let mut log = self.lock();
        let next = log.unread.pop_front()?;
        log.read.push(next.clone());
        Some(next)
    }

    /// Events already returned by [`read_new`](Self::read_new), oldest first.
    pub fn history(&self) -> Vec<String> {
        self.lock().read.clone()
    }

    /// Every event seen so far, read or not, oldest first.
    pub fn all(&self) -> Vec<String> {
        let log = self.lock();
        log.read.iter().chain(log.unread.iter()).cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryLog> {
        // A panic while holding the lock leaves the buffers intact.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EventSink for MemorySink {
    fn log(&self, message: String) {
        self.lock().unread.push_back(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_moves_read_events_to_history() {
        let sink = MemorySink::new();
        sink.log("first".into());
        sink.log("second".into());

        assert_eq!(sink.read_new().as_deref(), Some("first"));
        assert_eq!(sink.history(), vec!["first".to_string()]);
        assert_eq!(sink.all(), vec!["first".to_string(), "second".to_string()]);
        assert_eq!(sink.read_new().as_deref(), Some("second"));
        assert_eq!(sink.read_new(), None);
    }
}
