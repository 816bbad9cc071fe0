//! Bounded queue of unsolicited modem notifications.
//!
//! The IO task pushes; profile and session code consume by prefix. When the
//! queue is full the oldest notification is evicted so that a burst of
//! measurement reports can never block the IO task.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, warn};

use imok_core::error::{Error, Result};

/// Default queue capacity.
pub const DEFAULT_CAPACITY: usize = 64;

/// Bounded FIFO of notification lines with prefix-based consumption.
#[derive(Debug)]
pub struct NotificationQueue {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
    arrived: Notify,
}

impl NotificationQueue {
    /// Create a queue holding at most `capacity` lines.
    pub fn new(capacity: usize) -> Self {
        NotificationQueue {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            arrived: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        // A panic while holding the lock cannot leave the deque inconsistent.
        self.lines.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a line, evicting the oldest when full.
    pub fn push(&self, line: String) {
        {
            let mut lines = self.lock();
            if lines.len() >= self.capacity {
                if let Some(evicted) = lines.pop_front() {
                    warn!(evicted = %evicted, capacity = self.capacity, "notification queue full, dropping oldest");
                }
            }
            debug!(line = %line, "notification queued");
            lines.push_back(line);
        }
        self.arrived.notify_waiters();
    }

    /// Remove and return the oldest line starting with `prefix`.
    pub fn take(&self, prefix: &str) -> Option<String> {
        let mut lines = self.lock();
        let idx = lines.iter().position(|l| l.starts_with(prefix))?;
        lines.remove(idx)
    }

    /// Remove every line starting with `prefix`. Returns how many were removed.
    pub fn discard(&self, prefix: &str) -> usize {
        let mut lines = self.lock();
        let before = lines.len();
        lines.retain(|l| !l.starts_with(prefix));
        before - lines.len()
    }

    /// Wait up to `timeout` for a line starting with `prefix`.
    pub async fn wait(&self, prefix: &str, timeout: Duration) -> Result<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so a push in between is not missed.
            let arrived = self.arrived.notified();
            if let Some(line) = self.take(prefix) {
                return Ok(line);
            }
            if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                return Err(Error::Timeout);
            }
        }
    }

    /// Number of queued lines.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for NotificationQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn take_by_prefix_preserves_order() {
        let q = NotificationQueue::new(8);
        q.push("+CSCON: 1".into());
        q.push("+CEREG: 2".into());
        q.push("+CEREG: 5".into());
        assert_eq!(q.take("+CEREG:").as_deref(), Some("+CEREG: 2"));
        assert_eq!(q.take("+CEREG:").as_deref(), Some("+CEREG: 5"));
        assert_eq!(q.take("+CEREG:"), None);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn full_queue_evicts_oldest() {
        let q = NotificationQueue::new(2);
        q.push("a".into());
        q.push("b".into());
        q.push("c".into());
        assert_eq!(q.len(), 2);
        assert_eq!(q.take(""), Some("b".into()));
        assert_eq!(q.take(""), Some("c".into()));
    }

    #[test]
    fn discard_removes_all_matches() {
        let q = NotificationQueue::new(8);
        q.push("%SOCKETEV:1,1".into());
        q.push("%MEAS: RSRP=-110".into());
        q.push("%SOCKETEV:1,2".into());
        assert_eq!(q.discard("%SOCKETEV:"), 2);
        assert_eq!(q.len(), 1);
        assert!(!q.is_empty());
    }

    #[tokio::test]
    async fn wait_returns_queued_line_immediately() {
        let q = NotificationQueue::new(8);
        q.push("%BOOTEV:0".into());
        let line = q.wait("%BOOTEV:", Duration::from_millis(10)).await.unwrap();
        assert_eq!(line, "%BOOTEV:0");
    }

    #[tokio::test]
    async fn wait_wakes_on_push() {
        let q = Arc::new(NotificationQueue::new(8));
        let pusher = q.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pusher.push("+CSCON: 0".into());
            pusher.push("+CSCON: 1".into());
        });
        let line = q.wait("+CSCON: 1", Duration::from_secs(2)).await.unwrap();
        assert_eq!(line, "+CSCON: 1");
        assert_eq!(q.take("+CSCON:").as_deref(), Some("+CSCON: 0"));
    }

    #[tokio::test]
    async fn wait_times_out() {
        let q = NotificationQueue::new(8);
        q.push("+CEREG: 2".into());
        let err = q.wait("%IGNSSEVU:", Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert_eq!(q.len(), 1);
    }
}
