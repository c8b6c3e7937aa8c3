//! In-process notification bus for review change signaling.
//!
//! Lightweight pub/sub keyed by review id plus the distinguished
//! `QUEUE_TOPIC`, so long-poll endpoints can wait for changes without
//! scanning the store. The bus is a wake-up signal, not a durable log:
//! waiters must re-read the store after waking.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Reserved topic notified whenever a review enters or re-enters `pending`.
pub const QUEUE_TOPIC: &str = "__queue__";

#[derive(Clone, Default)]
struct Topic {
    version: u64,
    notify: Arc<Notify>,
}

/// Per-topic version counter + waiter wakeup.
///
/// Versions are monotone; `notify` increments the version and wakes all
/// current waiters. Waiters decide by version, so repeated notifies and
/// spurious wakes are harmless.
#[derive(Default)]
pub struct NotificationBus {
    topics: Mutex<HashMap<String, Topic>>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, key: &str) -> Topic {
        let mut topics = self.topics.lock().expect("notification bus lock poisoned");
        topics.entry(key.to_string()).or_default().clone()
    }

    /// Current notification version for a topic (0 for unseen topics).
    pub fn current_version(&self, key: &str) -> u64 {
        let topics = self.topics.lock().expect("notification bus lock poisoned");
        topics.get(key).map(|t| t.version).unwrap_or(0)
    }

    /// Signal a change: bump the version and wake all waiters.
    pub fn notify(&self, key: &str) {
        let notify = {
            let mut topics = self.topics.lock().expect("notification bus lock poisoned");
            let topic = topics.entry(key.to_string()).or_default();
            topic.version += 1;
            Arc::clone(&topic.notify)
        };
        notify.notify_waiters();
    }

    /// Wait until the topic's version moves past `since_version` (defaulting
    /// to the version at call entry). Returns true on change, false on
    /// timeout.
    pub async fn wait_for_change(
        &self,
        key: &str,
        timeout: Duration,
        since_version: Option<u64>,
    ) -> bool {
        let baseline = since_version.unwrap_or_else(|| self.current_version(key));
        let deadline = Instant::now() + timeout;

        loop {
            let topic = self.topic(key);
            if topic.version != baseline {
                return true;
            }

            // Register interest before the re-check so a notify landing
            // between the version read and the await is not lost.
            let notified = topic.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.current_version(key) != baseline {
                return true;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    /// Drop a topic's state. Safe for topics that were never notified.
    pub fn cleanup(&self, key: &str) {
        let mut topics = self.topics.lock().expect("notification bus lock poisoned");
        topics.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_before_wait_returns_immediately() {
        let bus = NotificationBus::new();
        let baseline = bus.current_version("r1");
        bus.notify("r1");
        bus.notify("r1");
        bus.notify("r1");
        let changed = bus
            .wait_for_change("r1", Duration::from_millis(50), Some(baseline))
            .await;
        assert!(changed);
        assert_eq!(bus.current_version("r1"), 3);
    }

    #[tokio::test]
    async fn wait_times_out_without_notification() {
        let bus = NotificationBus::new();
        let changed = bus
            .wait_for_change("r1", Duration::from_millis(20), None)
            .await;
        assert!(!changed);
    }

    #[tokio::test]
    async fn waiter_wakes_on_notify() {
        let bus = Arc::new(NotificationBus::new());
        let waiter = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.wait_for_change("r2", Duration::from_secs(5), None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.notify("r2");
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn notify_on_other_topic_does_not_wake() {
        let bus = NotificationBus::new();
        bus.notify("other");
        let changed = bus
            .wait_for_change("r3", Duration::from_millis(20), None)
            .await;
        assert!(!changed);
    }

    #[tokio::test]
    async fn cleanup_resets_version() {
        let bus = NotificationBus::new();
        bus.notify("r4");
        assert_eq!(bus.current_version("r4"), 1);
        bus.cleanup("r4");
        assert_eq!(bus.current_version("r4"), 0);
        // Cleanup of a nonexistent topic is a no-op.
        bus.cleanup("never-seen");
    }
}
