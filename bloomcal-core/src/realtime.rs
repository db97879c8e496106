//! The live subscription to a change feed.

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::Msg;
use crate::remote::ChangeFeed;

/// Forwards feed notifications into the session inbox while running.
///
/// `start` maps to mounting a calendar view and `stop` to unmounting it.
#[derive(Debug, Default)]
pub(crate) struct RealtimeSubscription {
    pump: Option<JoinHandle<()>>,
}

impl RealtimeSubscription {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.pump.as_ref().is_some_and(|pump| !pump.is_finished())
    }

    /// Subscribe to `feed`, replacing any previous subscription.
    pub(crate) async fn start(&mut self, feed: &dyn ChangeFeed, inbox: mpsc::UnboundedSender<Msg>) {
        self.stop().await;
        let mut receiver = feed.subscribe();
        debug!("realtime subscription started");
        self.pump = Some(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(notification) => {
                        if inbox.send(Msg::Feed(notification)).is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "realtime subscription lagged");
                        if inbox.send(Msg::FeedLagged(skipped)).is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("change feed closed");
                        break;
                    }
                }
            }
        }));
    }

    /// Abort the pump and wait until its receiver is gone.
    pub(crate) async fn stop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
            // Resolves once the task, and the receiver it owns, are dropped.
            let _ = pump.await;
            debug!("realtime subscription stopped");
        }
    }
}

impl Drop for RealtimeSubscription {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{Category, ItemDraft, ItemTime};
    use crate::remote::FeedNotification;
    use crate::remote::memory::MemoryBackend;

    #[tokio::test]
    async fn test_stop_unsubscribes_immediately() {
        let backend = MemoryBackend::default();
        let (inbox, _rx) = mpsc::unbounded_channel();
        let mut subscription = RealtimeSubscription::new();

        subscription.start(&backend, inbox.clone()).await;
        assert_eq!(backend.subscriber_count(), 1);
        assert!(subscription.is_running());

        // Restarting replaces rather than adds.
        subscription.start(&backend, inbox).await;
        assert_eq!(backend.subscriber_count(), 1);

        subscription.stop().await;
        assert_eq!(backend.subscriber_count(), 0);
        assert!(!subscription.is_running());
    }

    #[tokio::test]
    async fn test_forwards_notifications() {
        let backend = MemoryBackend::default();
        let (inbox, mut rx) = mpsc::unbounded_channel();
        let mut subscription = RealtimeSubscription::new();
        subscription.start(&backend, inbox).await;

        let item = ItemDraft::new("Lunch", ItemTime::parse("2025-03-20").unwrap(), Category::PlainEvent)
            .into_item();
        let record = backend.seed(item);
        backend.publish(FeedNotification::insert(record.clone()));

        match rx.recv().await {
            Some(Msg::Feed(notification)) => assert_eq!(notification.record, record),
            _ => panic!("expected a feed message"),
        }
    }
}
