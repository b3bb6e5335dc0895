use super::PlaybackProgress;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::mpsc as tokio_mpsc;
use tracing::debug;

type SubscriptionId = u64;
type Subscribers = Arc<Mutex<HashMap<SubscriptionId, tokio_mpsc::UnboundedSender<PlaybackProgress>>>>;

/// Fans playback progress out to any number of subscribers
#[derive(Clone)]
pub struct PlaybackProgressHandle {
    subscribers: Subscribers,
    next_id: Arc<AtomicU64>,
}

impl PlaybackProgressHandle {
    /// Spawn the dispatch task on `runtime_handle`. It ends when the service
    /// drops its progress sender.
    pub fn new(
        mut progress_rx: tokio_mpsc::UnboundedReceiver<PlaybackProgress>,
        runtime_handle: tokio::runtime::Handle,
    ) -> Self {
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        let dispatch = subscribers.clone();

        runtime_handle.spawn(async move {
            while let Some(progress) = progress_rx.recv().await {
                // Receivers that were dropped unsubscribe themselves here
                dispatch
                    .lock()
                    .retain(|_, tx| tx.send(progress.clone()).is_ok());
            }
            debug!("Playback progress channel closed");
        });

        Self {
            subscribers,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Receive every update from now on, until the receiver is dropped
    pub fn subscribe_all(&self) -> tokio_mpsc::UnboundedReceiver<PlaybackProgress> {
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(id, tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_updates_reach_every_subscriber() {
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        let handle = PlaybackProgressHandle::new(rx, tokio::runtime::Handle::current());
        let mut first = handle.subscribe_all();
        let mut second = handle.subscribe_all();

        tx.send(PlaybackProgress::TrackCompleted {
            track_id: "t1".to_string(),
        })
        .unwrap();

        for rx in [&mut first, &mut second] {
            let update = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap();
            assert!(matches!(
                update,
                Some(PlaybackProgress::TrackCompleted { track_id }) if track_id == "t1"
            ));
        }
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_unsubscribed() {
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        let handle = PlaybackProgressHandle::new(rx, tokio::runtime::Handle::current());
        let dropped = handle.subscribe_all();
        let mut kept = handle.subscribe_all();
        drop(dropped);

        tx.send(PlaybackProgress::TrackCompleted {
            track_id: "t1".to_string(),
        })
        .unwrap();
        tokio::time::timeout(Duration::from_secs(1), kept.recv())
            .await
            .unwrap();

        assert_eq!(handle.subscriber_count(), 1);
    }
}
