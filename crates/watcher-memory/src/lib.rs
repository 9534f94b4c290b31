//! In-memory (single process) implementation of the watcher for local
//! development and tests.
//!
//! Destinations are process-global: every [`MemoryWatcher`] created for the
//! same destination name receives a copy of every notification published to
//! it (fanout semantics).
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use bytes::Bytes;
use casbin_watcher::{UpdateCallback, Watcher, timestamp_event};
use tokio::sync::{Mutex, broadcast, watch};
use tracing::info;

static DESTINATIONS: LazyLock<Mutex<HashMap<String, broadcast::Sender<Bytes>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

async fn sender_for(destination: &str) -> broadcast::Sender<Bytes> {
    DESTINATIONS
        .lock()
        .await
        .entry(destination.to_owned())
        .or_insert_with(|| broadcast::channel(100).0)
        .clone()
}

/// In-memory watcher.
pub struct MemoryWatcher {
    destination: String,
    sender: broadcast::Sender<Bytes>,
    callback: Arc<Mutex<Option<UpdateCallback>>>,
    closed: AtomicBool,
    stop_sender: watch::Sender<()>,
}

impl MemoryWatcher {
    /// Creates a new `MemoryWatcher` for the given destination and starts
    /// its delivery loop.
    pub async fn new<D>(destination: D) -> Self
    where
        D: Into<String> + Send,
    {
        let destination = destination.into();
        let sender = sender_for(&destination).await;
        let mut receiver = sender.subscribe();

        let callback: Arc<Mutex<Option<UpdateCallback>>> = Arc::new(Mutex::new(None));
        let (stop_sender, mut stop_receiver) = watch::channel(());

        let delivery_callback = Arc::clone(&callback);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_receiver.changed() => {
                        break;
                    }
                    event = receiver.recv() => {
                        match event {
                            Ok(payload) => {
                                let guard = delivery_callback.lock().await;
                                if let Some(callback) = guard.as_ref() {
                                    callback(payload);
                                }
                            }
                            // Lagged receivers skip to the oldest retained
                            // event; a closed channel ends delivery.
                            Err(broadcast::error::RecvError::Lagged(_)) => {}
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });

        Self {
            destination,
            sender,
            callback,
            closed: AtomicBool::new(false),
            stop_sender,
        }
    }

    /// The destination name this watcher publishes to and watches.
    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }
}

#[async_trait]
impl Watcher for MemoryWatcher {
    type Error = Error;

    async fn set_update_callback(&self, callback: UpdateCallback) -> Result<(), Error> {
        *self.callback.lock().await = Some(callback);

        Ok(())
    }

    async fn update(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        // A send error only means there are currently no receivers.
        let _ = self.sender.send(timestamp_event());

        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.stop_sender.send(());

        info!(destination = %self.destination, "memory watcher closed");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::mpsc;
    use tokio::time::{Duration, timeout};
    use uuid::Uuid;

    fn unique_destination(prefix: &str) -> String {
        format!("{}-{}", prefix, Uuid::new_v4().as_hyphenated())
    }

    fn forwarding_callback() -> (UpdateCallback, mpsc::UnboundedReceiver<Bytes>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let callback: UpdateCallback = Arc::new(move |payload| {
            let _ = sender.send(payload);
        });
        (callback, receiver)
    }

    #[tokio::test]
    async fn test_update_flips_callback_within_a_second() {
        let watcher = MemoryWatcher::new(unique_destination("flip")).await;
        let (callback, mut receiver) = forwarding_callback();
        watcher.set_update_callback(callback).await.unwrap();

        watcher.update().await.unwrap();

        let payload = timeout(Duration::from_secs(1), receiver.recv())
            .await
            .expect("callback was not invoked within 1s")
            .unwrap();
        let seconds: f64 = std::str::from_utf8(&payload).unwrap().parse().unwrap();
        assert!(seconds > 0.0);
    }

    #[tokio::test]
    async fn test_callback_only_fires_after_a_publish() {
        let watcher = MemoryWatcher::new(unique_destination("quiet")).await;
        let (callback, mut receiver) = forwarding_callback();
        watcher.set_update_callback(callback).await.unwrap();

        // Nothing published yet, so nothing may be delivered.
        assert!(
            timeout(Duration::from_millis(200), receiver.recv())
                .await
                .is_err()
        );

        watcher.update().await.unwrap();
        assert!(
            timeout(Duration::from_secs(1), receiver.recv())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_n_updates_yield_n_callbacks() {
        let watcher = MemoryWatcher::new(unique_destination("batch")).await;
        let (callback, mut receiver) = forwarding_callback();
        watcher.set_update_callback(callback).await.unwrap();

        for _ in 0..5 {
            watcher.update().await.unwrap();
        }

        for _ in 0..5 {
            timeout(Duration::from_secs(1), receiver.recv())
                .await
                .expect("missing a callback invocation")
                .unwrap();
        }
        assert!(
            timeout(Duration::from_millis(200), receiver.recv())
                .await
                .is_err(),
            "received more callbacks than updates"
        );
    }

    #[tokio::test]
    async fn test_every_watcher_on_a_destination_is_notified() {
        let destination = unique_destination("fanout");
        let publisher = MemoryWatcher::new(destination.clone()).await;
        let subscriber = MemoryWatcher::new(destination).await;

        let (publisher_callback, mut publisher_events) = forwarding_callback();
        let (subscriber_callback, mut subscriber_events) = forwarding_callback();
        publisher.set_update_callback(publisher_callback).await.unwrap();
        subscriber
            .set_update_callback(subscriber_callback)
            .await
            .unwrap();

        publisher.update().await.unwrap();

        assert!(
            timeout(Duration::from_secs(1), publisher_events.recv())
                .await
                .is_ok()
        );
        assert!(
            timeout(Duration::from_secs(1), subscriber_events.recv())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_update_fails_after_close() {
        let watcher = MemoryWatcher::new(unique_destination("closed")).await;

        watcher.close().await.unwrap();

        assert!(matches!(watcher.update().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_no_delivery_after_close() {
        let destination = unique_destination("stopped");
        let publisher = MemoryWatcher::new(destination.clone()).await;
        let subscriber = MemoryWatcher::new(destination).await;

        let (callback, mut receiver) = forwarding_callback();
        subscriber.set_update_callback(callback).await.unwrap();

        subscriber.close().await.unwrap();
        publisher.update().await.unwrap();

        assert!(
            timeout(Duration::from_millis(200), receiver.recv())
                .await
                .is_err(),
            "closed watcher still delivered a callback"
        );
    }

    #[tokio::test]
    async fn test_replacing_the_callback_drops_the_old_one() {
        let watcher = MemoryWatcher::new(unique_destination("replace")).await;

        let (old_callback, mut old_events) = forwarding_callback();
        let (new_callback, mut new_events) = forwarding_callback();
        watcher.set_update_callback(old_callback).await.unwrap();
        watcher.set_update_callback(new_callback).await.unwrap();

        watcher.update().await.unwrap();

        assert!(
            timeout(Duration::from_secs(1), new_events.recv())
                .await
                .is_ok()
        );
        assert!(
            timeout(Duration::from_millis(200), old_events.recv())
                .await
                .is_err(),
            "replaced callback was still invoked"
        );
    }
}
