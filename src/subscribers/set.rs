//! # SubscriberSet: non-blocking fan-out over a changing set of subscribers
//!
//! [`SubscriberSet`] distributes each [`Event`](crate::events::Event) to every
//! registered subscriber **without awaiting** their processing. Subscribers
//! can be added and removed while the manager runs.
//!
//! ## What it guarantees
//! - `emit(&Event)` never waits on a subscriber.
//! - Per-subscriber FIFO (queue order).
//! - Panics inside subscribers are caught and logged (isolation).
//!
//! ## What it does **not** guarantee
//! - No global ordering across different subscribers.
//! - No retries on per-subscriber queue overflow.
//!
//! ## Diagram
//! ```text
//!    emit(&Event)
//!        │                        (Arc-clone per subscriber)
//!        ├────────────────► [queue S1] ─► worker S1 ─► on_event()
//!        ├────────────────► [queue S2] ─► worker S2 ─► on_event()
//!        └────────────────► [queue SN] ─► worker SN ─► on_event()
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;

use crate::events::Event;

use super::Subscribe;

/// Handle returned by [`SubscriberSet::add`]; pass it to [`SubscriberSet::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Per-subscriber channel with metadata
struct SubscriberChannel {
    id: SubscriptionId,
    name: &'static str,
    sender: mpsc::Sender<Arc<Event>>,
    worker: JoinHandle<()>,
}

/// Composite fan-out with per-subscriber bounded queues and worker tasks.
pub struct SubscriberSet {
    channels: RwLock<Vec<SubscriberChannel>>,
    next_id: AtomicU64,
}

impl Default for SubscriberSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberSet {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a subscriber and spawns its worker.
    pub async fn add(&self, sub: Arc<dyn Subscribe>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cap = sub.queue_capacity().max(1);
        let name = sub.name();
        let (tx, mut rx) = mpsc::channel::<Arc<Event>>(cap);

        let worker = tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                let fut = sub.on_event(ev.as_ref());
                if let Err(panic_err) = std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                    tracing::warn!(
                        subscriber = sub.name(),
                        panic = ?panic_err,
                        "subscriber panicked"
                    );
                }
            }
        });

        self.channels.write().await.push(SubscriberChannel {
            id,
            name,
            sender: tx,
            worker,
        });
        id
    }

    /// Unregisters a subscriber. Events already queued are still delivered.
    ///
    /// Returns `false` if the id is unknown.
    pub async fn remove(&self, id: SubscriptionId) -> bool {
        let removed = {
            let mut channels = self.channels.write().await;
            channels
                .iter()
                .position(|c| c.id == id)
                .map(|pos| channels.swap_remove(pos))
        };
        match removed {
            Some(channel) => {
                drop(channel.sender);
                let _ = channel.worker.await;
                true
            }
            None => false,
        }
    }

    /// Fan-out one event to all subscribers.
    ///
    /// If a subscriber's queue is **full** or **closed**, the event is dropped for it
    /// and a warning is logged with the subscriber's name.
    pub async fn emit(&self, event: &Event) {
        let ev = Arc::new(event.clone());
        for channel in self.channels.read().await.iter() {
            match channel.sender.try_send(Arc::clone(&ev)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(subscriber = channel.name, "dropped event: queue full");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::warn!(subscriber = channel.name, "dropped event: worker closed");
                }
            }
        }
    }

    /// Graceful shutdown: close all queues and await worker completion.
    pub async fn shutdown(&self) {
        let channels = std::mem::take(&mut *self.channels.write().await);
        for channel in channels {
            drop(channel.sender);
            let _ = channel.worker.await;
        }
    }

    /// Number of subscribers.
    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct Counter(Arc<AtomicUsize>);

    #[async_trait]
    impl Subscribe for Counter {
        async fn on_event(&self, _event: &Event) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicky;

    #[async_trait]
    impl Subscribe for Panicky {
        async fn on_event(&self, _event: &Event) {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn test_add_emit_remove() {
        let set = SubscriberSet::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = set.add(Arc::new(Counter(Arc::clone(&hits)))).await;
        assert_eq!(set.len().await, 1);

        set.emit(&Event::new(EventKind::TaskStatus)).await;
        set.emit(&Event::new(EventKind::MonitorStatus)).await;
        assert!(set.remove(id).await);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        set.emit(&Event::new(EventKind::TaskStatus)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(!set.remove(id).await);
    }

    #[tokio::test]
    async fn test_panicking_subscriber_is_isolated() {
        let set = SubscriberSet::new();
        let hits = Arc::new(AtomicUsize::new(0));
        set.add(Arc::new(Panicky)).await;
        set.add(Arc::new(Counter(Arc::clone(&hits)))).await;

        set.emit(&Event::new(EventKind::TaskStatus)).await;
        set.emit(&Event::new(EventKind::TaskStatus)).await;
        set.shutdown().await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(set.len().await, 0);
    }
}
