use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;

use crate::manager::table::JobTable;

/// A snapshot of the job table serialized to JSON, shared between all subscribers.
pub type SerializedSnapshot = Arc<str>;

pub type SubscriberId = u64;

#[derive(Debug, Default)]
struct Registry {
    next_id: SubscriberId,
    subscribers: HashMap<SubscriberId, mpsc::UnboundedSender<SerializedSnapshot>>,
}

/// Fans every change of the job table out to all subscribers.
/// Publishing serializes the current snapshot once and pushes it to every registered channel
/// while holding the registry lock, concurrent publishers can't reorder snapshots.
/// Subscribers whose receiving end is gone are dropped on the next push.
/// This struct is supposed to be cloned, it uses an Arc internally.
#[derive(Debug, Clone)]
pub struct DownloadObserver {
    registry: Arc<Mutex<Registry>>,
    table: Arc<JobTable>,
}

/// Receiving end of a subscription. Dropping it unregisters the subscriber.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::UnboundedReceiver<SerializedSnapshot>,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next published snapshot, None once the observer is gone.
    pub async fn recv(&mut self) -> Option<SerializedSnapshot> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SerializedSnapshot> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).subscribers.remove(&self.id);
        }
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DownloadObserver {
    pub fn new(table: Arc<JobTable>) -> Self {
        Self {
            registry: Arc::default(),
            table,
        }
    }

    fn serialized_snapshot(&self) -> Option<SerializedSnapshot> {
        match serde_json::to_string(&self.table.snapshot()) {
            Ok(json) => Some(json.into()),
            Err(e) => {
                log::error!("Failed to serialize job snapshot: {}", e);
                None
            }
        }
    }

    /// Registers a new subscriber, the current state is queued on its channel right away.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = lock(&self.registry);
        if let Some(snapshot) = self.serialized_snapshot() {
            // the receiver is still in our hands, this can't fail
            let _ = tx.send(snapshot);
        }
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.insert(id, tx);
        log::info!(
            "Subscriber {} registered, {} active",
            id,
            registry.subscribers.len()
        );
        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        if lock(&self.registry).subscribers.remove(&id).is_some() {
            log::info!("Subscriber {} unregistered", id);
        }
    }

    /// Pushes the current state of the job table to every subscriber.
    pub fn publish(&self) {
        let mut registry = lock(&self.registry);
        if registry.subscribers.is_empty() {
            return;
        }
        let Some(snapshot) = self.serialized_snapshot() else {
            return;
        };
        registry.subscribers.retain(|id, tx| {
            let alive = tx.send(snapshot.clone()).is_ok();
            if !alive {
                log::warn!("Dropping subscriber {}, receiver is gone", id);
            }
            alive
        });
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry).subscribers.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::job::{JobStatus, Snapshot};
    use crate::manager::table::Transition;
    use pretty_assertions::assert_eq;
    use test_log::test;

    fn decode(snapshot: SerializedSnapshot) -> Snapshot {
        serde_json::from_str(&snapshot).unwrap()
    }

    #[test(tokio::test)]
    async fn late_subscriber_sees_prior_state_first() {
        let table = Arc::new(JobTable::new());
        let observer = DownloadObserver::new(table.clone());
        table.insert("u1");
        table.insert("u2");
        let mut subscription = observer.subscribe();
        let initial = decode(subscription.recv().await.unwrap());
        assert_eq!(initial.total, 2);
        assert_eq!(initial.queue.len(), 2);
        assert!(subscription.try_recv().is_none());
    }

    #[test(tokio::test)]
    async fn publishes_arrive_in_order() {
        let table = Arc::new(JobTable::new());
        let observer = DownloadObserver::new(table.clone());
        let mut subscription = observer.subscribe();
        let ticket = table.insert("u1");
        observer.publish();
        table.claim(ticket).unwrap();
        observer.publish();
        for pct in [10.0, 20.0, 30.0] {
            table.mutate(ticket, Transition::Downloading(pct));
            observer.publish();
        }
        let received: Vec<_> = std::iter::from_fn(|| subscription.try_recv())
            .map(decode)
            .collect();
        assert_eq!(received.len(), 6);
        assert_eq!(received[0].total, 0);
        assert_eq!(received[1].queue[0].status, JobStatus::Queued);
        assert_eq!(received[2].queue[0].status, JobStatus::Starting);
        let progress: Vec<_> = received[3..].iter().map(|s| s.queue[0].progress).collect();
        assert_eq!(progress, vec![10.0, 20.0, 30.0]);
    }

    #[test(tokio::test)]
    async fn every_subscriber_gets_every_publish() {
        let table = Arc::new(JobTable::new());
        let observer = DownloadObserver::new(table.clone());
        let mut subscriptions: Vec<_> = (0..3).map(|_| observer.subscribe()).collect();
        table.insert("u1");
        observer.publish();
        for subscription in subscriptions.iter_mut() {
            assert_eq!(decode(subscription.recv().await.unwrap()).total, 0);
            assert_eq!(decode(subscription.recv().await.unwrap()).total, 1);
        }
    }

    #[test(tokio::test)]
    async fn dropped_subscription_is_unregistered() {
        let table = Arc::new(JobTable::new());
        let observer = DownloadObserver::new(table);
        let keep = observer.subscribe();
        let gone = observer.subscribe();
        assert_eq!(observer.subscriber_count(), 2);
        drop(gone);
        assert_eq!(observer.subscriber_count(), 1);
        observer.unsubscribe(keep.id());
        assert_eq!(observer.subscriber_count(), 0);
        observer.publish();
    }

    #[test(tokio::test)]
    async fn failed_push_drops_subscriber() {
        let table = Arc::new(JobTable::new());
        let observer = DownloadObserver::new(table);
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        {
            let mut registry = lock(&observer.registry);
            registry.next_id += 1;
            registry.subscribers.insert(99, tx);
        }
        let _live = observer.subscribe();
        assert_eq!(observer.subscriber_count(), 2);
        observer.publish();
        assert_eq!(observer.subscriber_count(), 1);
    }

    #[test]
    fn concurrent_publishers_never_move_totals_back() {
        let table = Arc::new(JobTable::new());
        let observer = DownloadObserver::new(table.clone());
        let mut subscriptions = vec![observer.subscribe(), observer.subscribe()];
        std::thread::scope(|scope| {
            for thread in 0..4 {
                let table = &table;
                let observer = &observer;
                scope.spawn(move || {
                    for i in 0..25 {
                        table.insert(format!("https://example.com/{thread}/{i}"));
                        observer.publish();
                    }
                });
            }
        });
        for subscription in &mut subscriptions {
            let mut totals = Vec::new();
            while let Some(snapshot) = subscription.try_recv() {
                totals.push(decode(snapshot).total);
            }
            assert_eq!(totals.len(), 101);
            assert!(totals.windows(2).all(|pair| pair[0] <= pair[1]), "{totals:?}");
            assert_eq!(totals.last(), Some(&100));
        }
    }
}
