// ── Reactive snapshot streams ──
//
// Wraps the store's watch channels for consumers that want either
// awaitable change notification or a `Stream` of snapshots.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

/// A live view over one synchronized collection.
///
/// Combines the snapshot taken at creation with reactive notification:
/// await [`changed`](Self::changed) or convert to a `Stream`.
pub struct EntityStream<T: Clone + Send + Sync + 'static> {
    current: Arc<Vec<Arc<T>>>,
    receiver: watch::Receiver<Arc<Vec<Arc<T>>>>,
}

impl<T: Clone + Send + Sync + 'static> EntityStream<T> {
    pub(crate) fn new(receiver: watch::Receiver<Arc<Vec<Arc<T>>>>) -> Self {
        let current = receiver.borrow().clone();
        Self { current, receiver }
    }

    /// Snapshot captured when this view was created.
    pub fn current(&self) -> &Arc<Vec<Arc<T>>> {
        &self.current
    }

    /// Latest snapshot, which may be newer than [`current`](Self::current).
    pub fn latest(&self) -> Arc<Vec<Arc<T>>> {
        self.receiver.borrow().clone()
    }

    /// Wait for the next mutation and return the new snapshot.
    /// `None` once the store is gone.
    pub async fn changed(&mut self) -> Option<Arc<Vec<Arc<T>>>> {
        self.receiver.changed().await.ok()?;
        let snap = self.receiver.borrow_and_update().clone();
        self.current = snap.clone();
        Some(snap)
    }

    /// Convert into a `Stream` of snapshots for combinator use.
    pub fn into_stream(self) -> SnapshotStream<T> {
        SnapshotStream {
            inner: WatchStream::new(self.receiver),
        }
    }
}

/// `Stream` adapter yielding a fresh snapshot per store mutation.
pub struct SnapshotStream<T: Clone + Send + Sync + 'static> {
    inner: WatchStream<Arc<Vec<Arc<T>>>>,
}

impl<T: Clone + Send + Sync + 'static> Stream for SnapshotStream<T> {
    type Item = Arc<Vec<Arc<T>>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // Arc<Vec<Arc<T>>> is Unpin, so WatchStream is too.
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::convert::{EntityChange, StoreChange};
    use crate::model::{EntityId, Vehicle, VehicleClass, VehicleStatus};
    use crate::store::LiveStore;

    fn vehicle(id: &str) -> Vehicle {
        Vehicle {
            id: EntityId::from(id),
            name: id.to_owned(),
            class: VehicleClass::Standard,
            status: VehicleStatus::Available,
            location: None,
        }
    }

    #[tokio::test]
    async fn changed_yields_the_new_snapshot() {
        let store = LiveStore::new();
        let mut stream = store.vehicle_stream();
        assert!(stream.current().is_empty());

        store.apply(StoreChange::Vehicle(EntityChange::Insert(vehicle("veh-1"))));

        let snap = stream.changed().await.unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(stream.current().len(), 1);
    }

    #[tokio::test]
    async fn latest_sees_mutations_without_awaiting() {
        let store = LiveStore::new();
        let stream = store.vehicle_stream();

        store.apply(StoreChange::Vehicle(EntityChange::Insert(vehicle("veh-1"))));

        assert!(stream.current().is_empty());
        assert_eq!(stream.latest().len(), 1);
    }
}
