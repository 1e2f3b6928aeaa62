//! At-most-one outstanding async operation with shared-result fan-out.
//!
//! The first caller starts the work; everyone arriving while it runs joins
//! the same `Shared` future. The flight empties its slot when it settles, so
//! the next caller after settlement starts fresh work.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;

/// Handle to a flight; clone freely and await from any number of callers.
pub type Flight<T> = Shared<BoxFuture<'static, T>>;

struct Slot<T> {
    id: u64,
    flight: Flight<T>,
}

/// A pending-operation slot.
pub struct SingleFlight<T> {
    slot: Arc<Mutex<Option<Slot<T>>>>,
    next_id: AtomicU64,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the outstanding flight, or start one with `start`.
    ///
    /// `start` runs under the slot lock and must only construct the future.
    pub fn join_or_start<F, Fut>(&self, start: F) -> Flight<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut slot = self.slot.lock();
        if let Some(current) = slot.as_ref() {
            return current.flight.clone();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let work = start();
        let owner = Arc::clone(&self.slot);
        let flight = async move {
            let output = work.await;
            let mut slot = owner.lock();
            if slot.as_ref().is_some_and(|s| s.id == id) {
                *slot = None;
            }
            output
        }
        .boxed()
        .shared();

        *slot = Some(Slot {
            id,
            flight: flight.clone(),
        });
        flight
    }

    pub fn is_in_flight(&self) -> bool {
        self.slot.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let flights = SingleFlight::<u32>::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let start = |runs: Arc<AtomicUsize>| {
            move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                42
            }
        };
        let a = flights.join_or_start(start(Arc::clone(&runs)));
        let b = flights.join_or_start(start(Arc::clone(&runs)));
        assert!(flights.is_in_flight());

        let (a, b) = futures::join!(a, b);
        assert_eq!((a, b), (42, 42));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!flights.is_in_flight());
    }

    #[tokio::test]
    async fn settled_flight_is_not_reused() {
        let flights = SingleFlight::<usize>::new();
        let runs = Arc::new(AtomicUsize::new(0));

        for expected in 1..=2 {
            let runs = Arc::clone(&runs);
            let value = flights
                .join_or_start(move || async move { runs.fetch_add(1, Ordering::SeqCst) + 1 })
                .await;
            assert_eq!(value, expected);
        }
    }

    #[tokio::test]
    async fn unpolled_flight_is_joined_later() {
        let flights = SingleFlight::<&'static str>::new();
        let first = flights.join_or_start(|| async { "first" });
        drop(first);
        let second = flights.join_or_start(|| async { "second" });
        assert_eq!(second.await, "first");
    }
}
