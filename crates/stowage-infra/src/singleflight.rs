//! Request coalescing.
//!
//! Concurrent callers asking for the same key share one in-flight future; only
//! the first caller's work runs and its output is cloned to every waiter.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};

type Flight<T> = Shared<BoxFuture<'static, T>>;

pub struct SingleFlight<K, T>
where
    T: Clone,
{
    calls: Mutex<HashMap<K, Flight<T>>>,
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

/// Removes the leader's entry when the leader finishes or is dropped.
struct Landing<'a, K, T>
where
    K: Eq + Hash,
    T: Clone,
{
    calls: &'a Mutex<HashMap<K, Flight<T>>>,
    key: K,
}

impl<K, T> Drop for Landing<'_, K, T>
where
    K: Eq + Hash,
    T: Clone,
{
    fn drop(&mut self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key` unless a call for the same key is already in
    /// flight, in which case wait for that call instead.
    ///
    /// Returns the output and whether it was shared from another caller.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> (T, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (flight, landing) = {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            match calls.get(&key) {
                Some(flight) => (flight.clone(), None),
                None => {
                    let flight = work().boxed().shared();
                    calls.insert(key.clone(), flight.clone());
                    let landing = Landing {
                        calls: &self.calls,
                        key,
                    };
                    (flight, Some(landing))
                }
            }
        };

        let shared = landing.is_none();
        let output = flight.await;
        drop(landing);
        (output, shared)
    }

    /// Number of keys currently in flight.
    pub fn in_flight(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let flights: Arc<SingleFlight<&'static str, Result<u32, String>>> =
            Arc::new(SingleFlight::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flights = flights.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                flights
                    .run("tenant-1", move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        let mut shared = 0;
        for handle in handles {
            let (value, was_shared) = handle.await.unwrap();
            assert_eq!(value, Ok(42));
            if was_shared {
                shared += 1;
            }
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(shared, 7);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_error_is_broadcast_and_next_call_retries() {
        let flights: SingleFlight<u8, Result<u32, String>> = SingleFlight::new();
        let (first, _) = flights
            .run(1, || async { Err("boom".to_string()) })
            .await;
        assert_eq!(first, Err("boom".to_string()));

        let (second, shared) = flights.run(1, || async { Ok(7) }).await;
        assert_eq!(second, Ok(7));
        assert!(!shared);
    }

    #[tokio::test]
    async fn test_cancelled_leader_does_not_leave_stale_entry() {
        let flights: SingleFlight<u8, u32> = SingleFlight::new();
        let pending = flights.run(1, || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            1
        });
        let _ = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert_eq!(flights.in_flight(), 0);

        let (value, _) = flights.run(1, || async { 2 }).await;
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_coalesce() {
        let flights: SingleFlight<u8, u8> = SingleFlight::new();
        let (a, b) = tokio::join!(
            flights.run(1, || async { 1 }),
            flights.run(2, || async { 2 })
        );
        assert_eq!((a.0, b.0), (1, 2));
        assert!(!a.1 && !b.1);
    }
}
