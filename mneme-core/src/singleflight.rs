//! Request coalescing
//!
//! `SingleFlight` collapses concurrent calls for the same key into one
//! underlying operation. The first caller for a key becomes the leader: its
//! work is spawned as an independent task and stored in a pending map as a
//! shared future. Every caller that arrives while the work is in flight awaits
//! that same future instead of issuing its own.
//!
//! Each caller applies its own deadline. A caller that times out stops
//! waiting, but the spawned work keeps running for the remaining waiters.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

use crate::error::{MnemeError, Result};

type FlightOutput<V> = std::result::Result<V, Arc<MnemeError>>;
type Flight<V> = Shared<BoxFuture<'static, FlightOutput<V>>>;

/// Counters describing how much work was coalesced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlightStats {
    /// Underlying operations actually started
    pub executions: u64,
    /// Calls that joined an operation already in flight
    pub coalesced: u64,
}

/// Coalesces concurrent work per key
pub struct SingleFlight<K, V> {
    inflight: Arc<Mutex<HashMap<K, Flight<V>>>>,
    executions: AtomicU64,
    coalesced: AtomicU64,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty coalescer
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            executions: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    /// Run `work` for `key`, or join the run already in flight.
    ///
    /// `work` is only invoked when this caller becomes the leader. Waiting
    /// stops at `deadline` with [`MnemeError::Timeout`].
    pub async fn run<F, Fut>(&self, key: K, deadline: Instant, work: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let flight = self.join_or_lead(key, work);

        match tokio::time::timeout_at(deadline, flight).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(shared)) => Err(shared.duplicate()),
            Err(_) => Err(MnemeError::Timeout(
                "deadline elapsed while waiting for in-flight operation".to_string(),
            )),
        }
    }

    /// Whether an operation for `key` is currently in flight
    pub fn is_inflight(&self, key: &K) -> bool {
        self.inflight.lock().contains_key(key)
    }

    /// Coalescing counters
    pub fn stats(&self) -> FlightStats {
        FlightStats {
            executions: self.executions.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        }
    }

    fn join_or_lead<F, Fut>(&self, key: K, work: F) -> Flight<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let mut inflight = self.inflight.lock();
        if let Some(existing) = inflight.get(&key) {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            return existing.clone();
        }

        self.executions.fetch_add(1, Ordering::Relaxed);

        let pending = Arc::clone(&self.inflight);
        let task_key = key.clone();
        let fut = work();
        // The map lock is held until the flight is inserted, so the task's
        // removal always observes its own entry.
        let handle = tokio::spawn(async move {
            let output = fut.await.map_err(Arc::new);
            pending.lock().remove(&task_key);
            output
        });

        let flight = async move {
            match handle.await {
                Ok(output) => output,
                Err(join_error) => Err(Arc::new(MnemeError::Other(format!(
                    "in-flight task failed: {}",
                    join_error
                )))),
            }
        }
        .boxed()
        .shared();

        inflight.insert(key, flight.clone());
        flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls_share_one_execution() {
        let flights = Arc::new(SingleFlight::<String, u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let deadline = Instant::now() + Duration::from_secs(5);

        let mut handles = Vec::new();
        for _ in 0..32 {
            let flights = Arc::clone(&flights);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                flights
                    .run("wraith".to_string(), deadline, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(7)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flights.stats().executions, 1);
        assert_eq!(flights.stats().coalesced, 31);
        assert!(!flights.is_inflight(&"wraith".to_string()));
    }

    #[tokio::test]
    async fn test_errors_fan_out_to_all_waiters() {
        let flights = SingleFlight::<&'static str, u32>::new();
        let deadline = Instant::now() + Duration::from_secs(5);

        let (a, b) = tokio::join!(
            flights.run("ghoul", deadline, || async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err(MnemeError::NotFound("ghoul".into()))
            }),
            flights.run("ghoul", deadline, || async { Ok(1) }),
        );

        assert!(matches!(a, Err(MnemeError::NotFound(_))));
        assert!(matches!(b, Err(MnemeError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_timed_out_caller_does_not_cancel_work() {
        let flights = Arc::new(SingleFlight::<&'static str, u32>::new());
        let finished = Arc::new(AtomicUsize::new(0));

        let short = Instant::now() + Duration::from_millis(10);
        let done = Arc::clone(&finished);
        let timed_out = flights
            .run("banshee", short, || async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok(3)
            })
            .await;
        assert!(matches!(timed_out, Err(MnemeError::Timeout(_))));

        // A later waiter joins the same flight and sees its result.
        let long = Instant::now() + Duration::from_secs(5);
        let joined = flights
            .run("banshee", long, || async { Ok(99) })
            .await
            .unwrap();
        assert_eq!(joined, 3);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
