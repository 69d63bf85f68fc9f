//! At most one in-flight request per logical key.
//!
//! Submitting a request for a key that already has one in flight cancels the
//! older request and silently discards whatever it produces. Completed
//! results are sent over a channel to a single consumer loop, tagged with
//! the generation they were issued under.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::error::FetchError;

/// Result of one request, as seen by the consumer loop.
#[derive(Debug)]
pub struct Completion<K, R> {
    pub key: K,
    pub generation: u64,
    pub result: Result<R, FetchError>,
}

struct InFlight {
    generation: u64,
    cancel: CancellationToken,
    superseded: Arc<AtomicBool>,
}

pub struct SingleTaskManager<K, R> {
    inflight: Arc<Mutex<HashMap<K, InFlight>>>,
    next_generation: AtomicU64,
    tx: mpsc::Sender<Completion<K, R>>,
    tracker: TaskTracker,
}

impl<K, R> fmt::Debug for SingleTaskManager<K, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleTaskManager")
            .field("in_flight", &self.inflight.lock().len())
            .finish()
    }
}

impl<K, R> SingleTaskManager<K, R>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    R: Send + 'static,
{
    /// Creates a manager whose completions are buffered up to `capacity`.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Completion<K, R>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mgr = Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            tx,
            tracker: TaskTracker::new(),
        };
        (mgr, rx)
    }

    /// Issues a request for `key`, cancelling any request already in flight
    /// for it. The request receives a token that fires when it is
    /// superseded or cancelled. Returns the new request's generation.
    pub fn submit<F, Fut>(&self, key: K, request: F) -> u64
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<R, FetchError>> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let superseded = Arc::new(AtomicBool::new(false));

        let previous = self.inflight.lock().insert(
            key.clone(),
            InFlight {
                generation,
                cancel: cancel.clone(),
                superseded: Arc::clone(&superseded),
            },
        );
        if let Some(prev) = previous {
            debug!(key = ?key, generation = prev.generation, "superseding in-flight request");
            prev.superseded.store(true, Ordering::Release);
            prev.cancel.cancel();
        }

        let fut = request(cancel.clone());
        let inflight = Arc::clone(&self.inflight);
        let tx = self.tx.clone();

        self.tracker.spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(FetchError::Cancelled),
                r = fut => r,
            };

            if superseded.load(Ordering::Acquire) {
                return;
            }
            {
                let mut map = inflight.lock();
                if map.get(&key).is_some_and(|f| f.generation == generation) {
                    map.remove(&key);
                }
            }

            let completion = Completion {
                key,
                generation,
                result,
            };
            if tx.send(completion).await.is_err() {
                debug!(generation, "completion receiver dropped");
            }
        });

        generation
    }

    /// Cancels the in-flight request for `key`, if any. The consumer
    /// receives a [`FetchError::Cancelled`] completion for it.
    pub fn cancel(&self, key: &K) -> bool {
        match self.inflight.lock().remove(key) {
            Some(f) => {
                f.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (_, f) in self.inflight.lock().drain() {
            f.cancel.cancel();
        }
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.inflight.lock().contains_key(key)
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Cancels everything and waits for the spawned requests to finish.
    pub async fn shutdown(&self) {
        self.cancel_all();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_superseded_request_is_discarded() {
        let (mgr, mut rx) = SingleTaskManager::<&'static str, u32>::new(8);

        let first = mgr.submit("ports", |_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(1)
        });
        let second = mgr.submit("ports", |_| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(2)
        });
        assert!(second > first);

        let done = rx.recv().await.expect("completion");
        assert_eq!(done.generation, second);
        assert_eq!(done.result, Ok(2));

        mgr.shutdown().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_cancel_delivers_cancelled() {
        let (mgr, mut rx) = SingleTaskManager::<u32, u32>::new(8);

        mgr.submit(7, |token| async move {
            token.cancelled().await;
            Ok(0)
        });
        assert!(mgr.is_in_flight(&7));
        assert!(mgr.cancel(&7));
        assert!(!mgr.is_in_flight(&7));

        let done = rx.recv().await.expect("completion");
        assert_eq!(done.key, 7);
        assert_eq!(done.result, Err(FetchError::Cancelled));
    }

    #[tokio::test]
    async fn test_independent_keys_do_not_interfere() {
        let (mgr, mut rx) = SingleTaskManager::<u32, u32>::new(8);

        mgr.submit(1, |_| async { Ok(10) });
        mgr.submit(2, |_| async { Ok(20) });

        let mut got = vec![
            rx.recv().await.expect("first").result,
            rx.recv().await.expect("second").result,
        ];
        got.sort_by_key(|r| r.clone().unwrap_or_default());
        assert_eq!(got, vec![Ok(10), Ok(20)]);
        assert_eq!(mgr.in_flight(), 0);
    }
}
