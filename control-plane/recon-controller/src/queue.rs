use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Debug)]
struct QueueState<K> {
    /// Sitting in the channel, not yet handed to a worker.
    queued: HashSet<K>,
    /// Handed to a worker and not yet `done`.
    in_flight: HashSet<K>,
    /// Triggered while in flight; goes back in on `done`.
    dirty: HashSet<K>,
}

/// De-duplicating work queue of resource keys.
///
/// A key is queued at most once, and a key being processed is never handed
/// to a second worker: triggers that arrive meanwhile are folded into one
/// re-add when the worker calls [`done`](Self::done). This is what keeps
/// reconciles of one resource serialized while different resources run in
/// parallel.
pub struct WorkQueue<K> {
    tx: flume::Sender<K>,
    rx: flume::Receiver<K>,
    state: Arc<Mutex<QueueState<K>>>,
    token: CancellationToken,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            state: self.state.clone(),
            token: self.token.clone(),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + std::fmt::Debug + 'static,
{
    /// The queue stops handing out keys once `token` is cancelled.
    pub fn new(token: CancellationToken) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            tx,
            rx,
            state: Arc::new(Mutex::new(QueueState {
                queued: HashSet::new(),
                in_flight: HashSet::new(),
                dirty: HashSet::new(),
            })),
            token,
        }
    }

    pub async fn add(&self, key: K) {
        if self.token.is_cancelled() {
            return;
        }
        let mut state = self.state.lock().await;
        if state.in_flight.contains(&key) {
            trace!(?key, "in flight; marked dirty");
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            // The receiver lives in `self`, so the channel can't be closed.
            let _ = self.tx.send(key);
        }
    }

    /// Add `key` once `after` has elapsed, unless the queue shut down first.
    pub fn add_after(&self, key: K, after: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.token.cancelled() => {}
                _ = tokio::time::sleep(after) => queue.add(key).await,
            }
        });
    }

    /// Wait for the next key. `None` once the queue shut down.
    pub async fn next(&self) -> Option<K> {
        let key = tokio::select! {
            _ = self.token.cancelled() => return None,
            key = self.rx.recv_async() => key.ok()?,
        };
        let mut state = self.state.lock().await;
        state.queued.remove(&key);
        state.in_flight.insert(key.clone());
        Some(key)
    }

    /// Release a key handed out by [`next`](Self::next).
    pub async fn done(&self, key: &K) {
        let mut state = self.state.lock().await;
        state.in_flight.remove(key);
        if state.dirty.remove(key)
            && !self.token.is_cancelled()
            && state.queued.insert(key.clone())
        {
            let _ = self.tx.send(key.clone());
        }
    }

    /// Keys waiting to be handed out.
    pub async fn len(&self) -> usize {
        self.state.lock().await.queued.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }
}
