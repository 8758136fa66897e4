use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use recon_core::{
    Action, ErrorKind, ObjectKey, ReconcileLoop, ResourceSpec, Store,
};
use tokio::sync::{Mutex, broadcast::error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::ControllerConfig;
use crate::queue::WorkQueue;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub workers: usize,
    pub resync: Option<Duration>,
    pub timeout: Option<Duration>,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RuntimeSettings {
    pub fn from_config(cfg: &ControllerConfig) -> Self {
        Self {
            workers: cfg.workers(),
            resync: cfg.reconcile.resync_interval(),
            timeout: cfg.reconcile.timeout(),
            backoff_base: cfg.reconcile.backoff_base(),
            backoff_max: cfg.reconcile.backoff_max(),
        }
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            resync: None,
            timeout: None,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(300),
        }
    }
}

/// Per-key exponential backoff for retryable failures.
struct Backoff {
    base: Duration,
    max: Duration,
    attempts: Mutex<HashMap<ObjectKey, u32>>,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    async fn next_delay(&self, key: &ObjectKey) -> Duration {
        let mut attempts = self.attempts.lock().await;
        let n = attempts.entry(key.clone()).or_insert(0);
        let factor = 1u32 << (*n).min(20);
        *n = n.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    async fn reset(&self, key: &ObjectKey) {
        self.attempts.lock().await.remove(key);
    }
}

/// Drives one [`ReconcileLoop`]: store events and periodic resyncs feed a
/// [`WorkQueue`], a fixed pool of workers drains it.
pub struct ControllerRuntime<S: ResourceSpec> {
    reconciler: Arc<ReconcileLoop<S>>,
    settings: RuntimeSettings,
    backoff: Arc<Backoff>,
}

impl<S: ResourceSpec> ControllerRuntime<S> {
    pub fn new(
        reconciler: ReconcileLoop<S>,
        settings: RuntimeSettings,
    ) -> Self {
        let backoff = Arc::new(Backoff::new(
            settings.backoff_base,
            settings.backoff_max,
        ));
        Self {
            reconciler: Arc::new(reconciler),
            settings,
            backoff,
        }
    }

    pub fn kind(&self) -> &'static str {
        S::KIND
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// Run until `shutdown` is cancelled. In-flight invocations see the
    /// cancellation through their own token and stop at the next step
    /// boundary.
    pub async fn run(self, shutdown: CancellationToken) {
        let kind = S::KIND;
        let store = self.reconciler.store().clone();
        let queue = WorkQueue::new(shutdown.child_token());
        // Subscribe before the initial list so nothing slips in between.
        let events = store.watch();
        enqueue_all(store.as_ref(), &queue).await;

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(
            watch_loop(events, queue.clone(), shutdown.clone())
                .instrument(info_span!("watch", kind)),
        ));
        if let Some(every) = self.settings.resync {
            let resync = resync_loop(
                store.clone(),
                queue.clone(),
                every,
                shutdown.clone(),
            );
            tasks.push(tokio::spawn(
                resync.instrument(info_span!("resync", kind)),
            ));
        }
        for id in 0..self.settings.workers.max(1) {
            let worker = Worker {
                reconciler: self.reconciler.clone(),
                queue: queue.clone(),
                backoff: self.backoff.clone(),
                timeout: self.settings.timeout,
                shutdown: shutdown.clone(),
            };
            tasks.push(tokio::spawn(
                worker.run().instrument(info_span!("worker", kind, id)),
            ));
        }
        info!(kind, workers = self.settings.workers, "controller started");

        for res in join_all(tasks).await {
            if let Err(e) = res {
                error!(kind, error = %e, "controller task panicked");
            }
        }
        info!(kind, "controller stopped");
    }
}

async fn enqueue_all<S: ResourceSpec>(
    store: &dyn Store<S>,
    queue: &WorkQueue<ObjectKey>,
) {
    match store.list().await {
        Ok(all) => {
            debug!(count = all.len(), "enqueue all");
            for res in all {
                queue.add(res.key()).await;
            }
        }
        Err(e) => warn!(error = %e, "list failed; waiting for next resync"),
    }
}

async fn watch_loop(
    mut events: tokio::sync::broadcast::Receiver<recon_core::WatchEvent>,
    queue: WorkQueue<ObjectKey>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(event) => queue.add(event.key().clone()).await,
            Err(RecvError::Lagged(missed)) => {
                // The next resync picks up whatever was dropped.
                warn!(missed, "watch lagged");
            }
            Err(RecvError::Closed) => {
                debug!("watch closed");
                break;
            }
        }
    }
}

async fn resync_loop<S: ResourceSpec>(
    store: Arc<dyn Store<S>>,
    queue: WorkQueue<ObjectKey>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    // The first tick fires immediately; the initial list already ran.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => enqueue_all(store.as_ref(), &queue).await,
        }
    }
}

struct Worker<S: ResourceSpec> {
    reconciler: Arc<ReconcileLoop<S>>,
    queue: WorkQueue<ObjectKey>,
    backoff: Arc<Backoff>,
    timeout: Option<Duration>,
    shutdown: CancellationToken,
}

impl<S: ResourceSpec> Worker<S> {
    async fn run(self) {
        while let Some(key) = self.queue.next().await {
            self.process(&key).await;
            self.queue.done(&key).await;
        }
    }

    async fn process(&self, key: &ObjectKey) {
        let token = self.shutdown.child_token();
        let deadline = self.timeout.map(|after| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                token.cancel();
            })
        });
        let result = self.reconciler.reconcile(key, &token).await;
        if let Some(deadline) = deadline {
            deadline.abort();
        }

        match result {
            Ok(action) => {
                self.backoff.reset(key).await;
                self.requeue(key, action).await;
            }
            Err(e) => match e.kind() {
                ErrorKind::NotFound => {
                    self.backoff.reset(key).await;
                    debug!(%key, "gone while reconciling");
                }
                ErrorKind::Critical => {
                    // Stays failed until the resource changes again.
                    self.backoff.reset(key).await;
                    error!(%key, error = %e, "reconcile failed permanently");
                }
                ErrorKind::Conflict => {
                    debug!(%key, error = %e, "conflict; retrying fresh");
                    self.queue.add(key.clone()).await;
                }
                ErrorKind::Retryable => {
                    let delay = self.backoff.next_delay(key).await;
                    warn!(
                        %key,
                        error = %e,
                        ?delay,
                        "reconcile failed; will retry"
                    );
                    self.queue.add_after(key.clone(), delay);
                }
            },
        }
    }

    async fn requeue(&self, key: &ObjectKey, action: Action) {
        if action.is_done() {
            return;
        }
        match action.requeue_after {
            Some(after) => self.queue.add_after(key.clone(), after),
            None => self.queue.add(key.clone()).await,
        }
    }
}
