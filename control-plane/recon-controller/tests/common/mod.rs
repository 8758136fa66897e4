#![allow(dead_code)]

use std::time::Duration;

use recon_controller::ControllerRuntime;
use recon_controller::config::{ControllerConfig, ReconcileConfig};
use recon_core::{
    InMemoryStore, ObjectKey, Resource, ResourceSpec, Status, Store,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(5);

/// Fast settings: tiny backoff, no resync, no deadline.
pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        profile: "dev".into(),
        workers: Some(2),
        seed_file: None,
        finalizer_domain: "test.recon.io".into(),
        reconcile: ReconcileConfig {
            min_requeue_secs: 1,
            resync_secs: Some(0),
            timeout_secs: Some(0),
            backoff_base_ms: 10,
            backoff_max_secs: 1,
        },
    }
}

/// Background controller stopped on drop.
pub struct ControllerGuard {
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ControllerGuard {
    pub fn start<S: ResourceSpec>(runtime: ControllerRuntime<S>) -> Self {
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(runtime.run(shutdown.clone()));
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await.expect("controller task");
        }
    }
}

impl Drop for ControllerGuard {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Poll until `pred` holds for the stored resource, or panic after `WAIT`.
pub async fn wait_for<S, F>(
    store: &InMemoryStore<S>,
    key: &ObjectKey,
    what: &str,
    pred: F,
) -> Resource<S>
where
    S: ResourceSpec,
    F: Fn(&Resource<S>) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some(res) = store.get(key).await.expect("store get") {
            if pred(&res) {
                return res;
            }
        }
        if tokio::time::Instant::now() > deadline {
            let current = store.get(key).await.expect("store get");
            panic!("timed out waiting for {key} to be {what}: {current:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_for_status<S: ResourceSpec>(
    store: &InMemoryStore<S>,
    key: &ObjectKey,
    status: Status,
) -> Resource<S> {
    wait_for(store, key, &format!("{status:?}"), |r| {
        r.status.status == status
    })
    .await
}

pub async fn wait_for_gone<S: ResourceSpec>(
    store: &InMemoryStore<S>,
    key: &ObjectKey,
) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while store.get(key).await.expect("store get").is_some() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {key} to be removed");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Metadata-only write, which is enough to trigger a new reconcile.
/// Retries when the controller wins the race for the revision.
pub async fn touch<S: ResourceSpec>(
    store: &InMemoryStore<S>,
    key: &ObjectKey,
) {
    for _ in 0..50 {
        let mut res =
            store.get(key).await.expect("store get").expect("exists");
        let n = res
            .metadata
            .labels
            .get("touched")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        res.metadata.labels.insert("touched".into(), (n + 1).to_string());
        match store.update(&res).await {
            Ok(_) => return,
            Err(e) if e.is_conflict() => continue,
            Err(e) => panic!("touch {key}: {e}"),
        }
    }
    panic!("touch {key}: kept conflicting");
}

/// Spec change, retried on conflict like [`touch`].
pub async fn edit_spec<S, F>(
    store: &InMemoryStore<S>,
    key: &ObjectKey,
    edit: F,
) where
    S: ResourceSpec,
    F: Fn(&mut S),
{
    for _ in 0..50 {
        let mut res =
            store.get(key).await.expect("store get").expect("exists");
        edit(&mut res.spec);
        match store.update(&res).await {
            Ok(_) => return,
            Err(e) if e.is_conflict() => continue,
            Err(e) => panic!("edit {key}: {e}"),
        }
    }
    panic!("edit {key}: kept conflicting");
}
