use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct ControllerConfig {
    #[envconfig(from = "RECON_PROFILE", default = "dev")]
    pub profile: String,

    /// Concurrent reconcile workers per controller (profile default: 2 in
    /// dev, one per CPU in prod).
    #[envconfig(from = "RECON_WORKERS")]
    pub workers: Option<usize>,

    /// Optional JSON file with resources to create at startup.
    #[envconfig(from = "RECON_SEED_FILE")]
    pub seed_file: Option<String>,

    /// Prefix of finalizer tokens, e.g. `recon.io/application-finalizer`.
    #[envconfig(from = "RECON_FINALIZER_DOMAIN", default = "recon.io")]
    pub finalizer_domain: String,

    #[envconfig(nested)]
    pub reconcile: ReconcileConfig,
}

#[derive(Envconfig, Clone, Debug)]
pub struct ReconcileConfig {
    /// Floor applied to every requested delayed requeue.
    #[envconfig(from = "RECON_MIN_REQUEUE_SECS", default = "5")]
    pub min_requeue_secs: u64,

    /// Full relist interval. Zero disables the sweep.
    #[envconfig(from = "RECON_RESYNC_SECS")]
    pub resync_secs: Option<u64>,

    /// Deadline of a single invocation. Zero disables it.
    #[envconfig(from = "RECON_RECONCILE_TIMEOUT_SECS")]
    pub timeout_secs: Option<u64>,

    #[envconfig(from = "RECON_BACKOFF_BASE_MS", default = "500")]
    pub backoff_base_ms: u64,

    #[envconfig(from = "RECON_BACKOFF_MAX_SECS", default = "300")]
    pub backoff_max_secs: u64,
}

impl ControllerConfig {
    /// Fill unset values from the profile; explicit env settings win.
    ///
    /// - dev: workers=2, resync=30s, timeout=30s
    /// - prod: workers=num_cpus, resync=300s, timeout=60s
    pub fn apply_profile_defaults(mut self) -> Self {
        let (def_workers, def_resync, def_timeout) = match self.profile.as_str()
        {
            "prod" | "production" | "full" => (num_cpus::get().max(1), 300, 60),
            _ /* dev */ => (2, 30, 30),
        };

        if self.workers.is_none() {
            self.workers = Some(def_workers);
        }
        if self.reconcile.resync_secs.is_none() {
            self.reconcile.resync_secs = Some(def_resync);
        }
        if self.reconcile.timeout_secs.is_none() {
            self.reconcile.timeout_secs = Some(def_timeout);
        }
        self
    }

    pub fn finalizer_token(&self, kind: &str) -> String {
        format!(
            "{}/{}-finalizer",
            self.finalizer_domain,
            kind.to_lowercase()
        )
    }

    pub fn workers(&self) -> usize {
        self.workers.unwrap_or(1).max(1)
    }
}

impl ReconcileConfig {
    /// Never below one second, so a zero setting can't busy-loop.
    pub fn min_requeue_after(&self) -> Duration {
        Duration::from_secs(self.min_requeue_secs.max(1))
    }

    pub fn resync_interval(&self) -> Option<Duration> {
        self.resync_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }
}
