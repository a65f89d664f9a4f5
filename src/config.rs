use std::net::SocketAddr;

/// Compute image configuration for provisioned nodes.
#[derive(Debug, Clone)]
pub struct ImageConfig {
    /// Image used when a job spec does not name one.
    pub default_image: String,
    /// Image allowlist checked at submission. Empty means any non-empty
    /// image reference is accepted.
    pub allowed_images: Vec<String>,
    /// Entrypoint the node runs on boot (rendezvous, then sampling).
    pub entrypoint: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            default_image: "sampler:latest".to_string(),
            allowed_images: Vec::new(),
            entrypoint: "re-node".to_string(),
        }
    }
}

impl ImageConfig {
    pub fn is_allowed(&self, image: &str) -> bool {
        if image.is_empty() {
            return false;
        }
        self.allowed_images.is_empty() || self.allowed_images.iter().any(|i| i == image)
    }
}

/// Metrics sink configuration. Delivery is best-effort; an unset address
/// disables emission entirely.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Graphite plaintext endpoint, host:port.
    pub graphite_addr: Option<String>,
    pub prefix: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            graphite_addr: None,
            prefix: "replex".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// REST API listen address.
    pub listen_addr: SocketAddr,
    /// Cluster-wide cap on concurrently allocated nodes.
    pub max_cluster_nodes: u32,
    pub reconcile_interval_ms: u64,
    /// Bound on how long a node group may take to reach full readiness.
    pub provision_timeout_ms: u64,
    /// A running job fails with `heartbeat_lost` once its newest heartbeat
    /// is older than this.
    pub liveness_timeout_ms: u64,
    /// Groups whose owning job is terminal or unknown are reclaimed after
    /// this grace period.
    pub idle_grace_ms: u64,
    pub task_max_attempts: u32,
    pub task_backoff_base_ms: u64,
    pub task_backoff_cap_ms: u64,
    pub task_workers: usize,
    /// How many individual node replacements a group gets before it is
    /// degraded and the job fails.
    pub node_replace_budget: u32,
    pub image: ImageConfig,
    pub metrics: MetricsConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            // SAFETY: hardcoded valid address that always parses
            listen_addr: "127.0.0.1:8080"
                .parse()
                .expect("default listen address is valid"),
            max_cluster_nodes: 16,
            reconcile_interval_ms: 500,
            provision_timeout_ms: 120_000,
            liveness_timeout_ms: 30_000,
            idle_grace_ms: 60_000,
            task_max_attempts: 5,
            task_backoff_base_ms: 200,
            task_backoff_cap_ms: 10_000,
            task_workers: 4,
            node_replace_budget: 2,
            image: ImageConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn new(listen_addr: SocketAddr, max_cluster_nodes: u32) -> Self {
        Self {
            listen_addr,
            max_cluster_nodes,
            ..Default::default()
        }
    }

    pub fn with_image(mut self, image: ImageConfig) -> Self {
        self.image = image;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsConfig) -> Self {
        self.metrics = metrics;
        self
    }
}
