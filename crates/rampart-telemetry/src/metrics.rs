//! Prometheus metrics registry for the release pipeline.

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};

/// Rollout duration buckets (in seconds).
/// Covers 10ms to 2min, registry writes plus retries.
const ROLLOUT_BUCKETS: [f64; 10] = [0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0, 15.0, 60.0, 120.0];

/// Release attempt labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReleaseLabels {
    pub source: String,
    pub outcome: String,
}

/// Rollout labels (one rollout per data plane per attempt).
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RolloutLabels {
    pub kind: String,
    pub status: String,
}

/// Registry sync labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RegistrySyncLabels {
    pub backend: String,
    pub result: String,
}

/// Metrics registry holding all control plane metrics.
pub struct MetricsRegistry {
    /// The prometheus-client registry for encoding.
    pub registry: Registry,

    pub releases_total: Family<ReleaseLabels, Counter>,
    pub rollouts_total: Family<RolloutLabels, Counter>,
    pub rollout_duration_seconds: Family<RolloutLabels, Histogram>,
    pub rollouts_in_flight: Gauge,
    pub rollout_retries_total: Counter,
    pub registry_sync_total: Family<RegistrySyncLabels, Counter>,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let releases_total = Family::<ReleaseLabels, Counter>::default();
        registry.register(
            "rampart_releases_total",
            "Release attempts by trigger source and outcome",
            releases_total.clone(),
        );

        let rollouts_total = Family::<RolloutLabels, Counter>::default();
        registry.register(
            "rampart_rollouts_total",
            "Finished per-data-plane rollouts by kind and terminal status",
            rollouts_total.clone(),
        );

        let rollout_duration_seconds =
            Family::<RolloutLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(ROLLOUT_BUCKETS.iter().cloned())
            });
        registry.register(
            "rampart_rollout_duration_seconds",
            "Rollout duration from claim to terminal status in seconds",
            rollout_duration_seconds.clone(),
        );

        let rollouts_in_flight = Gauge::default();
        registry.register(
            "rampart_rollouts_in_flight",
            "Number of rollouts currently being executed",
            rollouts_in_flight.clone(),
        );

        let rollout_retries_total = Counter::default();
        registry.register(
            "rampart_rollout_retries_total",
            "Rollouts rescheduled after a transient registry failure",
            rollout_retries_total.clone(),
        );

        let registry_sync_total = Family::<RegistrySyncLabels, Counter>::default();
        registry.register(
            "rampart_registry_sync_total",
            "Registry prefix syncs by backend and result",
            registry_sync_total.clone(),
        );

        Self {
            registry,
            releases_total,
            rollouts_total,
            rollout_duration_seconds,
            rollouts_in_flight,
            rollout_retries_total,
            registry_sync_total,
        }
    }

    /// Record a release attempt (`accepted` or `rejected`).
    pub fn record_release(&self, source: &str, outcome: &str) {
        let labels = ReleaseLabels {
            source: source.to_string(),
            outcome: outcome.to_string(),
        };
        self.releases_total.get_or_create(&labels).inc();
    }

    /// Mark a rollout as started.
    pub fn rollout_started(&self) {
        self.rollouts_in_flight.inc();
    }

    /// Record a finished rollout.
    pub fn record_rollout(&self, kind: &str, status: &str, duration_secs: f64) {
        self.rollouts_in_flight.dec();
        let labels = RolloutLabels {
            kind: kind.to_string(),
            status: status.to_string(),
        };
        self.rollouts_total.get_or_create(&labels).inc();
        self.rollout_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a rollout that will be retried later.
    pub fn record_rollout_retry(&self) {
        self.rollouts_in_flight.dec();
        self.rollout_retries_total.inc();
    }

    /// Record a registry sync.
    pub fn record_registry_sync(&self, backend: &str, ok: bool) {
        let labels = RegistrySyncLabels {
            backend: backend.to_string(),
            result: if ok { "ok" } else { "error" }.to_string(),
        };
        self.registry_sync_total.get_or_create(&labels).inc();
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
