//! Audit and event callbacks of the release pipeline.

use std::sync::Arc;

use rampart_telemetry::MetricsRegistry;
use uuid::Uuid;

use super::policy::TriggerSource;
use crate::db::ReleaseHistory;

/// The call a set of histories belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptContext {
    pub attempt_id: Uuid,
    pub gateway_id: Uuid,
    pub stage_id: Uuid,
    pub source: TriggerSource,
    pub operator: String,
}

/// Receives release events in order: one validation outcome per attempt,
/// then `task_doing` and one terminal event per data plane.
pub trait ReleaseReporter: Send + Sync {
    fn validate_success(&self, attempt: &AttemptContext);

    fn validate_failure(&self, attempt: &AttemptContext, message: &str);

    fn task_doing(&self, history: &ReleaseHistory);

    fn rollout_succeeded(&self, history: &ReleaseHistory);

    fn rollout_failed(&self, history: &ReleaseHistory, message: &str);
}

/// Logs structured events and counts release attempts.
pub struct TracingReporter {
    metrics: Arc<MetricsRegistry>,
}

impl TracingReporter {
    pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
        Self { metrics }
    }
}

impl ReleaseReporter for TracingReporter {
    fn validate_success(&self, attempt: &AttemptContext) {
        self.metrics
            .record_release(attempt.source.as_str(), "accepted");
        rampart_telemetry::log_release_validated!(
            attempt_id = %attempt.attempt_id,
            gateway_id = %attempt.gateway_id,
            stage_id = %attempt.stage_id,
            source = attempt.source.as_str(),
            operator = %attempt.operator,
        );
    }

    fn validate_failure(&self, attempt: &AttemptContext, message: &str) {
        self.metrics
            .record_release(attempt.source.as_str(), "rejected");
        rampart_telemetry::log_release_rejected!(
            attempt_id = %attempt.attempt_id,
            gateway_id = %attempt.gateway_id,
            stage_id = %attempt.stage_id,
            source = attempt.source.as_str(),
            error = message,
        );
    }

    fn task_doing(&self, history: &ReleaseHistory) {
        rampart_telemetry::log_rollout_started!(
            release_history_id = %history.id,
            attempt_id = %history.attempt_id,
            data_plane_id = ?history.data_plane_id,
        );
    }

    fn rollout_succeeded(&self, history: &ReleaseHistory) {
        rampart_telemetry::log_rollout_succeeded!(
            release_history_id = %history.id,
            attempt_id = %history.attempt_id,
            data_plane_id = ?history.data_plane_id,
        );
    }

    fn rollout_failed(&self, history: &ReleaseHistory, message: &str) {
        rampart_telemetry::log_rollout_failed!(
            release_history_id = %history.id,
            attempt_id = %history.attempt_id,
            data_plane_id = ?history.data_plane_id,
            error = message,
        );
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rampart_telemetry::metrics::ReleaseLabels;

    #[test]
    fn tracing_reporter_counts_outcomes() {
        let metrics = Arc::new(MetricsRegistry::new());
        let reporter = TracingReporter::new(Arc::clone(&metrics));
        let attempt = AttemptContext {
            attempt_id: Uuid::new_v4(),
            gateway_id: Uuid::new_v4(),
            stage_id: Uuid::new_v4(),
            source: TriggerSource::VersionPublish,
            operator: "admin".into(),
        };

        reporter.validate_success(&attempt);
        reporter.validate_failure(&attempt, "stage is inactive");

        for outcome in ["accepted", "rejected"] {
            let labels = ReleaseLabels {
                source: "version_publish".into(),
                outcome: outcome.into(),
            };
            assert_eq!(metrics.releases_total.get_or_create(&labels).get(), 1);
        }
    }
}
