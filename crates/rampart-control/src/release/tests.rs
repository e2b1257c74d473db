use std::sync::Arc;
use std::time::Duration;

use rampart_compiler::VERSION_PROBE_PATH;
use rampart_registry::RetryPolicy;
use rampart_telemetry::metrics::RolloutLabels;
use uuid::Uuid;

use super::*;
use crate::db::{DataPlaneReleaseState, HistoryStatus, ReleaseStore, RolloutSession, Status};
use crate::testing::{resource, Fixture};

fn rollout_count(fixture: &Fixture, kind: &str, status: &str) -> u64 {
    let labels = RolloutLabels {
        kind: kind.into(),
        status: status.into(),
    };
    fixture.metrics.rollouts_total.get_or_create(&labels).get()
}

#[tokio::test]
async fn release_fans_out_one_history_per_data_plane() {
    let fx = Fixture::new(&["dp-a", "dp-b"]);

    let ticket = fx.orchestrator.release(fx.release_request()).await.unwrap();
    assert_eq!(ticket.release_history_ids.len(), 2);
    assert_eq!(ticket.release_history_id, ticket.release_history_ids[0]);

    let histories = fx.store.attempt_histories(ticket.attempt_id).await.unwrap();
    assert_eq!(histories.len(), 2);
    assert!(histories.iter().all(|h| h.status == HistoryStatus::Doing));

    let pointer = fx
        .orchestrator
        .get_release(fx.gateway.id, fx.stage.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pointer.resource_version_id, fx.version.id);

    let events = fx.reporter.events();
    assert_eq!(events[0], "validate_success");
    assert!(events[1].starts_with("task_doing:"));
    assert!(events[2].starts_with("task_doing:"));

    assert_eq!(fx.dispatcher.drain().await.unwrap(), 2);

    for history in fx.store.attempt_histories(ticket.attempt_id).await.unwrap() {
        assert_eq!(history.status, HistoryStatus::Success);
        assert!(history.finished_at.is_some());
    }
    // One service, the resource route and the version probe.
    assert_eq!(fx.backend(0).len(), 3);
    assert_eq!(fx.backend(1).len(), 3);
    assert_eq!(fx.store.pending_jobs().await.unwrap(), 0);
    assert_eq!(rollout_count(&fx, "rollout", "success"), 2);
}

#[tokio::test]
async fn failing_data_plane_does_not_affect_the_other() {
    let fx = Fixture::new(&["dp-a", "dp-b"]);
    fx.backend(0).set_unavailable(true);

    let ticket = fx.orchestrator.release(fx.release_request()).await.unwrap();
    fx.dispatcher.drain().await.unwrap();

    let histories = fx.store.attempt_histories(ticket.attempt_id).await.unwrap();
    let of = |index: usize| {
        histories
            .iter()
            .find(|h| h.data_plane_id == Some(fx.data_planes[index].id))
            .unwrap()
    };
    assert_eq!(of(0).status, HistoryStatus::Failure);
    assert!(of(0).message.contains("unavailable"));
    assert_eq!(of(1).status, HistoryStatus::Success);
    assert!(fx.backend(0).is_empty());
    assert_eq!(fx.backend(1).len(), 3);
    assert!(fx
        .reporter
        .events()
        .iter()
        .any(|e| e.starts_with(&format!("rollout_failed:{}", of(0).id))));
}

#[tokio::test]
async fn zero_data_planes_is_rejected_without_pointer() {
    let fx = Fixture::new(&[]);

    let err = fx.orchestrator.release(fx.release_request()).await.unwrap_err();
    assert!(matches!(err, ReleaseError::NoActiveDataPlane(id) if id == fx.gateway.id));

    assert!(fx
        .store
        .get_release(fx.gateway.id, fx.stage.id)
        .await
        .unwrap()
        .is_none());
    let histories = fx.store.list_histories(fx.gateway.id, None).await.unwrap();
    assert_eq!(histories.len(), 1);
    assert_eq!(histories[0].status, HistoryStatus::Failure);
    assert_eq!(histories[0].data_plane_id, None);
    assert!(fx.reporter.events()[0].starts_with("validate_failure:"));
    assert_eq!(fx.store.pending_jobs().await.unwrap(), 0);
}

#[tokio::test]
async fn inactive_data_plane_is_not_a_target() {
    let fx = Fixture::new(&["dp-a", "dp-b"]);
    fx.store
        .set_data_plane_status(fx.data_planes[1].id, Status::Inactive);

    let ticket = fx.orchestrator.release(fx.release_request()).await.unwrap();
    assert_eq!(ticket.release_history_ids.len(), 1);
}

#[tokio::test]
async fn validation_failure_writes_one_failure_per_data_plane() {
    let fx = Fixture::new(&["dp-a", "dp-b"]);
    fx.store.set_stage_status(fx.stage.id, Status::Inactive);

    let err = fx.orchestrator.release(fx.release_request()).await.unwrap_err();
    assert!(matches!(err, ReleaseError::Validation(ref m) if m.contains("inactive")));

    let histories = fx.store.list_histories(fx.gateway.id, Some(fx.stage.id)).await.unwrap();
    assert_eq!(histories.len(), 2);
    assert!(histories
        .iter()
        .all(|h| h.status == HistoryStatus::Failure && h.data_plane_id.is_some()));
    assert!(fx
        .store
        .get_release(fx.gateway.id, fx.stage.id)
        .await
        .unwrap()
        .is_none());
    assert_eq!(fx.store.pending_jobs().await.unwrap(), 0);
    assert_eq!(fx.reporter.events().len(), 1);
}

#[tokio::test]
async fn stage_enable_may_release_an_inactive_stage() {
    let fx = Fixture::new(&["dp-a"]);
    fx.store.set_stage_status(fx.stage.id, Status::Inactive);

    let mut request = fx.release_request();
    request.source = TriggerSource::StageEnable;
    assert!(fx.orchestrator.release(request).await.is_ok());
}

#[tokio::test]
async fn legacy_schema_is_rejected() {
    let fx = Fixture::new(&["dp-a"]);
    let mut legacy = fx.version.clone();
    legacy.id = Uuid::new_v4();
    legacy.schema_version = "1.0".into();
    fx.store.insert_resource_version(legacy.clone());

    let mut request = fx.release_request();
    request.resource_version_id = legacy.id;
    let err = fx.orchestrator.release(request).await.unwrap_err();
    assert!(matches!(err, ReleaseError::LegacySchema(ref v) if v == "1.0"));
}

#[tokio::test]
async fn undefined_stage_variable_is_a_validation_error() {
    let fx = Fixture::new(&["dp-a"]);
    let version = fx.add_version(vec![resource(
        "get_pet",
        "/pets/{id}",
        fx.backend_id(),
        "/{env.missing}/pets",
    )]);

    let mut request = fx.release_request();
    request.resource_version_id = version.id;
    let err = fx.orchestrator.release(request).await.unwrap_err();
    assert!(matches!(err, ReleaseError::Validation(ref m) if m.contains("missing")));
}

#[tokio::test]
async fn version_of_another_gateway_is_not_found() {
    let fx = Fixture::new(&["dp-a"]);
    let mut foreign = fx.version.clone();
    foreign.id = Uuid::new_v4();
    foreign.gateway_id = Uuid::new_v4();
    fx.store.insert_resource_version(foreign.clone());

    let mut request = fx.release_request();
    request.resource_version_id = foreign.id;
    let err = fx.orchestrator.release(request).await.unwrap_err();
    assert!(matches!(err, ReleaseError::NotFound { kind: "resource version", .. }));
}

#[tokio::test]
async fn stale_rollout_is_superseded() {
    let fx = Fixture::new(&["dp-a"]);
    let first = fx.orchestrator.release(fx.release_request()).await.unwrap();
    let second = fx.orchestrator.release(fx.release_request()).await.unwrap();
    assert!(second.release_history_id > first.release_history_id);

    // The newer attempt reached the data plane first.
    let mut session = fx
        .store
        .begin_rollout(fx.gateway.id, fx.stage.id, fx.data_planes[0].id)
        .await
        .unwrap();
    let state = DataPlaneReleaseState {
        gateway_id: fx.gateway.id,
        stage_id: fx.stage.id,
        data_plane_id: fx.data_planes[0].id,
        release_history_id: second.release_history_id,
        resource_version_id: Some(fx.version.id),
        updated_at: chrono::Utc::now(),
    };
    assert!(session.advance(&state).await.unwrap());
    let older = DataPlaneReleaseState {
        release_history_id: first.release_history_id,
        ..state
    };
    assert!(!session.advance(&older).await.unwrap());
    session.commit().await.unwrap();

    fx.dispatcher.drain().await.unwrap();

    let stale = fx.store.get_history(first.release_history_id).await.unwrap().unwrap();
    assert_eq!(stale.status, HistoryStatus::Failure);
    assert_eq!(stale.message, SUPERSEDED_MESSAGE);
    let fresh = fx.store.get_history(second.release_history_id).await.unwrap().unwrap();
    assert_eq!(fresh.status, HistoryStatus::Success);

    let applied = fx
        .store
        .get_applied_state(fx.gateway.id, fx.stage.id, fx.data_planes[0].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(applied.release_history_id, second.release_history_id);
}

#[tokio::test]
async fn rollout_waits_for_a_session_held_elsewhere() {
    let fx = Fixture::new(&["dp-a"]);
    let dp = fx.data_planes[0].id;
    let ticket = fx.orchestrator.release(fx.release_request()).await.unwrap();

    // Another process is mid-rollout on the same data plane.
    let session = fx
        .store
        .begin_rollout(fx.gateway.id, fx.stage.id, dp)
        .await
        .unwrap();
    let dispatcher = Arc::clone(&fx.dispatcher);
    let drain = tokio::spawn(async move { dispatcher.drain().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!drain.is_finished());
    let history = fx.store.get_history(ticket.release_history_id).await.unwrap().unwrap();
    assert_eq!(history.status, HistoryStatus::Doing);
    assert!(fx.backend(0).is_empty());

    session.commit().await.unwrap();
    assert_eq!(drain.await.unwrap().unwrap(), 1);
    let history = fx.store.get_history(ticket.release_history_id).await.unwrap().unwrap();
    assert_eq!(history.status, HistoryStatus::Success);
    assert!(history.message.starts_with("released, checksum "));
}

#[tokio::test]
async fn older_rollout_never_lands_after_a_newer_one_across_dispatchers() {
    let fx = Fixture::new(&["dp-a"]);
    let v1 = fx.orchestrator.release(fx.release_request()).await.unwrap();

    let newer = resource("list_toys", "/toys", fx.backend_id(), "/toys");
    let version = fx.add_version(vec![newer.clone()]);
    let mut request = fx.release_request();
    request.resource_version_id = version.id;
    let v2 = fx.orchestrator.release(request).await.unwrap();

    let a = fx.peer_dispatcher(1);
    let b = fx.peer_dispatcher(1);
    let (ran_a, ran_b) = tokio::join!(a.drain(), b.drain());
    assert_eq!(ran_a.unwrap() + ran_b.unwrap(), 2);

    let fresh = fx.store.get_history(v2.release_history_id).await.unwrap().unwrap();
    assert_eq!(fresh.status, HistoryStatus::Success);
    let stale = fx.store.get_history(v1.release_history_id).await.unwrap().unwrap();
    assert!(stale.status.is_terminal());

    assert_eq!(fx.keys_of(0, newer.id).len(), 1);
    assert!(fx.keys_of(0, fx.version.resources[0].id).is_empty());
    let applied = fx
        .store
        .get_applied_state(fx.gateway.id, fx.stage.id, fx.data_planes[0].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(applied.release_history_id, v2.release_history_id);
}

#[tokio::test]
async fn removed_resources_are_deleted_from_the_registry() {
    let fx = Fixture::new(&["dp-a"]);
    let kept = resource("list_pets", "/pets", fx.backend_id(), "/pets");
    let dropped = resource("list_toys", "/toys", fx.backend_id(), "/toys");
    let v1 = fx.add_version(vec![kept.clone(), dropped.clone()]);
    let v2 = fx.add_version(vec![kept.clone()]);

    let mut request = fx.release_request();
    request.resource_version_id = v1.id;
    fx.orchestrator.release(request.clone()).await.unwrap();
    fx.dispatcher.drain().await.unwrap();
    // One service, two routes and the version probe.
    assert_eq!(fx.backend(0).len(), 4);
    assert_eq!(fx.keys_of(0, dropped.id).len(), 1);

    request.resource_version_id = v2.id;
    fx.orchestrator.release(request).await.unwrap();
    fx.dispatcher.drain().await.unwrap();

    assert_eq!(fx.backend(0).len(), 3);
    assert!(fx.keys_of(0, dropped.id).is_empty());
    assert_eq!(fx.keys_of(0, kept.id).len(), 1);
    assert!(fx
        .backend(0)
        .keys()
        .iter()
        .any(|k| k.ends_with(VERSION_PROBE_PATH)));
}

#[tokio::test]
async fn dispatcher_locks_are_released_after_drain() {
    let fx = Fixture::new(&["dp-a", "dp-b"]);
    fx.orchestrator.release(fx.release_request()).await.unwrap();
    fx.orchestrator.release(fx.release_request()).await.unwrap();

    assert_eq!(fx.dispatcher.drain().await.unwrap(), 4);
    assert_eq!(fx.dispatcher.held_locks(), 0);
}

#[tokio::test]
async fn transient_failures_are_retried_then_fail() {
    let retry = RetryPolicy {
        max_attempts: 3,
        ..RetryPolicy::default()
    };
    let fx = Fixture::with_retry(&["dp-a"], retry);
    fx.backend(0).set_unavailable(true);

    let ticket = fx.orchestrator.release(fx.release_request()).await.unwrap();
    assert_eq!(fx.dispatcher.drain().await.unwrap(), 3);

    let history = fx
        .store
        .get_history(ticket.release_history_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(history.status, HistoryStatus::Failure);
    assert_eq!(fx.metrics.rollout_retries_total.get(), 2);
    assert_eq!(rollout_count(&fx, "rollout", "failure"), 1);
    assert_eq!(fx.metrics.rollouts_in_flight.get(), 0);
}

#[tokio::test]
async fn compile_failure_at_rollout_is_not_retried() {
    let retry = RetryPolicy {
        max_attempts: 3,
        ..RetryPolicy::default()
    };
    let fx = Fixture::with_retry(&["dp-a"], retry);
    let ticket = fx.orchestrator.release(fx.release_request()).await.unwrap();

    // The stage lost the backend between commit and rollout.
    let mut stage = fx.stage.clone();
    stage.backends.clear();
    fx.store.insert_stage(stage);

    assert_eq!(fx.dispatcher.drain().await.unwrap(), 1);
    let history = fx
        .store
        .get_history(ticket.release_history_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(history.status, HistoryStatus::Failure);
    assert!(history.message.contains("backend"));
}

#[tokio::test]
async fn revoke_on_disable_clears_registry_and_keeps_pointer() {
    let fx = Fixture::new(&["dp-a"]);
    fx.orchestrator.release(fx.release_request()).await.unwrap();
    fx.dispatcher.drain().await.unwrap();
    assert_eq!(fx.backend(0).len(), 3);

    let ticket = fx
        .orchestrator
        .revoke(RevokeRequest {
            gateway_id: fx.gateway.id,
            stage_id: fx.stage.id,
            comment: String::new(),
            operator: "admin".into(),
            source: TriggerSource::StageDisable,
        })
        .await
        .unwrap();
    fx.dispatcher.drain().await.unwrap();

    assert!(fx.backend(0).is_empty());
    let history = fx
        .store
        .get_history(ticket.release_history_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(history.status, HistoryStatus::Success);
    assert_eq!(history.message, "revoked");
    assert_eq!(history.resource_version_id, None);
    assert!(fx
        .store
        .get_release(fx.gateway.id, fx.stage.id)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn revoke_on_delete_removes_pointer() {
    let fx = Fixture::new(&["dp-a"]);
    fx.orchestrator.release(fx.release_request()).await.unwrap();
    fx.dispatcher.drain().await.unwrap();

    let ticket = fx
        .orchestrator
        .revoke(RevokeRequest {
            gateway_id: fx.gateway.id,
            stage_id: fx.stage.id,
            comment: String::new(),
            operator: "admin".into(),
            source: TriggerSource::StageDelete,
        })
        .await
        .unwrap();
    fx.dispatcher.drain().await.unwrap();

    assert!(fx.backend(0).is_empty());
    let history = fx
        .store
        .get_history(ticket.release_history_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(history.message, "revoked");
    assert!(fx
        .store
        .get_release(fx.gateway.id, fx.stage.id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn revoke_requires_a_revoking_source() {
    let fx = Fixture::new(&["dp-a"]);
    let err = fx
        .orchestrator
        .revoke(RevokeRequest {
            gateway_id: fx.gateway.id,
            stage_id: fx.stage.id,
            comment: String::new(),
            operator: "admin".into(),
            source: TriggerSource::PluginBind,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ReleaseError::Validation(_)));
}

#[tokio::test]
async fn rolling_trigger_re_releases_the_current_pointer() {
    let fx = Fixture::new(&["dp-a"]);
    fx.orchestrator.release(fx.release_request()).await.unwrap();
    fx.dispatcher.drain().await.unwrap();

    let outcome = fx
        .orchestrator
        .trigger(TriggerRequest {
            gateway_id: fx.gateway.id,
            stage_id: None,
            source: TriggerSource::BackendUpdate,
            operator: "admin".into(),
        })
        .await
        .unwrap();
    assert_eq!(outcome.policy, ReleasePolicy::RollingUpdate);
    assert_eq!(outcome.tickets.len(), 1);
    fx.dispatcher.drain().await.unwrap();

    let histories = fx.store.list_histories(fx.gateway.id, None).await.unwrap();
    assert_eq!(histories.len(), 2);
    assert_eq!(histories[0].source, TriggerSource::BackendUpdate);
    assert!(histories.iter().all(|h| h.status == HistoryStatus::Success));
}

#[tokio::test]
async fn trigger_skips_stages_without_release() {
    let fx = Fixture::new(&["dp-a"]);
    let outcome = fx
        .orchestrator
        .trigger(TriggerRequest {
            gateway_id: fx.gateway.id,
            stage_id: Some(fx.stage.id),
            source: TriggerSource::PluginUpdate,
            operator: "admin".into(),
        })
        .await
        .unwrap();
    assert!(outcome.tickets.is_empty());
    assert_eq!(outcome.skipped.len(), 1);
    assert_eq!(outcome.skipped[0].stage_id, fx.stage.id);
}

#[tokio::test]
async fn trigger_skips_inactive_stage_unless_enabling() {
    let fx = Fixture::new(&["dp-a"]);
    fx.orchestrator.release(fx.release_request()).await.unwrap();
    fx.store.set_stage_status(fx.stage.id, Status::Inactive);

    let request = |source| TriggerRequest {
        gateway_id: fx.gateway.id,
        stage_id: None,
        source,
        operator: "admin".into(),
    };
    let skipped = fx
        .orchestrator
        .trigger(request(TriggerSource::LabelUpdate))
        .await
        .unwrap();
    assert!(skipped.tickets.is_empty());

    let enabled = fx
        .orchestrator
        .trigger(request(TriggerSource::StageEnable))
        .await
        .unwrap();
    assert_eq!(enabled.tickets.len(), 1);
}

#[tokio::test]
async fn disable_trigger_revokes() {
    let fx = Fixture::new(&["dp-a"]);
    fx.orchestrator.release(fx.release_request()).await.unwrap();
    fx.dispatcher.drain().await.unwrap();

    let outcome = fx
        .orchestrator
        .trigger(TriggerRequest {
            gateway_id: fx.gateway.id,
            stage_id: None,
            source: TriggerSource::GatewayDisable,
            operator: "admin".into(),
        })
        .await
        .unwrap();
    assert_eq!(outcome.policy, ReleasePolicy::RevokeOnDisable);
    fx.dispatcher.drain().await.unwrap();
    assert!(fx.backend(0).is_empty());
}

#[tokio::test]
async fn finished_history_is_never_reopened() {
    let fx = Fixture::new(&["dp-a"]);
    let ticket = fx.orchestrator.release(fx.release_request()).await.unwrap();
    fx.dispatcher.drain().await.unwrap();

    let changed = fx
        .store
        .finish_history(
            ticket.release_history_id,
            HistoryStatus::Failure,
            "late",
            chrono::Utc::now(),
        )
        .await
        .unwrap();
    assert!(!changed);
}
