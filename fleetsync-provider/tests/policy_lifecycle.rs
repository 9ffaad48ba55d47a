//! End-to-end policy lifecycle against the simulated fleet API.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{baseline, ctx, excluded, fast_config, group, recorded_resource};
use fleetsync_core::{CreateResponse, DeleteOutcome, OpContext, Phase, ReadResponse, UpdateResponse};
use fleetsync_provider::clients::{Fault, FleetApi, SimOperation, SimulatedFleetApi};
use fleetsync_provider::model::{PolicySpec, PolicyState};
use fleetsync_provider::{Manifest, OrchestratorError, Resource, apply_manifest};
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn test_create_converges_through_visibility_lag() {
    let api = Arc::new(SimulatedFleetApi::new().with_visibility_lag(3));
    let (resource, observer) = recorded_resource(api.clone(), fast_config());

    let mut response = CreateResponse::new();
    resource.create(&ctx(), &baseline(), &mut response).await.unwrap();

    let state = response.state.unwrap();
    assert_eq!(state.name, "baseline");
    assert_eq!(state.version, 1);
    assert_eq!(state.assignments.len(), 2);
    assert!(state.assignments.iter().all(|a| a.id.is_some()));
    assert!(response.diagnostics.is_empty());

    assert_eq!(observer.count(Phase::Attempt), 4);
    assert_eq!(observer.count(Phase::RetryWait), 3);
    assert_eq!(observer.phases().last(), Some(&Phase::Success));
    assert_eq!(api.actual_assignments(&state.id).await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_create_rides_out_server_errors() {
    let api = Arc::new(SimulatedFleetApi::new());
    api.inject(SimOperation::GetPolicy, Fault::unavailable()).await;
    api.inject(SimOperation::GetPolicy, Fault::throttled(Duration::from_millis(500)))
        .await;
    let (resource, observer) = recorded_resource(api.clone(), fast_config());

    let mut response = CreateResponse::new();
    resource
        .create(&ctx(), &PolicySpec::new("p"), &mut response)
        .await
        .unwrap();

    assert!(response.state.is_some());
    assert_eq!(api.calls(SimOperation::GetPolicy).await, 3);
    let waits: Vec<_> = observer
        .records()
        .into_iter()
        .filter(|r| r.phase == Phase::RetryWait)
        .filter_map(|r| r.wait)
        .collect();
    assert_eq!(
        waits,
        vec![Duration::from_millis(100), Duration::from_millis(500)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_create_keeps_id_when_read_never_converges() {
    let api = Arc::new(SimulatedFleetApi::new());
    api.inject(SimOperation::GetPolicy, Fault::throttled(Duration::from_secs(60)))
        .await;
    let (resource, observer) = recorded_resource(api.clone(), fast_config());

    let mut response = CreateResponse::new();
    let err = resource
        .create(&ctx(), &PolicySpec::new("p"), &mut response)
        .await
        .unwrap_err();

    match err {
        OrchestratorError::Retry(e) => assert!(e.is_budget_exhausted()),
        other => panic!("unexpected error: {other}"),
    }
    let state = response.state.expect("created policy id is kept");
    assert!(api.actual_policy(&state.id).await.is_some());
    assert_eq!(observer.count(Phase::BudgetExhausted), 1);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_targets_are_warned_about() {
    let api = Arc::new(SimulatedFleetApi::new());
    let (resource, _) = recorded_resource(api.clone(), fast_config());
    let spec = PolicySpec::new("p")
        .with_assignment(group("finance"))
        .with_assignment(group("finance"));

    let mut response = CreateResponse::new();
    resource.create(&ctx(), &spec, &mut response).await.unwrap();

    assert_eq!(response.diagnostics.warnings().count(), 1);
    assert!(!response.diagnostics.has_errors());
}

#[tokio::test(start_paused = true)]
async fn test_update_waits_for_new_version() {
    let api = Arc::new(SimulatedFleetApi::new().with_visibility_lag(1));
    let (resource, _) = recorded_resource(api.clone(), fast_config());

    let mut created = CreateResponse::new();
    resource.create(&ctx(), &baseline(), &mut created).await.unwrap();
    let prior = created.state.unwrap();

    let mut desired = baseline();
    desired.name = "baseline-v2".to_string();
    desired.assignments = vec![group("finance"), excluded("contractors")];

    let mut response = UpdateResponse::with_state(prior.clone());
    resource.update(&ctx(), &desired, &mut response).await.unwrap();

    let state = response.state.unwrap();
    assert_eq!(state.id, prior.id);
    assert_eq!(state.name, "baseline-v2");
    assert_eq!(state.version, 2);
    assert!(state.matches(&desired));

    let finance = |s: &PolicyState| {
        s.assignments
            .iter()
            .find(|a| a.target == group("finance").target)
            .and_then(|a| a.id.clone())
    };
    assert_eq!(finance(&state), finance(&prior));
    assert!(state.assignments.iter().any(|a| a.target.is_exclusion()));
}

#[tokio::test(start_paused = true)]
async fn test_update_with_unchanged_payload_skips_update_call() {
    let api = Arc::new(SimulatedFleetApi::new());
    let (resource, _) = recorded_resource(api.clone(), fast_config());

    let mut created = CreateResponse::new();
    resource.create(&ctx(), &baseline(), &mut created).await.unwrap();

    let mut desired = baseline();
    desired.assignments.push(excluded("kiosks"));
    let mut response = UpdateResponse::with_state(created.state.unwrap());
    resource.update(&ctx(), &desired, &mut response).await.unwrap();

    assert_eq!(api.calls(SimOperation::UpdatePolicy).await, 0);
    assert_eq!(api.calls(SimOperation::CreateAssignment).await, 3);
    assert_eq!(response.state.unwrap().assignments.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_read_after_remote_delete_clears_state() {
    let api = Arc::new(SimulatedFleetApi::new());
    let (resource, observer) = recorded_resource(api.clone(), fast_config());

    let mut created = CreateResponse::new();
    resource.create(&ctx(), &baseline(), &mut created).await.unwrap();
    let state = created.state.unwrap();
    api.delete_policy(&ctx(), &state.id).await.unwrap();

    let mut response = ReadResponse::with_state(state);
    resource.read(&ctx(), &mut response).await.unwrap();
    assert!(response.state.is_none());
    assert_eq!(observer.count(Phase::NonRetryableFail), 1);
}

#[tokio::test(start_paused = true)]
async fn test_delete_confirms_absence() {
    let api = Arc::new(SimulatedFleetApi::new().with_visibility_lag(2));
    let (resource, _) = recorded_resource(api.clone(), fast_config());

    let mut created = CreateResponse::new();
    resource.create(&ctx(), &baseline(), &mut created).await.unwrap();
    let state = created.state.unwrap();
    let reads_before = api.calls(SimOperation::GetPolicy).await;

    let outcome = resource.delete(&ctx(), &state).await.unwrap();

    assert_eq!(outcome, DeleteOutcome::Deleted);
    assert_eq!(api.calls(SimOperation::GetPolicy).await - reads_before, 3);
    assert_eq!(api.policy_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_delete_retries_conflict() {
    let api = Arc::new(SimulatedFleetApi::new());
    let (resource, _) = recorded_resource(api.clone(), fast_config());

    let mut created = CreateResponse::new();
    resource
        .create(&ctx(), &PolicySpec::new("p"), &mut created)
        .await
        .unwrap();
    api.inject(SimOperation::DeletePolicy, Fault::new(409, "Conflict"))
        .await;
    api.inject(SimOperation::DeletePolicy, Fault::new(423, "Locked"))
        .await;

    let outcome = resource
        .delete(&ctx(), &created.state.unwrap())
        .await
        .unwrap();
    assert_eq!(outcome, DeleteOutcome::Deleted);
    assert_eq!(api.calls(SimOperation::DeletePolicy).await, 3);
}

#[tokio::test(start_paused = true)]
async fn test_delete_forbidden_fails_once() {
    let api = Arc::new(SimulatedFleetApi::new());
    let (resource, _) = recorded_resource(api.clone(), fast_config());

    let mut created = CreateResponse::new();
    resource
        .create(&ctx(), &PolicySpec::new("p"), &mut created)
        .await
        .unwrap();
    api.inject(SimOperation::DeletePolicy, Fault::new(403, "Forbidden"))
        .await;

    let err = resource
        .delete(&ctx(), &created.state.unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Retry(_)));
    assert_eq!(api.calls(SimOperation::DeletePolicy).await, 1);
    assert_eq!(api.policy_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_waiting() {
    let api = Arc::new(SimulatedFleetApi::new().with_visibility_lag(1000));
    let (resource, observer) = recorded_resource(api.clone(), fast_config());
    let token = CancellationToken::new();
    let ctx = OpContext::background().with_cancellation(token.clone());

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(350)).await;
        token.cancel();
    });

    let mut response = CreateResponse::new();
    let err = resource
        .create(&ctx, &PolicySpec::new("p"), &mut response)
        .await
        .unwrap_err();

    match err {
        OrchestratorError::Retry(e) => assert!(e.is_cancelled()),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(observer.count(Phase::Cancelled), 1);
    assert!(api.calls(SimOperation::GetPolicy).await < 10);
}

#[tokio::test(start_paused = true)]
async fn test_manifest_calls_are_serialized() {
    let api = Arc::new(
        SimulatedFleetApi::new()
            .with_visibility_lag(1)
            .with_latency(Duration::from_millis(50)),
    );
    let (resource, _) = recorded_resource(api.clone(), fast_config());
    let manifest = Manifest {
        policies: vec![baseline(), PolicySpec::new("kiosk"), PolicySpec::new("byod")],
    };

    let outcomes = apply_manifest(&resource, &ctx(), &manifest, false).await;

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| o.is_success()));
    assert_eq!(outcomes[0].assignments, 2);
    assert_eq!(api.policy_count().await, 3);
    assert_eq!(api.peak_in_flight().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_manifest_runs_concurrently_without_gate() {
    let api = Arc::new(SimulatedFleetApi::new().with_latency(Duration::from_millis(50)));
    let mut config = fast_config();
    config.serialize_calls = false;
    let (resource, _) = recorded_resource(api.clone(), config);
    let manifest = Manifest {
        policies: vec![PolicySpec::new("a"), PolicySpec::new("b"), PolicySpec::new("c")],
    };

    let outcomes = apply_manifest(&resource, &ctx(), &manifest, true).await;

    assert!(outcomes.iter().all(|o| o.is_success() && o.deleted));
    assert!(api.peak_in_flight().await > 1);
    assert_eq!(api.policy_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_manifest_reports_failed_entry() {
    let api = Arc::new(SimulatedFleetApi::new());
    api.inject(SimOperation::CreatePolicy, Fault::new(400, "BadRequest"))
        .await;
    let (resource, _) = recorded_resource(api.clone(), fast_config());
    let manifest = Manifest {
        policies: vec![PolicySpec::new("rejected")],
    };

    let outcomes = apply_manifest(&resource, &ctx(), &manifest, false).await;

    assert_eq!(outcomes.len(), 1);
    assert!(!outcomes[0].is_success());
    assert!(outcomes[0].policy_id.is_none());
    assert!(outcomes[0].error.as_deref().unwrap_or_default().contains("400"));
}
