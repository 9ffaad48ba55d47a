//! Shared helpers for fleetsync-provider integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use fleetsync_core::{OpContext, RecordingObserver, RetryExecutor};
use fleetsync_provider::clients::SimulatedFleetApi;
use fleetsync_provider::model::{Assignment, AssignmentTarget, FilterMode, PolicySpec};
use fleetsync_provider::{PolicyResource, ProviderConfig};

/// Config with 10s operation timeouts and a 100ms retry interval.
pub fn fast_config() -> ProviderConfig {
    let mut config = ProviderConfig::default();
    config.timeouts.create_timeout_secs = 10;
    config.timeouts.read_timeout_secs = 10;
    config.timeouts.update_timeout_secs = 10;
    config.timeouts.delete_timeout_secs = 10;
    config.retry.interval_ms = 100;
    config
}

/// A policy resource over `api` whose retry loops are recorded.
pub fn recorded_resource(
    api: Arc<SimulatedFleetApi>,
    config: ProviderConfig,
) -> (PolicyResource, Arc<RecordingObserver>) {
    let observer = Arc::new(RecordingObserver::new());
    let resource = PolicyResource::new(api, config)
        .with_executor(RetryExecutor::with_observer(observer.clone()));
    (resource, observer)
}

pub fn ctx() -> OpContext {
    OpContext::background()
}

pub fn group(id: &str) -> Assignment {
    Assignment::new(AssignmentTarget::IncludeGroup {
        group_id: id.to_string(),
    })
}

pub fn excluded(id: &str) -> Assignment {
    Assignment::new(AssignmentTarget::ExcludeGroup {
        group_id: id.to_string(),
    })
}

/// Baseline policy assigned to two groups, one of them filtered.
pub fn baseline() -> PolicySpec {
    PolicySpec::new("baseline")
        .with_setting("passwordMinimumLength", serde_json::json!(12))
        .with_assignment(group("finance"))
        .with_assignment(group("sales").with_filter("corporate-owned", FilterMode::Include))
}
