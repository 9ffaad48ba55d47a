//! In-memory fleet API with eventual consistency and fault injection.
//!
//! Writes land immediately but only become visible to `get_policy` after a
//! configurable number of reads, which is how the real service behaves behind
//! its replicas. Assignment listings are always current.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fleetsync_core::{ApiError, OpContext};
use tokio::sync::Mutex;
use tracing::debug;

use super::FleetApi;
use crate::model::{Assignment, Policy, PolicyPayload};

/// Remote operation names, used for fault injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOperation {
    CreatePolicy,
    GetPolicy,
    UpdatePolicy,
    DeletePolicy,
    ListAssignments,
    CreateAssignment,
    UpdateAssignment,
    DeleteAssignment,
}

/// A scripted failure returned instead of performing one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub status: u16,
    pub code: String,
    pub retry_after: Option<Duration>,
}

impl Fault {
    pub fn new(status: u16, code: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            retry_after: None,
        }
    }

    pub fn throttled(retry_after: Duration) -> Self {
        Self {
            retry_after: Some(retry_after),
            ..Self::new(429, "TooManyRequests")
        }
    }

    pub fn unavailable() -> Self {
        Self::new(503, "ServiceUnavailable")
    }

    fn into_error(self, op: SimOperation) -> ApiError {
        let err = ApiError::new(self.status, self.code, format!("injected fault on {op:?}"));
        match self.retry_after {
            Some(d) => err.with_retry_after(d),
            None => err,
        }
    }
}

#[derive(Debug, Default)]
struct PolicyEntry {
    actual: Option<Policy>,
    visible: Option<Policy>,
    reads_until_visible: u32,
    assignments: Vec<Assignment>,
}

impl PolicyEntry {
    /// What a read sees right now; counts towards visibility.
    fn read(&mut self) -> Option<Policy> {
        if self.reads_until_visible > 0 {
            self.reads_until_visible -= 1;
            return self.visible.clone();
        }
        self.visible = self.actual.clone();
        self.visible.clone()
    }

    fn written(&mut self, lag: u32) {
        self.reads_until_visible = lag;
        if lag == 0 {
            self.visible = self.actual.clone();
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    policies: HashMap<String, PolicyEntry>,
    faults: HashMap<SimOperation, VecDeque<Fault>>,
    calls: HashMap<SimOperation, u32>,
}

impl SimState {
    fn live(&mut self, id: &str) -> Result<&mut PolicyEntry, ApiError> {
        self.policies
            .get_mut(id)
            .filter(|e| e.actual.is_some())
            .ok_or_else(|| ApiError::not_found(format!("policy {id} not found")))
    }
}

/// Holds one in-flight slot; released on drop, also when the call is aborted.
struct InFlight<'a>(&'a AtomicU32);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Eventually consistent in-memory [`FleetApi`].
#[derive(Debug, Default)]
pub struct SimulatedFleetApi {
    state: Mutex<SimState>,
    in_flight: AtomicU32,
    peak_in_flight: AtomicU32,
    visibility_lag: u32,
    latency: Duration,
}

impl SimulatedFleetApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes stay invisible to the next `reads` policy reads.
    pub fn with_visibility_lag(mut self, reads: u32) -> Self {
        self.visibility_lag = reads;
        self
    }

    /// Every call takes `latency` to complete.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue a fault; the next call of `op` returns it instead of running.
    pub async fn inject(&self, op: SimOperation, fault: Fault) {
        self.state
            .lock()
            .await
            .faults
            .entry(op)
            .or_default()
            .push_back(fault);
    }

    pub async fn calls(&self, op: SimOperation) -> u32 {
        self.state.lock().await.calls.get(&op).copied().unwrap_or(0)
    }

    /// Most calls that were ever in progress at the same time.
    pub async fn peak_in_flight(&self) -> u32 {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Calls currently in progress.
    pub async fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Current server-side state of a policy, ignoring visibility lag.
    pub async fn actual_policy(&self, id: &str) -> Option<Policy> {
        self.state
            .lock()
            .await
            .policies
            .get(id)
            .and_then(|e| e.actual.clone())
    }

    pub async fn actual_assignments(&self, id: &str) -> Vec<Assignment> {
        self.state
            .lock()
            .await
            .policies
            .get(id)
            .map(|e| e.assignments.clone())
            .unwrap_or_default()
    }

    pub async fn policy_count(&self) -> usize {
        self.state
            .lock()
            .await
            .policies
            .values()
            .filter(|e| e.actual.is_some())
            .count()
    }

    /// Count the call, consume a queued fault, wait out the latency, then
    /// run `body` against the state unless a fault fired.
    async fn run<T>(
        &self,
        op: SimOperation,
        body: impl FnOnce(&mut SimState, u32) -> Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        let fault = {
            let mut s = self.state.lock().await;
            *s.calls.entry(op).or_default() += 1;
            s.faults.get_mut(&op).and_then(VecDeque::pop_front)
        };
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _slot = InFlight(&self.in_flight);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut s = self.state.lock().await;
        if let Some(fault) = fault {
            debug!(?op, status = fault.status, "injecting fault");
            return Err(fault.into_error(op));
        }
        body(&mut s, self.visibility_lag)
    }
}

#[async_trait]
impl FleetApi for SimulatedFleetApi {
    async fn create_policy(
        &self,
        _ctx: &OpContext,
        payload: &PolicyPayload,
    ) -> Result<Policy, ApiError> {
        self.run(SimOperation::CreatePolicy, |s, lag| {
            let now = Utc::now();
            let policy = Policy {
                id: uuid::Uuid::new_v4().to_string(),
                payload: payload.clone(),
                version: 1,
                created_at: now,
                last_modified_at: now,
            };
            debug!("Creating policy {} ({})", policy.payload.name, policy.id);
            let entry = s.policies.entry(policy.id.clone()).or_default();
            entry.actual = Some(policy.clone());
            entry.written(lag);
            Ok(policy)
        })
        .await
    }

    async fn get_policy(&self, _ctx: &OpContext, id: &str) -> Result<Policy, ApiError> {
        self.run(SimOperation::GetPolicy, |s, _| {
            s.policies
                .get_mut(id)
                .and_then(PolicyEntry::read)
                .ok_or_else(|| ApiError::not_found(format!("policy {id} not found")))
        })
        .await
    }

    async fn update_policy(
        &self,
        _ctx: &OpContext,
        id: &str,
        payload: &PolicyPayload,
    ) -> Result<Policy, ApiError> {
        self.run(SimOperation::UpdatePolicy, |s, lag| {
            let entry = s.live(id)?;
            let mut policy = entry
                .actual
                .clone()
                .ok_or_else(|| ApiError::not_found(format!("policy {id} not found")))?;
            policy.payload = payload.clone();
            policy.version += 1;
            policy.last_modified_at = Utc::now();
            debug!("Updating policy {} to version {}", id, policy.version);
            entry.actual = Some(policy.clone());
            entry.written(lag);
            Ok(policy)
        })
        .await
    }

    async fn delete_policy(&self, _ctx: &OpContext, id: &str) -> Result<(), ApiError> {
        self.run(SimOperation::DeletePolicy, |s, lag| {
            let entry = s.live(id)?;
            debug!("Deleting policy {}", id);
            entry.actual = None;
            entry.assignments.clear();
            entry.written(lag);
            Ok(())
        })
        .await
    }

    async fn list_assignments(
        &self,
        _ctx: &OpContext,
        policy_id: &str,
    ) -> Result<Vec<Assignment>, ApiError> {
        self.run(SimOperation::ListAssignments, |s, _| {
            Ok(s.live(policy_id)?.assignments.clone())
        })
        .await
    }

    async fn create_assignment(
        &self,
        _ctx: &OpContext,
        policy_id: &str,
        assignment: &Assignment,
    ) -> Result<Assignment, ApiError> {
        self.run(SimOperation::CreateAssignment, |s, _| {
            let entry = s.live(policy_id)?;
            let created = Assignment {
                id: Some(uuid::Uuid::new_v4().to_string()),
                ..assignment.clone()
            };
            debug!("Assigning policy {} to {}", policy_id, created.target);
            entry.assignments.push(created.clone());
            Ok(created)
        })
        .await
    }

    async fn update_assignment(
        &self,
        _ctx: &OpContext,
        policy_id: &str,
        id: &str,
        assignment: &Assignment,
    ) -> Result<Assignment, ApiError> {
        self.run(SimOperation::UpdateAssignment, |s, _| {
            let entry = s.live(policy_id)?;
            let existing = entry
                .assignments
                .iter_mut()
                .find(|a| a.id.as_deref() == Some(id))
                .ok_or_else(|| ApiError::not_found(format!("assignment {id} not found")))?;
            existing.target = assignment.target.clone();
            existing.filter = assignment.filter.clone();
            Ok(existing.clone())
        })
        .await
    }

    async fn delete_assignment(
        &self,
        _ctx: &OpContext,
        policy_id: &str,
        id: &str,
    ) -> Result<(), ApiError> {
        self.run(SimOperation::DeleteAssignment, |s, _| {
            let entry = s.live(policy_id)?;
            let before = entry.assignments.len();
            entry.assignments.retain(|a| a.id.as_deref() != Some(id));
            if entry.assignments.len() == before {
                return Err(ApiError::not_found(format!("assignment {id} not found")));
            }
            Ok(())
        })
        .await
    }
}
