//! Remote fleet-management API boundary.
//!
//! - [`FleetApi`]: policy CRUD and the policy `assignments` sub-collection
//! - [`Assignments`]: adapts the sub-collection to the core's relationship client
//! - [`SimulatedFleetApi`]: in-memory, eventually consistent implementation

pub mod simulated;

use std::sync::Arc;

use async_trait::async_trait;
use fleetsync_core::{ApiError, OpContext, RelationshipClient};

use crate::model::{Assignment, Policy, PolicyPayload};

pub use simulated::{Fault, SimOperation, SimulatedFleetApi};

/// Calls the provider makes against the remote API.
#[async_trait]
pub trait FleetApi: Send + Sync {
    async fn create_policy(&self, ctx: &OpContext, payload: &PolicyPayload)
    -> Result<Policy, ApiError>;

    async fn get_policy(&self, ctx: &OpContext, id: &str) -> Result<Policy, ApiError>;

    async fn update_policy(
        &self,
        ctx: &OpContext,
        id: &str,
        payload: &PolicyPayload,
    ) -> Result<Policy, ApiError>;

    async fn delete_policy(&self, ctx: &OpContext, id: &str) -> Result<(), ApiError>;

    async fn list_assignments(
        &self,
        ctx: &OpContext,
        policy_id: &str,
    ) -> Result<Vec<Assignment>, ApiError>;

    async fn create_assignment(
        &self,
        ctx: &OpContext,
        policy_id: &str,
        assignment: &Assignment,
    ) -> Result<Assignment, ApiError>;

    async fn update_assignment(
        &self,
        ctx: &OpContext,
        policy_id: &str,
        id: &str,
        assignment: &Assignment,
    ) -> Result<Assignment, ApiError>;

    async fn delete_assignment(
        &self,
        ctx: &OpContext,
        policy_id: &str,
        id: &str,
    ) -> Result<(), ApiError>;
}

/// The `assignments` sub-collection of policies.
#[derive(Clone)]
pub struct Assignments {
    api: Arc<dyn FleetApi>,
}

impl Assignments {
    pub fn new(api: Arc<dyn FleetApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl RelationshipClient<Assignment> for Assignments {
    type Error = ApiError;

    fn collection(&self) -> &str {
        "assignments"
    }

    async fn list(&self, ctx: &OpContext, parent_id: &str) -> Result<Vec<Assignment>, ApiError> {
        self.api.list_assignments(ctx, parent_id).await
    }

    async fn create(
        &self,
        ctx: &OpContext,
        parent_id: &str,
        record: &Assignment,
    ) -> Result<Assignment, ApiError> {
        self.api.create_assignment(ctx, parent_id, record).await
    }

    async fn update(
        &self,
        ctx: &OpContext,
        parent_id: &str,
        id: &str,
        record: &Assignment,
    ) -> Result<Assignment, ApiError> {
        self.api.update_assignment(ctx, parent_id, id, record).await
    }

    async fn delete(&self, ctx: &OpContext, parent_id: &str, id: &str) -> Result<(), ApiError> {
        self.api.delete_assignment(ctx, parent_id, id).await
    }
}
