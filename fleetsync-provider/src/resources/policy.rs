//! Device configuration policy orchestrator.

use std::sync::Arc;

use async_trait::async_trait;
use fleetsync_core::{
    ApiError, CallGate, CreateResponse, DeleteOutcome, Diagnostic, Diagnostics, ErrorInfo, Failures,
    OpContext, ReadMode, ReadResponse, RelationshipClient, RetryExecutor, StatusClass,
    UpdateResponse, apply_plan, diff_relationships,
};
use tracing::{debug, info, warn};

use super::{OrchestratorError, Resource, Result};
use crate::clients::{Assignments, FleetApi};
use crate::config::{Operation, ProviderConfig};
use crate::model::{Assignment, PolicySpec, PolicyState};

pub const TYPE_NAME: &str = "device_configuration_policy";

/// Converges device configuration policies and their assignments.
pub struct PolicyResource {
    api: Arc<dyn FleetApi>,
    assignments: Assignments,
    config: ProviderConfig,
    gate: CallGate,
    executor: RetryExecutor,
}

impl PolicyResource {
    pub fn new(api: Arc<dyn FleetApi>, config: ProviderConfig) -> Self {
        Self {
            assignments: Assignments::new(api.clone()),
            gate: config.call_gate(),
            executor: RetryExecutor::new(),
            api,
            config,
        }
    }

    /// Share a gate with other resources talking to the same client.
    pub fn with_gate(mut self, gate: CallGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_executor(mut self, executor: RetryExecutor) -> Self {
        self.executor = executor;
        self
    }

    fn api_error(operation: &'static str) -> impl FnOnce(ApiError) -> OrchestratorError {
        move |source| OrchestratorError::Api {
            operation,
            resource_type: TYPE_NAME,
            source,
        }
    }

    /// Policy plus its assignments, as one state.
    async fn fetch(&self, ctx: &OpContext, id: &str) -> std::result::Result<PolicyState, Failures> {
        let policy = self.gate.call(self.api.get_policy(ctx, id)).await?;
        let assignments = self.gate.call(self.api.list_assignments(ctx, id)).await?;
        Ok(PolicyState::from_remote(policy, assignments))
    }

    /// [`Self::fetch`], failing retryably until the read shows `min_version`.
    async fn fetch_at_least(
        &self,
        ctx: &OpContext,
        id: &str,
        min_version: u64,
    ) -> std::result::Result<PolicyState, Failures> {
        let state = self.fetch(ctx, id).await?;
        if state.version < min_version {
            return Err(Failures::new(
                Diagnostic::error(
                    "stale read",
                    format!(
                        "policy {id} read at version {}, version {min_version} was written",
                        state.version
                    ),
                )
                .with_info(ErrorInfo::new(StatusClass::Unknown, "StaleRead")),
            ));
        }
        Ok(state)
    }

    /// Bring the policy's assignments in line with `desired`.
    async fn reconcile_assignments(
        &self,
        ctx: &OpContext,
        policy_id: &str,
        desired: &[Assignment],
        diagnostics: &mut Diagnostics,
    ) -> Result<()> {
        let observed = self
            .gate
            .call(self.assignments.list(ctx, policy_id))
            .await
            .map_err(Self::api_error("list assignments"))?;

        let plan = diff_relationships(desired.to_vec(), observed);
        for target in &plan.duplicate_keys {
            diagnostics.add_warning(
                "duplicate assignment target",
                format!("{target} is declared more than once on policy {policy_id}"),
            );
        }
        if plan.is_empty() {
            debug!(policy_id, "assignments already converged");
            return Ok(());
        }

        let report = apply_plan(ctx, &self.assignments, &self.gate, policy_id, plan).await;
        match report.error() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Resource for PolicyResource {
    type Spec = PolicySpec;
    type State = PolicyState;

    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    async fn create(
        &self,
        ctx: &OpContext,
        spec: &PolicySpec,
        response: &mut CreateResponse<PolicyState>,
    ) -> Result<()> {
        spec.validate().map_err(|reason| OrchestratorError::Invalid {
            resource_type: TYPE_NAME,
            reason,
        })?;
        let ctx = ctx.child_with_timeout(self.config.timeout(Operation::Create));

        info!("Creating policy {}", spec.name);
        let created = self
            .gate
            .call(self.api.create_policy(&ctx, &spec.payload()))
            .await
            .map_err(Self::api_error("create"))?;
        let id = created.id.as_str();

        let policy = self
            .config
            .retry_policy(Operation::Create, TYPE_NAME)
            .with_resource_id(id)
            .with_read_mode(ReadMode::AfterWrite);
        let converged = self
            .executor
            .read_with_retry(
                &ctx,
                move |ctx, _| async move { self.fetch(&ctx, id).await },
                &mut *response,
                &policy,
            )
            .await;
        if let Err(e) = converged {
            // The policy exists remotely; keep its id so it can be cleaned up.
            response.state = Some(PolicyState::from_remote(created.clone(), Vec::new()));
            return Err(e.into());
        }

        self.reconcile_assignments(&ctx, id, &spec.assignments, &mut response.diagnostics)
            .await?;
        if !spec.assignments.is_empty() {
            let assignments = self
                .gate
                .call(self.api.list_assignments(&ctx, id))
                .await
                .map_err(Self::api_error("list assignments"))?;
            if let Some(state) = response.state.as_mut() {
                state.assignments = assignments;
            }
        }

        info!("Created policy {} ({})", spec.name, id);
        Ok(())
    }

    async fn read(&self, ctx: &OpContext, response: &mut ReadResponse<PolicyState>) -> Result<()> {
        let Some(prior) = response.state.as_ref() else {
            return Err(OrchestratorError::Invalid {
                resource_type: TYPE_NAME,
                reason: "read requires a prior state".to_string(),
            });
        };
        let id = prior.id.clone();
        let id = id.as_str();
        let ctx = ctx.child_with_timeout(self.config.timeout(Operation::Read));

        let policy = self
            .config
            .retry_policy(Operation::Read, TYPE_NAME)
            .with_resource_id(id)
            .with_read_mode(ReadMode::Refresh);
        let result = self
            .executor
            .read_with_retry(
                &ctx,
                move |ctx, _| async move { self.fetch(&ctx, id).await },
                &mut *response,
                &policy,
            )
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                warn!("Policy {} no longer exists, dropping it from state", id);
                response.state = None;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(
        &self,
        ctx: &OpContext,
        spec: &PolicySpec,
        response: &mut UpdateResponse<PolicyState>,
    ) -> Result<()> {
        spec.validate().map_err(|reason| OrchestratorError::Invalid {
            resource_type: TYPE_NAME,
            reason,
        })?;
        let Some(prior) = response.state.clone() else {
            return Err(OrchestratorError::Invalid {
                resource_type: TYPE_NAME,
                reason: "update requires a prior state".to_string(),
            });
        };
        let id = prior.id.as_str();
        let ctx = ctx.child_with_timeout(self.config.timeout(Operation::Update));

        let payload = spec.payload();
        let payload_changed = prior.name != payload.name
            || prior.description != payload.description
            || prior.platform != payload.platform
            || prior.settings != payload.settings;
        let min_version = if payload_changed {
            info!("Updating policy {} ({})", spec.name, id);
            let updated = self
                .gate
                .call(self.api.update_policy(&ctx, id, &payload))
                .await
                .map_err(Self::api_error("update"))?;
            updated.version
        } else {
            prior.version
        };

        self.reconcile_assignments(&ctx, id, &spec.assignments, &mut response.diagnostics)
            .await?;

        let policy = self
            .config
            .retry_policy(Operation::Update, TYPE_NAME)
            .with_resource_id(id)
            .with_read_mode(ReadMode::AfterWrite);
        self.executor
            .read_with_retry(
                &ctx,
                move |ctx, _| async move { self.fetch_at_least(&ctx, id, min_version).await },
                &mut *response,
                &policy,
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, ctx: &OpContext, state: &PolicyState) -> Result<DeleteOutcome> {
        let id = state.id.as_str();
        let ctx = ctx.child_with_timeout(self.config.timeout(Operation::Delete));
        let policy = self
            .config
            .retry_policy(Operation::Delete, TYPE_NAME)
            .with_resource_id(id);

        info!("Deleting policy {} ({})", state.name, id);
        let outcome = self
            .executor
            .delete_with_retry(
                &ctx,
                move |ctx| async move { self.gate.call(self.api.delete_policy(&ctx, id)).await },
                &policy,
            )
            .await?;

        if outcome == DeleteOutcome::Deleted {
            self.executor
                .confirm_absence_with_retry(
                    &ctx,
                    move |ctx| async move {
                        self.gate
                            .call(self.api.get_policy(&ctx, id))
                            .await
                            .map_err(Failures::from)
                    },
                    &policy.with_read_mode(ReadMode::Refresh),
                )
                .await?;
        }
        Ok(outcome)
    }
}
