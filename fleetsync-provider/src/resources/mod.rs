//! Resource orchestrators.
//!
//! Each resource drives one entity type through its lifecycle against the
//! remote API and waits, through the retry executor, until the remote side
//! reflects what was written.

pub mod policy;

use async_trait::async_trait;
use fleetsync_core::{
    ApiError, ApplyError, CreateResponse, DeleteOutcome, OpContext, ReadResponse, RetryError,
    UpdateResponse,
};
use thiserror::Error;

pub use policy::PolicyResource;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid {resource_type} configuration: {reason}")]
    Invalid {
        resource_type: &'static str,
        reason: String,
    },

    #[error("{operation} {resource_type} failed: {source}")]
    Api {
        operation: &'static str,
        resource_type: &'static str,
        #[source]
        source: ApiError,
    },

    #[error(transparent)]
    Retry(#[from] RetryError),

    #[error(transparent)]
    Assignments(#[from] ApplyError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Lifecycle of one remote entity type.
///
/// Responses are the host's containers: `create` fills an empty one, `read`
/// and `update` receive one seeded with the prior state. Warnings go into the
/// response diagnostics; failures are returned.
#[async_trait]
pub trait Resource: Send + Sync {
    /// Declared desired state.
    type Spec: Send + Sync;
    /// Recorded state after an operation.
    type State: Clone + Send + Sync;

    fn type_name(&self) -> &'static str;

    async fn create(
        &self,
        ctx: &OpContext,
        spec: &Self::Spec,
        response: &mut CreateResponse<Self::State>,
    ) -> Result<()>;

    /// Refresh the prior state. Clears it if the entity no longer exists.
    async fn read(&self, ctx: &OpContext, response: &mut ReadResponse<Self::State>) -> Result<()>;

    async fn update(
        &self,
        ctx: &OpContext,
        spec: &Self::Spec,
        response: &mut UpdateResponse<Self::State>,
    ) -> Result<()>;

    async fn delete(&self, ctx: &OpContext, state: &Self::State) -> Result<DeleteOutcome>;
}
