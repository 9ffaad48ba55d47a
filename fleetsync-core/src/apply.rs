//! Applying an [`OperationPlan`] against a remote sub-collection.

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::classify::{ErrorInfo, classify_error};
use crate::context::OpContext;
use crate::diff::{Identified, OperationPlan, known_id};
use crate::error::BoxError;
use crate::gate::CallGate;

/// Remote access to one relationship sub-collection of a parent entity.
///
/// Records handed to `create` and `update` may lack an identity; records
/// returned carry the one the server assigned.
#[async_trait]
pub trait RelationshipClient<R>: Send + Sync
where
    R: Send + Sync + 'static,
{
    type Error: std::error::Error + Send + Sync + 'static;

    /// Name of the sub-collection, e.g. `assignments`.
    fn collection(&self) -> &str;

    async fn list(&self, ctx: &OpContext, parent_id: &str) -> Result<Vec<R>, Self::Error>;

    async fn create(&self, ctx: &OpContext, parent_id: &str, record: &R)
    -> Result<R, Self::Error>;

    async fn update(
        &self,
        ctx: &OpContext,
        parent_id: &str,
        id: &str,
        record: &R,
    ) -> Result<R, Self::Error>;

    async fn delete(&self, ctx: &OpContext, parent_id: &str, id: &str) -> Result<(), Self::Error>;
}

/// Kind of a single planned operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// Why one planned operation did not happen.
#[derive(Debug, Error)]
pub enum ApplyCause {
    #[error("record has no server-assigned id")]
    MissingId,

    #[error("skipped, operation was cancelled")]
    Cancelled,

    #[error("skipped, deadline exceeded")]
    DeadlineExceeded,

    #[error("{0}")]
    Remote(#[source] BoxError),
}

/// One failed operation, tagged with its kind and record.
#[derive(Debug)]
pub struct ApplyFailure<R> {
    pub kind: OperationKind,
    pub record: R,
    pub cause: ApplyCause,
}

impl<R> ApplyFailure<R> {
    /// Classification of the cause.
    pub fn info(&self) -> ErrorInfo {
        classify_error(&self.cause)
    }
}

/// Outcome of [`apply_plan`]. Partial application is normal: every failed
/// operation is listed on its own.
#[derive(Debug)]
pub struct ApplyReport<R> {
    pub collection: String,
    pub created: Vec<R>,
    pub updated: Vec<R>,
    pub deleted: usize,
    /// Deletes the server answered with 404.
    pub already_absent: usize,
    pub failures: Vec<ApplyFailure<R>>,
}

impl<R> ApplyReport<R> {
    fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            created: Vec::new(),
            updated: Vec::new(),
            deleted: 0,
            already_absent: 0,
            failures: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted + self.already_absent
    }

    pub fn attempted(&self) -> usize {
        self.succeeded() + self.failures.len()
    }
}

impl<R: fmt::Debug> ApplyReport<R> {
    /// Summary error when anything failed.
    pub fn error(&self) -> Option<ApplyError> {
        if self.failures.is_empty() {
            return None;
        }
        Some(ApplyError::Partial {
            collection: self.collection.clone(),
            failed: self.failures.len(),
            attempted: self.attempted(),
            details: self
                .failures
                .iter()
                .map(|f| format!("{} {:?}: {}", f.kind, f.record, f.cause))
                .collect(),
        })
    }
}

#[derive(Debug, Clone, Error)]
pub enum ApplyError {
    #[error("{failed} of {attempted} {collection} operations failed: {}", .details.join("; "))]
    Partial {
        collection: String,
        failed: usize,
        attempted: usize,
        details: Vec<String>,
    },
}

/// Apply `plan` to the `parent_id` sub-collection behind `client`.
///
/// Deletes run first, then updates, then creates, so a replacement never
/// collides with the record it replaces. Each call goes through `gate`.
/// Once `ctx` is cancelled or expired the remaining operations are reported
/// as skipped instead of attempted.
pub async fn apply_plan<R, K, C>(
    ctx: &OpContext,
    client: &C,
    gate: &CallGate,
    parent_id: &str,
    plan: OperationPlan<R, K>,
) -> ApplyReport<R>
where
    R: Identified + Send + Sync + 'static,
    C: RelationshipClient<R> + ?Sized,
{
    let collection = client.collection().to_string();
    let mut report = ApplyReport::new(&collection);
    info!(
        collection = %collection,
        parent_id,
        creates = plan.to_create.len(),
        updates = plan.to_update.len(),
        deletes = plan.to_delete.len(),
        "applying plan"
    );

    for record in plan.to_delete {
        if let Some(cause) = interrupted(ctx) {
            report.fail(OperationKind::Delete, record, cause);
            continue;
        }
        let Some(id) = known_id(&record).map(str::to_string) else {
            report.fail(OperationKind::Delete, record, ApplyCause::MissingId);
            continue;
        };
        match gate.call(client.delete(ctx, parent_id, &id)).await {
            Ok(()) => {
                debug!(collection = %collection, parent_id, id = %id, "deleted");
                report.deleted += 1;
            }
            Err(e) if classify_error(&e).is_not_found() => {
                debug!(collection = %collection, parent_id, id = %id, "already absent");
                report.already_absent += 1;
            }
            Err(e) => report.fail(OperationKind::Delete, record, ApplyCause::Remote(Box::new(e))),
        }
    }

    for update in plan.to_update {
        if let Some(cause) = interrupted(ctx) {
            report.fail(OperationKind::Update, update.desired, cause);
            continue;
        }
        let Some(id) = update.id().map(str::to_string) else {
            report.fail(OperationKind::Update, update.desired, ApplyCause::MissingId);
            continue;
        };
        match gate
            .call(client.update(ctx, parent_id, &id, &update.desired))
            .await
        {
            Ok(record) => report.updated.push(record),
            Err(e) => report.fail(
                OperationKind::Update,
                update.desired,
                ApplyCause::Remote(Box::new(e)),
            ),
        }
    }

    for record in plan.to_create {
        if let Some(cause) = interrupted(ctx) {
            report.fail(OperationKind::Create, record, cause);
            continue;
        }
        match gate.call(client.create(ctx, parent_id, &record)).await {
            Ok(created) => report.created.push(created),
            Err(e) => report.fail(OperationKind::Create, record, ApplyCause::Remote(Box::new(e))),
        }
    }

    report
}

impl<R> ApplyReport<R> {
    fn fail(&mut self, kind: OperationKind, record: R, cause: ApplyCause) {
        error!(
            collection = %self.collection,
            kind = %kind,
            error = %cause,
            "relationship operation failed"
        );
        self.failures.push(ApplyFailure {
            kind,
            record,
            cause,
        });
    }
}

fn interrupted(ctx: &OpContext) -> Option<ApplyCause> {
    if ctx.is_cancelled() {
        Some(ApplyCause::Cancelled)
    } else if ctx.is_expired() {
        Some(ApplyCause::DeadlineExceeded)
    } else {
        None
    }
}
