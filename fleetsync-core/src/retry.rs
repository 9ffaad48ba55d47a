//! Deadline-bounded retry executor.
//!
//! Remote writes are not visible to reads straight away, and deletes race
//! against other writers. After a mutation the caller hands the executor a
//! read (or delete) operation and a [`RetryPolicy`]; the executor repeats it
//! until it succeeds, fails in a way retrying cannot fix, runs out of the
//! attempts that fit before the context deadline, or is cancelled.
//!
//! ```text
//! Start -> Attempt -> Success
//!                  -> RetryWait -> Attempt
//!                  -> NonRetryableFail
//!                  -> BudgetExhausted
//!                  -> Cancelled
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;

use crate::budget::{BudgetError, TimeoutBudget};
use crate::classify::{
    Classify, ErrorInfo, ReadMode, StatusClass, UnknownDeleteVerdict, Verdict, classify_error,
    delete_verdict, should_retry_read,
};
use crate::context::OpContext;
use crate::diagnostics::Failures;
use crate::error::{BoxError, Exhaustion, RetryError};
use crate::progress::{Phase, ProgressObserver, ProgressRecord, TracingObserver};
use crate::state::StateContainer;

/// Default number of retries after the initial attempt.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 30;

/// Default wait between attempts.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

/// Retry parameters for one mutating operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries requested after the initial attempt; capped by the deadline.
    pub max_attempts: u32,
    /// Wait between attempts.
    pub interval: Duration,
    pub operation: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub read_mode: ReadMode,
    pub unknown_delete: UnknownDeleteVerdict,
}

impl RetryPolicy {
    pub fn new(operation: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            interval: DEFAULT_INTERVAL,
            operation: operation.into(),
            resource_type: resource_type.into(),
            resource_id: None,
            read_mode: ReadMode::default(),
            unknown_delete: UnknownDeleteVerdict::default(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_resource_id(mut self, id: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self
    }

    pub fn with_read_mode(mut self, mode: ReadMode) -> Self {
        self.read_mode = mode;
        self
    }

    pub fn with_unknown_delete(mut self, verdict: UnknownDeleteVerdict) -> Self {
        self.unknown_delete = verdict;
        self
    }
}

/// Result of a successful [`RetryExecutor::delete_with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The delete call succeeded.
    Deleted,
    /// The remote reported the resource as already gone.
    AlreadyAbsent,
}

/// A probe found the resource still present while waiting for its absence.
#[derive(Debug, Clone, Error)]
#[error("{resource_type} still present after delete")]
pub struct StillPresent {
    pub resource_type: String,
}

/// Runs retry loops and reports their transitions to an observer.
#[derive(Clone)]
pub struct RetryExecutor {
    observer: Arc<dyn ProgressObserver>,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor").finish_non_exhaustive()
    }
}

/// Per-loop bookkeeping shared by the three entry points.
struct Run<'a> {
    executor: &'a RetryExecutor,
    ctx: &'a OpContext,
    policy: &'a RetryPolicy,
    budget: TimeoutBudget,
    attempt: u32,
}

impl RetryExecutor {
    /// Executor that logs progress through `tracing`.
    pub fn new() -> Self {
        Self::with_observer(Arc::new(TracingObserver))
    }

    pub fn with_observer(observer: Arc<dyn ProgressObserver>) -> Self {
        Self { observer }
    }

    /// Repeat `read` until it returns a state, then store that state in
    /// `container`.
    ///
    /// `read` receives a clone of `ctx` (same deadline and cancellation) and
    /// the state currently held by the container. A 404 is retried in
    /// [`ReadMode::AfterWrite`] and fatal in [`ReadMode::Refresh`].
    pub async fn read_with_retry<C, F, Fut>(
        &self,
        ctx: &OpContext,
        mut read: F,
        container: &mut C,
        policy: &RetryPolicy,
    ) -> Result<(), RetryError>
    where
        C: StateContainer,
        C::State: Clone,
        F: FnMut(OpContext, Option<C::State>) -> Fut,
        Fut: Future<Output = Result<C::State, Failures>>,
    {
        let mut run = self.start(ctx, policy)?;
        loop {
            run.begin_attempt()?;
            let request = container.get().cloned();
            match read(ctx.clone(), request).await {
                Ok(state) => {
                    container.set(state);
                    run.emit(Phase::Success, None, None);
                    return Ok(());
                }
                Err(failures) => {
                    let info = failures.classify();
                    if !should_retry_read(&info, policy.read_mode) {
                        return Err(run.non_retryable(info, Box::new(failures)));
                    }
                    run.wait(info, Box::new(failures)).await?;
                }
            }
        }
    }

    /// Repeat `delete` until it succeeds. A 404 counts as success.
    pub async fn delete_with_retry<F, Fut, E>(
        &self,
        ctx: &OpContext,
        mut delete: F,
        policy: &RetryPolicy,
    ) -> Result<DeleteOutcome, RetryError>
    where
        F: FnMut(OpContext) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut run = self.start(ctx, policy)?;
        loop {
            run.begin_attempt()?;
            match delete(ctx.clone()).await {
                Ok(()) => {
                    run.emit(Phase::Success, None, None);
                    return Ok(DeleteOutcome::Deleted);
                }
                Err(err) => {
                    let info = classify_error(&err);
                    match delete_verdict(&info, policy.unknown_delete) {
                        Verdict::Satisfied => {
                            run.emit(Phase::Success, Some(info), None);
                            return Ok(DeleteOutcome::AlreadyAbsent);
                        }
                        Verdict::Fail => return Err(run.non_retryable(info, Box::new(err))),
                        Verdict::Retry => run.wait(info, Box::new(err)).await?,
                    }
                }
            }
        }
    }

    /// Repeat `probe` until it reports the resource as gone (404).
    ///
    /// A successful probe means the delete is not visible yet and is retried;
    /// other failures follow the delete verdicts.
    pub async fn confirm_absence_with_retry<S, F, Fut>(
        &self,
        ctx: &OpContext,
        mut probe: F,
        policy: &RetryPolicy,
    ) -> Result<(), RetryError>
    where
        F: FnMut(OpContext) -> Fut,
        Fut: Future<Output = Result<S, Failures>>,
    {
        let mut run = self.start(ctx, policy)?;
        loop {
            run.begin_attempt()?;
            match probe(ctx.clone()).await {
                Ok(_) => {
                    let still = StillPresent {
                        resource_type: policy.resource_type.clone(),
                    };
                    let info = ErrorInfo::new(StatusClass::Conflict, "StillPresent");
                    run.wait(info, Box::new(still)).await?;
                }
                Err(failures) => {
                    let info = failures.classify();
                    match delete_verdict(&info, policy.unknown_delete) {
                        Verdict::Satisfied => {
                            run.emit(Phase::Success, Some(info), None);
                            return Ok(());
                        }
                        Verdict::Fail => {
                            return Err(run.non_retryable(info, Box::new(failures)));
                        }
                        Verdict::Retry => run.wait(info, Box::new(failures)).await?,
                    }
                }
            }
        }
    }

    fn start<'a>(
        &'a self,
        ctx: &'a OpContext,
        policy: &'a RetryPolicy,
    ) -> Result<Run<'a>, RetryError> {
        let budget = TimeoutBudget::allocate(ctx, policy.max_attempts, policy.interval)
            .map_err(|e| budget_error(e, policy))?;
        Ok(Run {
            executor: self,
            ctx,
            policy,
            budget,
            attempt: 0,
        })
    }
}

impl Run<'_> {
    fn max_attempts(&self) -> u32 {
        self.budget.max_attempts()
    }

    /// Count the attempt, refusing to start it if the context was cancelled.
    fn begin_attempt(&mut self) -> Result<(), RetryError> {
        self.attempt += 1;
        if self.ctx.is_cancelled() {
            return Err(self.cancelled());
        }
        self.emit(Phase::Attempt, None, None);
        Ok(())
    }

    /// Sleep before the next attempt, or fail if the budget is spent.
    ///
    /// The wait honours a server `Retry-After` hint when it is longer than
    /// the policy interval, and races cancellation.
    async fn wait(&mut self, info: ErrorInfo, cause: BoxError) -> Result<(), RetryError> {
        if self.attempt > self.budget.max_retries() {
            return Err(self.exhausted(Exhaustion::Attempts, info, cause));
        }

        let wait = match info.retry_after {
            Some(hint) => hint.max(self.policy.interval),
            None => self.policy.interval,
        };
        if !self.budget.fits(wait) {
            return Err(self.exhausted(Exhaustion::Time, info, cause));
        }

        self.emit(Phase::RetryWait, Some(info), Some(wait));
        tokio::select! {
            biased;
            _ = self.ctx.cancelled() => Err(self.cancelled()),
            _ = sleep(wait) => Ok(()),
        }
    }

    fn cancelled(&self) -> RetryError {
        self.emit(Phase::Cancelled, None, None);
        RetryError::Cancelled {
            operation: self.policy.operation.clone(),
            resource_type: self.policy.resource_type.clone(),
            attempt: self.attempt,
            max_attempts: self.max_attempts(),
        }
    }

    fn non_retryable(&self, info: ErrorInfo, source: BoxError) -> RetryError {
        self.emit(Phase::NonRetryableFail, Some(info.clone()), None);
        RetryError::NonRetryable {
            operation: self.policy.operation.clone(),
            resource_type: self.policy.resource_type.clone(),
            attempt: self.attempt,
            max_attempts: self.max_attempts(),
            info,
            source,
        }
    }

    fn exhausted(&self, reason: Exhaustion, info: ErrorInfo, source: BoxError) -> RetryError {
        self.emit(Phase::BudgetExhausted, Some(info.clone()), None);
        RetryError::BudgetExhausted {
            operation: self.policy.operation.clone(),
            resource_type: self.policy.resource_type.clone(),
            attempts: self.attempt,
            max_attempts: self.max_attempts(),
            reason,
            info,
            source,
        }
    }

    fn emit(&self, phase: Phase, classification: Option<ErrorInfo>, wait: Option<Duration>) {
        self.executor.observer.observe(&ProgressRecord {
            phase,
            operation: self.policy.operation.clone(),
            resource_type: self.policy.resource_type.clone(),
            resource_id: self.policy.resource_id.clone(),
            attempt: self.attempt,
            max_attempts: self.max_attempts(),
            classification,
            wait,
        });
    }
}

fn budget_error(err: BudgetError, policy: &RetryPolicy) -> RetryError {
    let operation = policy.operation.clone();
    let resource_type = policy.resource_type.clone();
    match err {
        BudgetError::NoDeadline => RetryError::NoDeadline {
            operation,
            resource_type,
        },
        BudgetError::InsufficientTime { remaining, margin } => RetryError::InsufficientTime {
            operation,
            resource_type,
            remaining,
            margin,
        },
        BudgetError::ZeroInterval => RetryError::InvalidPolicy {
            operation,
            resource_type,
            reason: err.to_string(),
        },
    }
}

/// [`RetryExecutor::read_with_retry`] with a tracing-only executor.
pub async fn read_with_retry<C, F, Fut>(
    ctx: &OpContext,
    read: F,
    container: &mut C,
    policy: &RetryPolicy,
) -> Result<(), RetryError>
where
    C: StateContainer,
    C::State: Clone,
    F: FnMut(OpContext, Option<C::State>) -> Fut,
    Fut: Future<Output = Result<C::State, Failures>>,
{
    RetryExecutor::new()
        .read_with_retry(ctx, read, container, policy)
        .await
}

/// [`RetryExecutor::delete_with_retry`] with a tracing-only executor.
pub async fn delete_with_retry<F, Fut, E>(
    ctx: &OpContext,
    delete: F,
    policy: &RetryPolicy,
) -> Result<DeleteOutcome, RetryError>
where
    F: FnMut(OpContext) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    RetryExecutor::new()
        .delete_with_retry(ctx, delete, policy)
        .await
}
