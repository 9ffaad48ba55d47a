//! Progress records emitted by the retry executor.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::classify::ErrorInfo;

/// Executor state a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Attempt,
    Success,
    RetryWait,
    NonRetryableFail,
    BudgetExhausted,
    Cancelled,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Attempt => "attempt",
            Self::Success => "success",
            Self::RetryWait => "retry_wait",
            Self::NonRetryableFail => "non_retryable_fail",
            Self::BudgetExhausted => "budget_exhausted",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Attempt | Self::RetryWait)
    }
}

/// One state transition of a retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressRecord {
    pub phase: Phase,
    pub operation: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub classification: Option<ErrorInfo>,
    pub wait: Option<Duration>,
}

/// Receives every transition of every retry loop it is attached to.
pub trait ProgressObserver: Send + Sync {
    fn observe(&self, record: &ProgressRecord);
}

/// Forwards records to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ProgressObserver for TracingObserver {
    fn observe(&self, r: &ProgressRecord) {
        let id = r.resource_id.as_deref().unwrap_or("-");
        let status = r
            .classification
            .as_ref()
            .map(|c| c.status_class.to_string())
            .unwrap_or_default();
        let code = r
            .classification
            .as_ref()
            .map(|c| c.code.as_str())
            .unwrap_or_default();

        match r.phase {
            Phase::Attempt => debug!(
                operation = %r.operation,
                resource_type = %r.resource_type,
                resource_id = %id,
                attempt = r.attempt,
                max_attempts = r.max_attempts,
                "attempt"
            ),
            Phase::Success => info!(
                operation = %r.operation,
                resource_type = %r.resource_type,
                resource_id = %id,
                attempt = r.attempt,
                max_attempts = r.max_attempts,
                "converged"
            ),
            Phase::RetryWait => info!(
                operation = %r.operation,
                resource_type = %r.resource_type,
                resource_id = %id,
                attempt = r.attempt,
                max_attempts = r.max_attempts,
                status_class = %status,
                code = %code,
                wait_ms = r
                    .wait
                    .map(|w| u64::try_from(w.as_millis()).unwrap_or(u64::MAX))
                    .unwrap_or_default(),
                "retryable failure, waiting"
            ),
            Phase::Cancelled => warn!(
                operation = %r.operation,
                resource_type = %r.resource_type,
                resource_id = %id,
                attempt = r.attempt,
                max_attempts = r.max_attempts,
                "cancelled"
            ),
            Phase::NonRetryableFail | Phase::BudgetExhausted => error!(
                operation = %r.operation,
                resource_type = %r.resource_type,
                resource_id = %id,
                attempt = r.attempt,
                max_attempts = r.max_attempts,
                status_class = %status,
                code = %code,
                phase = r.phase.as_str(),
                "giving up"
            ),
        }
    }
}

/// Keeps every record in memory. Intended for tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    records: Mutex<Vec<ProgressRecord>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ProgressRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.records().iter().map(|r| r.phase).collect()
    }

    pub fn count(&self, phase: Phase) -> usize {
        self.records().iter().filter(|r| r.phase == phase).count()
    }
}

impl ProgressObserver for RecordingObserver {
    fn observe(&self, record: &ProgressRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
    }
}
