//! Retry executor error types.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::classify::ErrorInfo;

/// Boxed cause preserved inside terminal errors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Why a retry loop ran out of budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhaustion {
    /// Every permitted attempt failed.
    Attempts,
    /// Not enough time left before the deadline for another wait.
    Time,
}

impl fmt::Display for Exhaustion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exhaustion::Attempts => f.write_str("retry attempts exhausted"),
            Exhaustion::Time => f.write_str("deadline leaves no room for another attempt"),
        }
    }
}

/// Terminal errors of the retry executor.
///
/// Every variant names the operation and resource type; failure variants also
/// carry the attempt count and the innermost cause.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("{operation} {resource_type}: context has no deadline, refusing to retry without bound")]
    NoDeadline {
        operation: String,
        resource_type: String,
    },

    #[error(
        "{operation} {resource_type}: insufficient time to retry ({remaining:?} left, {margin:?} reserved)"
    )]
    InsufficientTime {
        operation: String,
        resource_type: String,
        remaining: Duration,
        margin: Duration,
    },

    #[error("{operation} {resource_type}: invalid retry policy: {reason}")]
    InvalidPolicy {
        operation: String,
        resource_type: String,
        reason: String,
    },

    #[error("{operation} {resource_type}: cancelled at attempt {attempt} of {max_attempts}")]
    Cancelled {
        operation: String,
        resource_type: String,
        attempt: u32,
        max_attempts: u32,
    },

    #[error(
        "{operation} {resource_type}: non-retryable error on attempt {attempt} of {max_attempts} ({info}): {source}"
    )]
    NonRetryable {
        operation: String,
        resource_type: String,
        attempt: u32,
        max_attempts: u32,
        info: ErrorInfo,
        source: BoxError,
    },

    #[error(
        "{operation} {resource_type}: gave up after {attempts} of {max_attempts} attempts, {reason} ({info}): {source}"
    )]
    BudgetExhausted {
        operation: String,
        resource_type: String,
        attempts: u32,
        max_attempts: u32,
        reason: Exhaustion,
        info: ErrorInfo,
        source: BoxError,
    },
}

impl RetryError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn is_budget_exhausted(&self) -> bool {
        matches!(self, Self::BudgetExhausted { .. })
    }

    /// Attempts made before the loop terminated, if any were made.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::Cancelled { attempt, .. } | Self::NonRetryable { attempt, .. } => Some(*attempt),
            Self::BudgetExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Classification of the last observed failure.
    pub fn info(&self) -> Option<&ErrorInfo> {
        match self {
            Self::NonRetryable { info, .. } | Self::BudgetExhausted { info, .. } => Some(info),
            _ => None,
        }
    }

    /// Whether the last observed failure was a 404.
    pub fn is_not_found(&self) -> bool {
        self.info().is_some_and(ErrorInfo::is_not_found)
    }
}
