//! Retry budget allocation.
//!
//! A caller asks for "N retries every interval"; the budget caps N so the
//! whole loop finishes before the context deadline, keeping [`SAFETY_MARGIN`]
//! in reserve for the caller's own error reporting.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::context::OpContext;

/// Time reserved for the caller after the retry loop returns.
pub const SAFETY_MARGIN: Duration = Duration::from_secs(1);

/// Reasons a budget cannot be allocated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BudgetError {
    /// The context has no deadline.
    #[error("context has no deadline")]
    NoDeadline,

    /// The safety margin alone consumes the remaining time.
    #[error("{remaining:?} remaining is within the {margin:?} safety margin")]
    InsufficientTime { remaining: Duration, margin: Duration },

    /// The retry interval is zero.
    #[error("retry interval must be greater than zero")]
    ZeroInterval,
}

/// Number of retries that fit in the time left before a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutBudget {
    cutoff: Instant,
    interval: Duration,
    max_retries: u32,
}

impl TimeoutBudget {
    /// Allocate a budget against the context's deadline.
    pub fn allocate(
        ctx: &OpContext,
        requested: u32,
        interval: Duration,
    ) -> Result<Self, BudgetError> {
        Self::allocate_at(Instant::now(), ctx.deadline(), requested, interval)
    }

    /// Allocate a budget as seen from `now`.
    pub fn allocate_at(
        now: Instant,
        deadline: Option<Instant>,
        requested: u32,
        interval: Duration,
    ) -> Result<Self, BudgetError> {
        let deadline = deadline.ok_or(BudgetError::NoDeadline)?;
        if interval.is_zero() {
            return Err(BudgetError::ZeroInterval);
        }

        let remaining = deadline.saturating_duration_since(now);
        if remaining <= SAFETY_MARGIN {
            return Err(BudgetError::InsufficientTime {
                remaining,
                margin: SAFETY_MARGIN,
            });
        }
        let usable = remaining - SAFETY_MARGIN;

        Ok(Self {
            cutoff: now + usable,
            interval,
            max_retries: effective_retries(usable, requested, interval),
        })
    }

    /// Retries permitted after the initial attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Total attempts permitted, initial attempt included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Point in time after which no further wait may end.
    pub fn cutoff(&self) -> Instant {
        self.cutoff
    }

    /// Usable time left before the cutoff.
    pub fn remaining(&self) -> Duration {
        self.cutoff.saturating_duration_since(Instant::now())
    }

    /// Whether a wait of `wait` starting now still ends before the cutoff.
    pub fn fits(&self, wait: Duration) -> bool {
        self.remaining() >= wait
    }
}

/// `min(requested, floor(usable / interval))`.
pub fn effective_retries(usable: Duration, requested: u32, interval: Duration) -> u32 {
    if interval.is_zero() {
        return 0;
    }
    let possible = usable.as_nanos() / interval.as_nanos();
    u32::try_from(possible).map_or(requested, |p| p.min(requested))
}
