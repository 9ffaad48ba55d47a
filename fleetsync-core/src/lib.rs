//! Convergence core for fleetsync.
//!
//! Drives locally declared state toward a remote fleet-management API that
//! is eventually consistent and rate limited:
//!
//! - [`retry`]: deadline-bounded read-after-write and delete loops
//! - [`classify`]: reduces heterogeneous errors to a status class and code
//! - [`diff`] and [`apply`]: plan and apply relationship sub-collections
//!
//! Nothing here talks to the network itself. Remote calls are supplied by the
//! caller as closures or through [`apply::RelationshipClient`].

pub mod apply;
pub mod budget;
pub mod classify;
pub mod context;
pub mod diagnostics;
pub mod diff;
pub mod error;
pub mod gate;
pub mod progress;
pub mod retry;
pub mod state;

pub use apply::{
    ApplyCause, ApplyError, ApplyFailure, ApplyReport, OperationKind, RelationshipClient,
    apply_plan,
};
pub use budget::{BudgetError, SAFETY_MARGIN, TimeoutBudget};
pub use classify::{
    ApiError, Classify, ErrorInfo, ReadMode, StatusClass, UnknownDeleteVerdict, Verdict,
    classify_error, classify_text, delete_verdict, is_non_retryable_delete, is_retryable_delete,
    is_retryable_read, should_retry_read,
};
pub use context::OpContext;
pub use diagnostics::{Diagnostic, Diagnostics, Failures, Severity};
pub use diff::{
    Identified, OperationPlan, PlannedUpdate, Relationship, diff, diff_relationships,
    is_placeholder_id, known_id,
};
pub use error::{Exhaustion, RetryError};
pub use gate::{CallGate, CallLock, CallPermit};
pub use progress::{Phase, ProgressObserver, ProgressRecord, RecordingObserver, TracingObserver};
pub use retry::{
    DEFAULT_INTERVAL, DEFAULT_MAX_ATTEMPTS, DeleteOutcome, RetryExecutor, RetryPolicy,
    StillPresent, delete_with_retry, read_with_retry,
};
pub use state::{CreateResponse, ReadResponse, StateContainer, StateSlot, UpdateResponse};
