//! Shared helpers for fleetsync-core integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleetsync_core::{ApiError, Failures, OpContext, RetryPolicy};

/// One scripted outcome of a remote call.
#[derive(Debug, Clone)]
pub enum Step<S> {
    Ok(S),
    Fail(ApiError),
}

/// Remote call stand-in that plays back a fixed script and counts calls.
///
/// Once the script runs out the last step repeats.
#[derive(Clone)]
pub struct Script<S> {
    steps: Arc<Mutex<VecDeque<Step<S>>>>,
    last: Arc<Mutex<Option<Step<S>>>>,
    calls: Arc<Mutex<u32>>,
}

impl<S: Clone> Script<S> {
    pub fn new(steps: Vec<Step<S>>) -> Self {
        Self {
            steps: Arc::new(Mutex::new(steps.into())),
            last: Arc::new(Mutex::new(None)),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    /// A script that fails the same way forever.
    pub fn always(err: ApiError) -> Self {
        Self::new(vec![Step::Fail(err)])
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }

    pub fn next(&self) -> Step<S> {
        *self.calls.lock().unwrap() += 1;
        let mut last = self.last.lock().unwrap();
        match self.steps.lock().unwrap().pop_front() {
            Some(step) => {
                *last = Some(step.clone());
                step
            }
            None => last.clone().expect("script must not be empty"),
        }
    }

    /// Step as a read result.
    pub fn read(&self) -> Result<S, Failures> {
        match self.next() {
            Step::Ok(s) => Ok(s),
            Step::Fail(e) => Err(Failures::from(e)),
        }
    }

    /// Step as a delete result; the success payload is ignored.
    pub fn delete(&self) -> Result<(), ApiError> {
        match self.next() {
            Step::Ok(_) => Ok(()),
            Step::Fail(e) => Err(e),
        }
    }
}

pub fn unavailable() -> ApiError {
    ApiError::new(503, "ServiceUnavailable", "backend busy")
}

pub fn not_found() -> ApiError {
    ApiError::not_found("policy does not exist")
}

pub fn forbidden() -> ApiError {
    ApiError::new(403, "Forbidden", "caller lacks DeviceManagementConfiguration.ReadWrite")
}

pub fn policy(max_attempts: u32, interval_ms: u64) -> RetryPolicy {
    RetryPolicy::new("create", "device_configuration_policy")
        .with_max_attempts(max_attempts)
        .with_interval(Duration::from_millis(interval_ms))
}

pub fn ctx_secs(secs: u64) -> OpContext {
    OpContext::with_timeout(Duration::from_secs(secs))
}
