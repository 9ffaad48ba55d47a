//! End-to-end behaviour of the retry executor on virtual time.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Script, Step, ctx_secs, forbidden, not_found, policy, unavailable};
use fleetsync_core::{
    DeleteOutcome, Exhaustion, OpContext, Phase, ReadMode, RecordingObserver, RetryError,
    RetryExecutor, StateContainer, StateSlot,
};
use proptest::prelude::*;

#[tokio::test(start_paused = true)]
async fn test_converges_on_third_attempt() {
    let script = Script::new(vec![
        Step::Fail(unavailable()),
        Step::Fail(not_found()),
        Step::Ok("attempt-3".to_string()),
    ]);
    let observer = Arc::new(RecordingObserver::new());
    let executor = RetryExecutor::with_observer(observer.clone());
    let mut slot = StateSlot::new();

    executor
        .read_with_retry(
            &ctx_secs(10),
            |_, _| {
                let r = script.read();
                async move { r }
            },
            &mut slot,
            &policy(5, 100),
        )
        .await
        .unwrap();

    assert_eq!(script.calls(), 3);
    assert_eq!(slot.get().map(String::as_str), Some("attempt-3"));
    assert_eq!(
        observer.phases(),
        vec![
            Phase::Attempt,
            Phase::RetryWait,
            Phase::Attempt,
            Phase::RetryWait,
            Phase::Attempt,
            Phase::Success,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_always_retryable_exhausts_after_initial_plus_retries() {
    let script: Script<String> = Script::always(unavailable());
    let mut slot = StateSlot::new();

    let err = fleetsync_core::read_with_retry(
        &ctx_secs(10),
        |_, _| {
            let r = script.read();
            async move { r }
        },
        &mut slot,
        &policy(3, 100),
    )
    .await
    .unwrap_err();

    assert_eq!(script.calls(), 4);
    assert!(matches!(
        err,
        RetryError::BudgetExhausted {
            attempts: 4,
            max_attempts: 4,
            reason: Exhaustion::Attempts,
            ..
        }
    ));
    let msg = err.to_string();
    assert!(msg.contains("device_configuration_policy"));
    assert!(msg.contains("backend busy"));
    assert!(slot.get().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_deadline_caps_requested_attempts() {
    // 7s deadline - 1s margin = 6s usable at 2s per wait -> 3 retries.
    let script: Script<String> = Script::always(unavailable());
    let mut slot = StateSlot::new();
    let started = tokio::time::Instant::now();

    let err = fleetsync_core::read_with_retry(
        &ctx_secs(7),
        |_, _| {
            let r = script.read();
            async move { r }
        },
        &mut slot,
        &policy(30, 2_000),
    )
    .await
    .unwrap_err();

    assert_eq!(script.calls(), 4);
    assert_eq!(err.attempts(), Some(4));
    assert!(started.elapsed() < Duration::from_secs(7));
}

#[tokio::test(start_paused = true)]
async fn test_no_deadline_never_attempts() {
    let script = Script::new(vec![Step::Ok(1u32)]);
    let mut slot = StateSlot::new();

    let err = fleetsync_core::read_with_retry(
        &OpContext::background(),
        |_, _| {
            let r = script.read();
            async move { r }
        },
        &mut slot,
        &policy(5, 100),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, RetryError::NoDeadline { .. }));
    assert_eq!(script.calls(), 0);

    let err = fleetsync_core::delete_with_retry(
        &OpContext::background(),
        |_| {
            let r = script.delete();
            async move { r }
        },
        &policy(5, 100),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RetryError::NoDeadline { .. }));
    assert_eq!(script.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_insufficient_time() {
    let ctx = OpContext::with_timeout(Duration::from_millis(800));
    let mut slot: StateSlot<u32> = StateSlot::new();
    let err = fleetsync_core::read_with_retry(
        &ctx,
        |_, _| async { Ok(1) },
        &mut slot,
        &policy(5, 100),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RetryError::InsufficientTime { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_forbidden_short_circuits() {
    let script: Script<String> = Script::always(forbidden());
    let mut slot = StateSlot::new();

    let err = fleetsync_core::read_with_retry(
        &ctx_secs(10),
        |_, _| {
            let r = script.read();
            async move { r }
        },
        &mut slot,
        &policy(5, 100),
    )
    .await
    .unwrap_err();

    assert_eq!(script.calls(), 1);
    assert!(matches!(
        err,
        RetryError::NonRetryable {
            attempt: 1,
            max_attempts: 6,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_refresh_read_treats_not_found_as_final() {
    let script: Script<String> = Script::always(not_found());
    let mut slot = StateSlot::new();

    let err = fleetsync_core::read_with_retry(
        &ctx_secs(10),
        |_, _| {
            let r = script.read();
            async move { r }
        },
        &mut slot,
        &policy(5, 100).with_read_mode(ReadMode::Refresh),
    )
    .await
    .unwrap_err();

    assert_eq!(script.calls(), 1);
    assert!(err.is_not_found());
}

#[tokio::test(start_paused = true)]
async fn test_delete_not_found_is_success() {
    let script: Script<()> = Script::always(not_found());

    let outcome = fleetsync_core::delete_with_retry(
        &ctx_secs(10),
        |_| {
            let r = script.delete();
            async move { r }
        },
        &policy(5, 100),
    )
    .await
    .unwrap();

    assert_eq!(outcome, DeleteOutcome::AlreadyAbsent);
    assert_eq!(script.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_delete_retries_conflict_then_succeeds() {
    let script = Script::new(vec![
        Step::Fail(fleetsync_core::ApiError::new(409, "Conflict", "assignment in flight")),
        Step::Fail(fleetsync_core::ApiError::new(423, "Locked", "policy locked")),
        Step::Ok(()),
    ]);

    let outcome = fleetsync_core::delete_with_retry(
        &ctx_secs(10),
        |_| {
            let r = script.delete();
            async move { r }
        },
        &policy(5, 100),
    )
    .await
    .unwrap();

    assert_eq!(outcome, DeleteOutcome::Deleted);
    assert_eq!(script.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_wait_is_not_a_timeout() {
    let ctx = ctx_secs(60);
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let script: Script<String> = Script::always(unavailable());
    let mut slot = StateSlot::new();
    let started = tokio::time::Instant::now();

    let err = fleetsync_core::read_with_retry(
        &ctx,
        |_, _| {
            let r = script.read();
            async move { r }
        },
        &mut slot,
        &policy(10, 1_000),
    )
    .await
    .unwrap_err();

    assert!(err.is_cancelled());
    assert!(!err.is_budget_exhausted());
    assert_eq!(script.calls(), 1);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_before_first_attempt() {
    let ctx = ctx_secs(10);
    ctx.cancel();
    let script: Script<()> = Script::new(vec![Step::Ok(())]);

    let err = fleetsync_core::delete_with_retry(
        &ctx,
        |_| {
            let r = script.delete();
            async move { r }
        },
        &policy(5, 100),
    )
    .await
    .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(script.calls(), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_attempts_are_effective_plus_one(requested in 0u32..12, interval_ms in 50u64..400) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();

        let (calls, err) = rt.block_on(async {
            let script: Script<u8> = Script::always(unavailable());
            let mut slot = StateSlot::new();
            let err = fleetsync_core::read_with_retry(
                &ctx_secs(3),
                |_, _| {
                    let r = script.read();
                    async move { r }
                },
                &mut slot,
                &policy(requested, interval_ms),
            )
            .await
            .unwrap_err();
            (script.calls(), err)
        });

        // 3s deadline leaves 2s of usable time.
        let effective = requested.min((2_000 / interval_ms) as u32);
        prop_assert_eq!(calls, effective + 1);
        prop_assert!(err.is_budget_exhausted());
    }
}
