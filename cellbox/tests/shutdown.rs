//! Integration tests for runtime-wide shutdown.

use std::time::{Duration, Instant};

use cellbox::{BoxCommand, BoxHandle, BoxOptions, BoxStatus, CellboxError, ShutdownOutcome, StopTimeout};
use cellbox_test_utils::{TEST_GRACE_PERIOD, TestContext};

async fn running_boxes(ctx: &TestContext, n: usize) -> Vec<BoxHandle> {
    let mut boxes = Vec::with_capacity(n);
    for _ in 0..n {
        boxes.push(ctx.running_box(BoxOptions::default()).await);
    }
    boxes
}

// ============================================================================
// OUTCOMES
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_reports_graceful_and_forced_boxes() {
    let ctx = TestContext::new();
    let boxes = running_boxes(&ctx, 3).await;

    let _polite = boxes[0].exec(BoxCommand::new("sleep")).await.unwrap();
    let _stubborn = boxes[1].exec(BoxCommand::new("stubborn")).await.unwrap();

    let started = Instant::now();
    let report = ctx.runtime.shutdown(StopTimeout::Default).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.boxes.len(), 3);
    assert_eq!(report.forced_count(), 1);
    assert_eq!(report.graceful_count(), 2);
    assert!(report.is_clean());

    let forced = report
        .boxes
        .iter()
        .find(|b| b.outcome == ShutdownOutcome::Forced)
        .unwrap();
    assert_eq!(&forced.id, boxes[1].id());

    // One grace period, not one per box.
    assert!(elapsed >= TEST_GRACE_PERIOD);
    assert!(elapsed < TEST_GRACE_PERIOD * 2, "shutdown took {elapsed:?}");

    for handle in &boxes {
        assert_eq!(handle.status(), BoxStatus::Stopped);
    }
    assert_eq!(ctx.backend.live_handles(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn grace_periods_overlap() {
    let ctx = TestContext::new();
    let boxes = running_boxes(&ctx, 5).await;
    let mut executions = Vec::new();
    for handle in &boxes {
        executions.push(handle.exec(BoxCommand::new("stubborn")).await.unwrap());
    }

    let grace = Duration::from_millis(200);
    let started = Instant::now();
    let report = ctx.runtime.shutdown(grace).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.forced_count(), 5);
    assert!(elapsed < grace * 3, "grace periods ran serially: {elapsed:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_skips_boxes_that_are_not_running() {
    let ctx = TestContext::new();
    let created = ctx.runtime.create(BoxOptions::default()).await.unwrap();
    let stopped = ctx.running_box(BoxOptions::default()).await;
    stopped.stop(0).await.unwrap();
    let running = ctx.running_box(BoxOptions::default()).await;

    let report = ctx.runtime.shutdown(0).await.unwrap();

    assert_eq!(report.boxes.len(), 1);
    assert_eq!(&report.boxes[0].id, running.id());
    assert_eq!(report.boxes[0].outcome, ShutdownOutcome::Graceful);
    assert_eq!(created.status(), BoxStatus::Created);
    assert_eq!(stopped.status(), BoxStatus::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn one_failing_box_does_not_abort_the_others() {
    let ctx = TestContext::new();
    let boxes = running_boxes(&ctx, 3).await;

    ctx.backend.fail_next_releases(1);
    let report = ctx.runtime.shutdown(0).await.unwrap();

    assert_eq!(report.boxes.len(), 3);
    assert_eq!(report.graceful_count(), 2);
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert!(matches!(failures[0].1, CellboxError::Engine(_)));

    let failed = boxes.iter().find(|b| b.id() == failures[0].0).unwrap();
    assert_eq!(failed.status(), BoxStatus::Running);

    // A second shutdown picks up the straggler.
    let report = ctx.runtime.shutdown(0).await.unwrap();
    assert_eq!(report.boxes.len(), 1);
    assert!(report.is_clean());
    assert_eq!(failed.status(), BoxStatus::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_with_no_boxes_is_clean() {
    let ctx = TestContext::new();
    let report = ctx.runtime.shutdown(StopTimeout::Default).await.unwrap();
    assert!(report.boxes.is_empty());
    assert!(report.is_clean());
}

// ============================================================================
// AFTER SHUTDOWN
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn runtime_refuses_new_work_after_shutdown() {
    let ctx = TestContext::new();
    let stopped = ctx.running_box(BoxOptions::default().with_name("old")).await;
    let created = ctx.runtime.create(BoxOptions::default()).await.unwrap();

    ctx.runtime.shutdown(0).await.unwrap();
    assert!(ctx.runtime.is_shutdown());

    assert!(matches!(
        ctx.runtime.create(BoxOptions::default()).await,
        Err(CellboxError::Stopped(_))
    ));
    assert!(matches!(stopped.start().await, Err(CellboxError::Stopped(_))));
    assert!(matches!(created.start().await, Err(CellboxError::Stopped(_))));

    // Inspection and removal still work.
    assert_eq!(ctx.runtime.list_info().unwrap().len(), 2);
    assert_eq!(ctx.runtime.get_info("old").unwrap().status, BoxStatus::Stopped);
    ctx.runtime.remove("old", false).await.unwrap();
    ctx.runtime
        .remove(created.id().as_str(), true)
        .await
        .unwrap();
    assert!(ctx.runtime.list_info().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn in_flight_executions_end_with_stopped() {
    let ctx = TestContext::new();
    let handle = ctx.running_box(BoxOptions::default()).await;
    let execution = handle.exec(BoxCommand::new("sleep")).await.unwrap();

    ctx.runtime.shutdown(0).await.unwrap();

    assert!(matches!(
        execution.output().await,
        Err(CellboxError::Stopped(_))
    ));
}
