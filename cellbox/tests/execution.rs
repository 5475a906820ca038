//! Integration tests for command execution inside running boxes.

use std::time::{Duration, Instant};

use cellbox::{
    BoxCommand, BoxOptions, BoxStatus, CellboxError, ExecChunk, OUTPUT_QUEUE_CAPACITY, StopOutcome,
    StopTimeout,
};
use cellbox_shared::constants::exit;
use cellbox_test_utils::{KILLED, TEST_GRACE_PERIOD, TestContext, collect_chunks};
use futures::StreamExt;
use proptest::prelude::*;

// ============================================================================
// BUFFERED MODE
// ============================================================================

#[tokio::test]
async fn run_buffers_stdout_and_exit_code() {
    let ctx = TestContext::new();
    let handle = ctx.running_box(BoxOptions::default()).await;

    let output = handle
        .run(BoxCommand::new("echo").arg("hello"))
        .await
        .unwrap();

    assert_eq!(output.stdout_lossy(), "hello\n");
    assert!(output.stderr.is_empty());
    assert_eq!(output.exit_code, 0);
    assert!(output.success());
}

#[tokio::test]
async fn nonzero_exit_and_stderr_are_reported() {
    let ctx = TestContext::new();
    let handle = ctx.running_box(BoxOptions::default()).await;

    let output = handle.run(BoxCommand::new("fail")).await.unwrap();
    assert_eq!(output.exit_code, 1);
    assert_eq!(output.stderr_lossy(), "fail: injected failure\n");
    assert!(output.stdout.is_empty());

    let output = handle.run(BoxCommand::new("false")).await.unwrap();
    assert_eq!(output.exit_code, 1);
    assert!(!output.spawn_failed());
}

#[tokio::test]
async fn spawn_failure_yields_sentinel_exit_code() {
    let ctx = TestContext::new();
    let handle = ctx.running_box(BoxOptions::default()).await;

    let output = handle
        .run(BoxCommand::new("no-such-binary"))
        .await
        .unwrap();

    assert_eq!(output.exit_code, exit::SPAWN_FAILED);
    assert!(output.spawn_failed());
    assert!(output.stderr_lossy().contains("no-such-binary"));

    let metrics = handle.metrics();
    assert_eq!(metrics.commands_executed_total(), 1);
    assert_eq!(metrics.exec_errors_total(), 1);
    let runtime = ctx.runtime.metrics().unwrap();
    assert_eq!(runtime.total_exec_errors(), 1);

    // The box is unaffected.
    assert_eq!(handle.status(), BoxStatus::Running);
    assert!(handle.run(BoxCommand::new("true")).await.unwrap().success());
}

// ============================================================================
// STREAMING MODE
// ============================================================================

#[tokio::test]
async fn streaming_preserves_order_and_ends_with_exit() {
    let ctx = TestContext::new();
    let handle = ctx.running_box(BoxOptions::default()).await;

    let execution = handle.exec(BoxCommand::new("seq").arg("5")).await.unwrap();
    let items: Vec<ExecChunk> = collect_chunks(execution)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    let expected: Vec<ExecChunk> = (1..=5)
        .map(|i| ExecChunk::Stdout(format!("{i}\n").into_bytes()))
        .chain([ExecChunk::Exit(0)])
        .collect();
    assert_eq!(items, expected);
}

#[tokio::test]
async fn output_is_observable_before_exit() {
    let ctx = TestContext::new();
    let handle = ctx.running_box(BoxOptions::default()).await;

    let mut execution = handle.exec(BoxCommand::new("seq").arg("50")).await.unwrap();
    let first = execution.next().await.unwrap().unwrap();
    assert_eq!(first, ExecChunk::Stdout(b"1\n".to_vec()));

    // seq 50 takes ~500ms; the first line must not wait for it.
    let code = execution.wait().await.unwrap();
    assert_eq!(code, 0);
}

#[tokio::test]
async fn stream_to_delivers_every_chunk() {
    let ctx = TestContext::new();
    let handle = ctx.running_box(BoxOptions::default()).await;

    let execution = handle.exec(BoxCommand::new("seq").arg("3")).await.unwrap();
    let mut stdout = Vec::new();
    let mut exits = 0;
    let code = execution
        .stream_to(|chunk| match chunk {
            ExecChunk::Stdout(bytes) => stdout.extend_from_slice(bytes),
            ExecChunk::Stderr(_) => {}
            ExecChunk::Exit(_) => exits += 1,
        })
        .await
        .unwrap();

    assert_eq!(code, 0);
    assert_eq!(stdout, b"1\n2\n3\n");
    assert_eq!(exits, 1);
}

#[tokio::test]
async fn spawn_failure_streams_stderr_then_sentinel() {
    let ctx = TestContext::new();
    let handle = ctx.running_box(BoxOptions::default()).await;

    let items = collect_chunks(handle.exec(BoxCommand::new("missing")).await.unwrap()).await;
    assert_eq!(items.len(), 2);
    assert!(matches!(&items[0], Ok(ExecChunk::Stderr(_))));
    assert_eq!(items[1], Ok(ExecChunk::Exit(exit::SPAWN_FAILED)));
}

// ============================================================================
// CONCURRENCY
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_executions_are_independent() {
    let ctx = TestContext::new();
    let handle = ctx.running_box(BoxOptions::default()).await;

    let runs = (0..8).map(|i| {
        let handle = handle.clone();
        async move { handle.run(BoxCommand::new("echo").arg(i.to_string())).await }
    });
    let outputs = futures::future::join_all(runs).await;

    for (i, output) in outputs.into_iter().enumerate() {
        let output = output.unwrap();
        assert_eq!(output.stdout_lossy(), format!("{i}\n"));
        assert_eq!(output.exit_code, 0);
    }
    assert_eq!(handle.metrics().commands_executed_total(), 8);
}

#[tokio::test(flavor = "multi_thread")]
async fn unread_executions_do_not_block_stop() {
    let ctx = TestContext::new();
    let handle = ctx.running_box(BoxOptions::default()).await;

    // Nobody reads these.
    let _a = handle.exec(BoxCommand::new("seq").arg("1000")).await.unwrap();
    let _b = handle.exec(BoxCommand::new("sleep")).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(2), handle.stop(StopTimeout::Default))
        .await
        .expect("stop hung on unread executions")
        .unwrap();
    assert_eq!(outcome, StopOutcome::Graceful);
}

#[tokio::test]
async fn slow_reader_receives_all_output() {
    let ctx = TestContext::new();
    let handle = ctx.running_box(BoxOptions::default()).await;
    let lines = OUTPUT_QUEUE_CAPACITY * 4;

    let execution = handle
        .exec(BoxCommand::new("flood").arg(lines.to_string()))
        .await
        .unwrap();
    // Let the queue fill and hold the command back.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let output = execution.output().await.unwrap();
    assert_eq!(output.exit_code, 0);
    assert_eq!(output.stdout_lossy().lines().count(), lines);
}

#[tokio::test]
async fn unread_output_is_bounded_and_stop_still_delivers_terminal() {
    let ctx = TestContext::new();
    let handle = ctx.running_box(BoxOptions::default()).await;

    let mut execution = handle
        .exec(BoxCommand::new("flood").arg((OUTPUT_QUEUE_CAPACITY * 4).to_string()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let outcome = tokio::time::timeout(Duration::from_secs(2), handle.stop(StopTimeout::Default))
        .await
        .expect("stop hung on a full output queue")
        .unwrap();
    assert_eq!(outcome, StopOutcome::Graceful);

    let mut chunks = 0;
    let terminal = loop {
        match execution.next().await.expect("no terminal item") {
            Ok(ExecChunk::Exit(code)) => break Ok(code),
            Ok(_) => chunks += 1,
            Err(e) => break Err(e),
        }
    };
    assert!(chunks <= OUTPUT_QUEUE_CAPACITY);
    assert!(matches!(terminal, Err(CellboxError::Stopped(_))));
    assert!(execution.next().await.is_none());
}

// ============================================================================
// STOP INTERACTION
// ============================================================================

#[tokio::test]
async fn stop_terminates_in_flight_execution() {
    let ctx = TestContext::new();
    let handle = ctx.running_box(BoxOptions::default()).await;
    let execution = handle.exec(BoxCommand::new("sleep")).await.unwrap();

    let outcome = handle.stop(StopTimeout::Default).await.unwrap();
    assert_eq!(outcome, StopOutcome::Graceful);

    let err = execution.output().await.unwrap_err();
    assert!(matches!(err, CellboxError::Stopped(_)));
    assert_eq!(ctx.backend.live_processes(), 0);
}

#[tokio::test]
async fn stubborn_process_is_forced_after_grace_period() {
    let ctx = TestContext::new();
    let handle = ctx.running_box(BoxOptions::default()).await;
    let execution = handle.exec(BoxCommand::new("stubborn")).await.unwrap();

    let started = Instant::now();
    let outcome = handle.stop(StopTimeout::Default).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(outcome, StopOutcome::Forced);
    assert!(elapsed >= TEST_GRACE_PERIOD, "forced before grace: {elapsed:?}");
    assert!(elapsed < TEST_GRACE_PERIOD * 3, "stop took {elapsed:?}");
    assert_eq!(ctx.backend.forced_terminations(), 1);

    let items = collect_chunks(execution).await;
    assert!(matches!(items.last(), Some(Err(CellboxError::Stopped(_)))));
    assert_eq!(handle.metrics().last_exit_code(), Some(KILLED));
}

#[tokio::test(flavor = "multi_thread")]
async fn process_spawned_after_forced_stop_is_killed() {
    let ctx = TestContext::new();
    let handle = ctx.running_box(BoxOptions::default()).await;
    ctx.backend.set_spawn_delay(Duration::from_millis(400));

    let pending = tokio::spawn({
        let handle = handle.clone();
        async move { handle.exec(BoxCommand::new("stubborn")).await }
    });
    // Let the exec register before the stop begins.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let outcome = tokio::time::timeout(
        Duration::from_secs(3),
        handle.stop(Duration::from_millis(100)),
    )
    .await
    .expect("stop hung on a process spawned after the kill")
    .unwrap();

    assert_eq!(outcome, StopOutcome::Forced);
    assert_eq!(handle.status(), BoxStatus::Stopped);
    assert_eq!(ctx.backend.live_processes(), 0);

    let execution = pending.await.unwrap().unwrap();
    assert!(matches!(
        execution.wait().await,
        Err(CellboxError::Stopped(_))
    ));
    assert_eq!(handle.metrics().last_exit_code(), Some(KILLED));
}

#[tokio::test(flavor = "multi_thread")]
async fn process_spawned_during_grace_period_is_signalled() {
    let ctx = TestContext::new();
    let handle = ctx.running_box(BoxOptions::default()).await;
    ctx.backend.set_spawn_delay(Duration::from_millis(100));

    let pending = tokio::spawn({
        let handle = handle.clone();
        async move { handle.exec(BoxCommand::new("sleep")).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let outcome = handle.stop(Duration::from_secs(2)).await.unwrap();

    assert_eq!(outcome, StopOutcome::Graceful);
    assert_eq!(ctx.backend.forced_terminations(), 0);
    let execution = pending.await.unwrap().unwrap();
    assert!(matches!(
        execution.wait().await,
        Err(CellboxError::Stopped(_))
    ));
}

#[tokio::test]
async fn indefinite_stop_waits_for_voluntary_exit() {
    let ctx = TestContext::new();
    let handle = ctx.running_box(BoxOptions::default()).await;
    let execution = handle
        .exec(BoxCommand::new("stubborn").arg("0.5"))
        .await
        .unwrap();

    let started = Instant::now();
    let outcome = handle.stop(StopTimeout::Indefinite).await.unwrap();

    assert_eq!(outcome, StopOutcome::Graceful);
    assert!(started.elapsed() >= Duration::from_millis(450));
    assert_eq!(ctx.backend.forced_terminations(), 0);
    // The stop still cut the execution short from the caller's point of view.
    assert!(matches!(
        execution.wait().await,
        Err(CellboxError::Stopped(_))
    ));
}

#[tokio::test]
async fn exec_before_start_is_invalid_state() {
    let ctx = TestContext::new();
    let handle = ctx.runtime.create(BoxOptions::default()).await.unwrap();

    let err = handle.exec(BoxCommand::new("echo")).await.unwrap_err();
    assert!(matches!(err, CellboxError::InvalidState(_)));
    assert_eq!(ctx.backend.allocations(), 0);
}

#[tokio::test]
async fn exec_after_stop_is_invalid_state() {
    let ctx = TestContext::new();
    let handle = ctx.running_box(BoxOptions::default()).await;
    handle.stop(0).await.unwrap();

    let err = handle.exec(BoxCommand::new("echo")).await.unwrap_err();
    assert!(matches!(err, CellboxError::InvalidState(_)));
}

#[tokio::test]
async fn completed_execution_is_unaffected_by_later_stop() {
    let ctx = TestContext::new();
    let handle = ctx.running_box(BoxOptions::default()).await;

    let execution = handle.exec(BoxCommand::new("echo").arg("done")).await.unwrap();
    let output = execution.output().await.unwrap();
    handle.stop(0).await.unwrap();

    assert_eq!(output.stdout_lossy(), "done\n");
    assert_eq!(output.exit_code, 0);
}

// ============================================================================
// COMMAND DEFAULTS
// ============================================================================

#[tokio::test]
async fn box_env_and_working_dir_apply_to_commands() {
    let ctx = TestContext::new();
    let mut options = BoxOptions::default();
    options.env = vec![
        ("LANG".into(), "C".into()),
        ("MODE".into(), "box".into()),
    ];
    options.working_dir = Some("/srv".into());
    let handle = ctx.running_box(options).await;

    handle
        .run(BoxCommand::new("true").env("MODE", "cmd"))
        .await
        .unwrap();
    handle
        .run(BoxCommand::new("true").working_dir("/tmp"))
        .await
        .unwrap();

    let spawned = ctx.backend.spawned_commands();
    assert_eq!(spawned.len(), 2);

    let env = spawned[0].envs();
    assert!(env.contains(&("LANG".into(), "C".into())));
    assert!(env.contains(&("MODE".into(), "cmd".into())));
    assert!(!env.contains(&("MODE".into(), "box".into())));
    assert_eq!(spawned[0].current_dir(), Some("/srv"));

    assert_eq!(spawned[1].current_dir(), Some("/tmp"));
}

// ============================================================================
// METRICS
// ============================================================================

#[tokio::test]
async fn execution_metrics_accumulate() {
    let ctx = TestContext::new();
    let handle = ctx.running_box(BoxOptions::default()).await;

    handle.run(BoxCommand::new("echo").arg("abc")).await.unwrap();
    handle.run(BoxCommand::new("fail")).await.unwrap();

    let metrics = handle.metrics();
    assert_eq!(metrics.commands_executed_total(), 2);
    assert_eq!(metrics.exec_errors_total(), 0);
    assert_eq!(metrics.stdout_bytes_total, 4);
    assert_eq!(metrics.stderr_bytes_total, "fail: injected failure\n".len() as u64);
    assert_eq!(metrics.last_exit_code, Some(1));
    assert!(metrics.cpu_time >= Duration::from_micros(200));

    let runtime = ctx.runtime.metrics().unwrap();
    assert_eq!(runtime.total_commands_executed(), 2);
    assert_eq!(runtime.commands_executed(), 2);
    assert_eq!(runtime.num_running_boxes(), 1);
}

#[tokio::test]
async fn metrics_survive_restart() {
    let ctx = TestContext::new();
    let handle = ctx.running_box(BoxOptions::default()).await;
    handle.run(BoxCommand::new("true")).await.unwrap();

    handle.stop(0).await.unwrap();
    handle.start().await.unwrap();
    handle.run(BoxCommand::new("true")).await.unwrap();

    assert_eq!(handle.metrics().commands_executed_total(), 2);
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn exec_requires_running_box(
        program in "[a-z]{1,8}",
        args in proptest::collection::vec("[a-z0-9]{0,6}", 0..4),
        stop_first in any::<bool>(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ctx = TestContext::new();
            let handle = ctx.runtime.create(BoxOptions::default()).await.unwrap();
            if stop_first {
                handle.start().await.unwrap();
                handle.stop(0).await.unwrap();
            }

            let result = handle.exec(BoxCommand::new(program).args(args)).await;
            prop_assert!(matches!(result, Err(CellboxError::InvalidState(_))));
            prop_assert!(ctx.backend.spawned_commands().is_empty());
            Ok(())
        })?;
    }
}
