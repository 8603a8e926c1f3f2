// tests/integration/scheduler_test.rs

//! End-to-end scheduler behavior with a real engine and scripted plugins.

use std::time::Duration;

use vigil::core::checker::CheckScheduler;
use vigil::core::checkresult::{CheckResult, CheckState, StateType};
use vigil::core::events::Event;
use vigil::core::objects::key::ObjectKey;

use super::test_helpers::{ScriptedRunner, cluster_config, start_engine, wait_for_event};

#[tokio::test]
async fn active_checks_drive_state_to_hard() {
    let runner = ScriptedRunner::repeating(1, "ping failed");
    let mut engine = start_engine(cluster_config("node-a", &[], 1), runner).await;

    let scheduler = CheckScheduler::new(
        engine.state.clone(),
        engine.scheduler_rx.take().expect("scheduler channel"),
    );
    let shutdown_rx = engine.state.shutdown_tx.subscribe();
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx));

    // With max_check_attempts = 2 the host hardens to Down after two checks.
    let hardened = wait_for_event(&engine, Duration::from_secs(5), |event| {
        matches!(
            event,
            Event::StateChange {
                state: CheckState::Down,
                state_type: StateType::Hard,
                ..
            }
        )
    })
    .await;
    assert!(hardened, "host never reached hard Down");

    engine.state.begin_shutdown();
    scheduler_task.await.unwrap();

    let cell = engine.state.runtime.lookup(&ObjectKey::host("host0")).unwrap();
    let entity = cell.entity.lock();
    let (_, state) = entity.checkable().unwrap();
    assert_eq!(state.state, CheckState::Down);
    assert_eq!(state.state_type, StateType::Hard);
    assert_eq!(state.current_attempt, 2);
    assert!(state.next_check > 0.0);

    // The hard problem was notified exactly once (no downtime, no ack).
    assert_eq!(
        engine.event_count(|e| matches!(e, Event::NotificationSent { .. })),
        1
    );
}

#[tokio::test]
async fn recovery_follows_failure() {
    // One failing check, then healthy forever.
    let runner = ScriptedRunner::new(vec![(1, "down"), (0, "up")]);
    let mut engine = start_engine(cluster_config("node-a", &[], 1), runner).await;

    let scheduler = CheckScheduler::new(
        engine.state.clone(),
        engine.scheduler_rx.take().expect("scheduler channel"),
    );
    let shutdown_rx = engine.state.shutdown_tx.subscribe();
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx));

    let recovered = wait_for_event(&engine, Duration::from_secs(5), |event| {
        matches!(
            event,
            Event::StateChange {
                state: CheckState::Up,
                state_type: StateType::Hard,
                ..
            }
        )
    })
    .await;
    assert!(recovered, "host never recovered to hard Up");

    engine.state.begin_shutdown();
    scheduler_task.await.unwrap();
}

fn passive_result(state: CheckState, execution_end: f64) -> CheckResult {
    CheckResult {
        schedule_start: execution_end,
        schedule_end: execution_end,
        execution_start: execution_end,
        execution_end,
        exit_status: 2,
        output: "external".into(),
        long_output: String::new(),
        performance_data: String::new(),
        state,
        check_source: "command-pipe".into(),
        vars_before: None,
        vars_after: None,
    }
}

#[tokio::test]
async fn passive_results_bypass_the_scheduler() {
    let runner = ScriptedRunner::repeating(0, "OK");
    let engine = start_engine(cluster_config("node-a", &[], 1), runner).await;
    let key = ObjectKey::host("host0");

    engine
        .state
        .submit_passive_result(&key, passive_result(CheckState::Down, 100.0))
        .unwrap();
    assert_eq!(engine.event_count(|e| matches!(e, Event::CheckResult { .. })), 1);

    // Disabling passive checks silently ignores further submissions.
    engine
        .state
        .runtime
        .modify(&key, "enable_passive_checks", serde_json::json!(false), "node-a")
        .unwrap();
    engine
        .state
        .submit_passive_result(&key, passive_result(CheckState::Up, 101.0))
        .unwrap();
    assert_eq!(engine.event_count(|e| matches!(e, Event::CheckResult { .. })), 1);
}
