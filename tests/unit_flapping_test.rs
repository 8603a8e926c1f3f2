// tests/unit_flapping_test.rs

use parking_lot::Mutex;
use std::sync::Arc;

use vigil::core::checkresult::{CheckResult, CheckState};
use vigil::core::events::{Event, EventBus};
use vigil::core::objects::checkable::{CheckableConfig, Service};
use vigil::core::objects::entity::Entity;
use vigil::core::objects::key::ObjectKey;
use vigil::core::objects::runtime::ObjectRuntime;
use vigil::core::processor::process_check_result;

fn setup() -> (ObjectRuntime, Arc<EventBus>, Arc<Mutex<Vec<Event>>>, ObjectKey) {
    let bus = Arc::new(EventBus::new());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    bus.subscribe(None, move |event| sink.lock().push(event.clone()));

    let runtime = ObjectRuntime::new(bus.clone());
    let key = ObjectKey::service("web1", "http");
    let config = CheckableConfig {
        check_command: "http".into(),
        max_check_attempts: 1,
        high_flap_threshold: 30.0,
        low_flap_threshold: 25.0,
        ..CheckableConfig::default()
    };
    runtime
        .register(key.clone(), Entity::Service(Service::new("web1".into(), config)))
        .unwrap();
    (runtime, bus, events, key)
}

fn result(state: CheckState, execution_end: f64) -> CheckResult {
    CheckResult {
        schedule_start: execution_end,
        schedule_end: execution_end,
        execution_start: execution_end,
        execution_end,
        exit_status: 0,
        output: String::new(),
        long_output: String::new(),
        performance_data: String::new(),
        state,
        check_source: "node-a".into(),
        vars_before: None,
        vars_after: None,
    }
}

fn flap_starts(events: &Mutex<Vec<Event>>) -> usize {
    events
        .lock()
        .iter()
        .filter(|e| matches!(e, Event::FlappingChanged { started: true, .. }))
        .count()
}

#[tokio::test]
async fn oscillation_starts_flapping_exactly_once() {
    let (runtime, bus, events, key) = setup();

    // 21 alternating results drive the weighted ratio across the threshold.
    for i in 0..21 {
        let state = if i % 2 == 0 { CheckState::Critical } else { CheckState::Ok };
        process_check_result(&runtime, &bus, &key, result(state, (i + 1) as f64), "node-a", true)
            .unwrap();
    }
    let cell = runtime.lookup(&key).unwrap();
    {
        let entity = cell.entity.lock();
        let (_, state) = entity.checkable().unwrap();
        assert!(state.flapping, "flapping should have engaged");
        assert!(state.flapping_current > 30.0);
    }
    assert_eq!(flap_starts(&events), 1);

    // Further identical oscillation does not re-emit the start event.
    for i in 21..30 {
        let state = if i % 2 == 0 { CheckState::Critical } else { CheckState::Ok };
        process_check_result(&runtime, &bus, &key, result(state, (i + 1) as f64), "node-a", true)
            .unwrap();
    }
    assert_eq!(flap_starts(&events), 1);
}

#[tokio::test]
async fn flapping_suppresses_notifications() {
    let (runtime, bus, events, key) = setup();
    for i in 0..21 {
        let state = if i % 2 == 0 { CheckState::Critical } else { CheckState::Ok };
        process_check_result(&runtime, &bus, &key, result(state, (i + 1) as f64), "node-a", true)
            .unwrap();
    }
    assert!(flap_starts(&events) == 1);

    let before = events
        .lock()
        .iter()
        .filter(|e| matches!(e, Event::NotificationSent { .. }))
        .count();
    // New hard problems while flapping stay silent.
    for i in 30..36 {
        let state = if i % 2 == 0 { CheckState::Critical } else { CheckState::Ok };
        process_check_result(&runtime, &bus, &key, result(state, (i + 1) as f64), "node-a", true)
            .unwrap();
    }
    let after = events
        .lock()
        .iter()
        .filter(|e| matches!(e, Event::NotificationSent { .. }))
        .count();
    assert_eq!(before, after);
}

#[tokio::test]
async fn steady_state_recovers_from_flapping() {
    let (runtime, bus, events, key) = setup();
    for i in 0..21 {
        let state = if i % 2 == 0 { CheckState::Critical } else { CheckState::Ok };
        process_check_result(&runtime, &bus, &key, result(state, (i + 1) as f64), "node-a", true)
            .unwrap();
    }
    // A long quiet stretch pushes the ratio back under the low threshold.
    for i in 21..60 {
        process_check_result(
            &runtime, &bus, &key, result(CheckState::Ok, (i + 1) as f64), "node-a", true,
        )
        .unwrap();
    }
    let cell = runtime.lookup(&key).unwrap();
    let entity = cell.entity.lock();
    let (_, state) = entity.checkable().unwrap();
    assert!(!state.flapping);
    assert!(
        events
            .lock()
            .iter()
            .any(|e| matches!(e, Event::FlappingChanged { started: false, .. }))
    );
}
