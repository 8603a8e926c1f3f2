// tests/integration/replication_test.rs

//! Incoming cluster message handling: dedup, authority routing, replay
//! unwrapping and idempotent config updates.

use serde_json::json;

use vigil::config::{EndpointDef, ZoneDef};
use vigil::core::checkresult::{CheckResult, CheckState};
use vigil::core::cluster::dispatch_incoming;
use vigil::core::cluster::protocol::{JSONRPC_VERSION, Message, message_for_event, methods};
use vigil::core::events::Event;
use vigil::core::objects::key::ObjectKey;
use vigil::core::replay::journal;

use super::test_helpers::{ScriptedRunner, cluster_config, start_engine};

fn remote_check_result(sequence: u64, execution_end: f64) -> Message {
    let cr = CheckResult {
        schedule_start: execution_end,
        schedule_end: execution_end,
        execution_start: execution_end,
        execution_end,
        exit_status: 1,
        output: "remote says down".into(),
        long_output: String::new(),
        performance_data: String::new(),
        state: CheckState::Down,
        check_source: "node-b".into(),
        vars_before: None,
        vars_after: None,
    };
    let event = Event::CheckResult {
        object: ObjectKey::host("host0"),
        cr,
        authority: "node-b".into(),
    };
    message_for_event(&event, "node-b", sequence).unwrap()
}

#[tokio::test]
async fn duplicate_sequences_are_applied_once() {
    let runner = ScriptedRunner::repeating(0, "OK");
    let engine = start_engine(cluster_config("node-a", &["node-b"], 1), runner).await;

    let message = remote_check_result(1, 100.0);
    dispatch_incoming(&engine.state, "node-b", message.clone())
        .await
        .unwrap();
    dispatch_incoming(&engine.state, "node-b", message)
        .await
        .unwrap();

    assert_eq!(
        engine.event_count(|e| matches!(e, Event::CheckResult { .. })),
        1
    );
    let cell = engine.state.runtime.lookup(&ObjectKey::host("host0")).unwrap();
    assert_eq!(
        cell.entity.lock().checkable().unwrap().1.state,
        CheckState::Down
    );
}

#[tokio::test]
async fn replayed_messages_unwrap_and_apply() {
    let runner = ScriptedRunner::repeating(0, "OK");
    let engine = start_engine(cluster_config("node-a", &["node-b"], 1), runner).await;

    let inner = remote_check_result(7, 50.0);
    let wrapper = Message {
        jsonrpc: JSONRPC_VERSION.to_string(),
        method: methods::LOG_REPLAY.to_string(),
        params: json!({ "message": inner }),
        ts: 50.0,
    };
    dispatch_incoming(&engine.state, "node-b", wrapper).await.unwrap();
    assert_eq!(
        engine.event_count(|e| matches!(e, Event::CheckResult { .. })),
        1
    );
}

#[tokio::test]
async fn unauthorized_origins_are_dropped_without_journaling() {
    let runner = ScriptedRunner::repeating(0, "OK");
    let mut config = cluster_config("node-a", &["node-b"], 1);
    // node-c lives in an unrelated zone that may not touch primary objects.
    config.endpoints.push(EndpointDef {
        name: "node-c".into(),
        host: None,
        port: None,
        features: vec![],
    });
    config.zones.push(ZoneDef {
        name: "satellite".into(),
        endpoints: vec!["node-c".into()],
        parent: None,
    });
    let engine = start_engine(config, runner).await;

    let mut message = remote_check_result(1, 100.0);
    message.params["authority"] = json!("node-c");
    message.params["source"] = json!("node-c");
    dispatch_incoming(&engine.state, "node-c", message).await.unwrap();

    assert_eq!(engine.event_count(|e| matches!(e, Event::CheckResult { .. })), 0);
    // The drop happened before journaling, so replay cannot resurrect it.
    let entries = journal::read_entries_since(&engine.state.config.log_dir(), 0.0).unwrap();
    assert!(entries.is_empty());
}

#[tokio::test]
async fn own_messages_echoed_back_are_ignored() {
    let runner = ScriptedRunner::repeating(0, "OK");
    let engine = start_engine(cluster_config("node-a", &["node-b"], 1), runner).await;

    let mut message = remote_check_result(1, 100.0);
    message.params["authority"] = json!("node-a");
    message.params["source"] = json!("node-a");
    dispatch_incoming(&engine.state, "node-b", message).await.unwrap();
    assert_eq!(engine.event_count(|e| matches!(e, Event::CheckResult { .. })), 0);
}

#[tokio::test]
async fn config_updates_register_new_objects_idempotently() {
    let runner = ScriptedRunner::repeating(0, "OK");
    let engine = start_engine(cluster_config("node-a", &["node-b"], 1), runner).await;

    let update = |sequence: u64, interval: f64| Message {
        jsonrpc: JSONRPC_VERSION.to_string(),
        method: methods::CONFIG_UPDATE.to_string(),
        params: json!({
            "type": "host",
            "name": "host9",
            "properties": {
                "check_command": "ping",
                "check_interval": interval,
                "retry_interval": 60.0,
                "max_check_attempts": 3,
                "parents": []
            },
            "authority": "node-b",
            "source": "node-b",
            "sequence": sequence,
        }),
        ts: sequence as f64,
    };

    dispatch_incoming(&engine.state, "node-b", update(1, 60.0))
        .await
        .unwrap();
    let key = ObjectKey::host("host9");
    assert!(engine.state.runtime.contains(&key));

    // A newer snapshot replaces the config; state is untouched.
    dispatch_incoming(&engine.state, "node-b", update(2, 120.0))
        .await
        .unwrap();
    let cell = engine.state.runtime.lookup(&key).unwrap();
    assert_eq!(
        cell.entity.lock().checkable().unwrap().0.check_interval,
        120.0
    );
    assert_eq!(
        engine.event_count(|e| matches!(e, Event::ConfigUpdated { .. })),
        2
    );
}

#[tokio::test]
async fn next_check_changes_follow_the_owner() {
    let runner = ScriptedRunner::repeating(0, "OK");
    let engine = start_engine(cluster_config("node-a", &["node-b"], 1), runner).await;

    let event = Event::NextCheckChanged {
        object: ObjectKey::host("host0"),
        next_check: 12345.0,
        authority: "node-b".into(),
    };
    let message = message_for_event(&event, "node-b", 1).unwrap();
    dispatch_incoming(&engine.state, "node-b", message).await.unwrap();

    let cell = engine.state.runtime.lookup(&ObjectKey::host("host0")).unwrap();
    assert_eq!(cell.entity.lock().checkable().unwrap().1.next_check, 12345.0);
}
