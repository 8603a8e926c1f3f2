// tests/integration/cluster_test.rs

//! Authority arbitration across simulated peers, heartbeats and bookmark
//! bookkeeping.

use serde_json::json;

use vigil::core::cluster::authority::{FEATURE_CHECKER, FEATURE_NOTIFIER};
use vigil::core::cluster::dispatch_incoming;
use vigil::core::cluster::protocol::{JSONRPC_VERSION, Message, methods};
use vigil::core::objects::key::{ObjectKey, ObjectKind};
use vigil::core::tasks::heartbeat::beat_once;

use super::test_helpers::{ScriptedRunner, attach_peer_link, cluster_config, start_engine};

const HOSTS: usize = 64;

#[tokio::test]
async fn authority_is_exclusive_and_convergent() {
    let runner_a = ScriptedRunner::repeating(0, "OK");
    let runner_b = ScriptedRunner::repeating(0, "OK");
    let engine_a = start_engine(cluster_config("node-a", &["node-b"], HOSTS), runner_a).await;
    let engine_b = start_engine(cluster_config("node-b", &["node-a"], HOSTS), runner_b).await;

    // Both sides see the other as connected.
    let _rx_a = attach_peer_link(&engine_a.state, "node-b");
    let _rx_b = attach_peer_link(&engine_b.state, "node-a");

    let mut owned_by_a = 0usize;
    for i in 0..HOSTS {
        let key = ObjectKey::host(format!("host{i}"));
        for feature in [FEATURE_CHECKER, FEATURE_NOTIFIER] {
            let a = engine_a.state.is_authoritative(&key, feature);
            let b = engine_b.state.is_authoritative(&key, feature);
            assert!(
                a ^ b,
                "exactly one peer must own {key} / {feature} (a={a}, b={b})"
            );
            if feature == FEATURE_CHECKER && a {
                owned_by_a += 1;
            }
        }
    }
    // The hash spreads ownership over both members.
    assert!(owned_by_a > 0 && owned_by_a < HOSTS);
}

#[tokio::test]
async fn ownership_hands_off_when_a_peer_dies_and_returns() {
    let runner = ScriptedRunner::repeating(0, "OK");
    let engine_b = start_engine(cluster_config("node-b", &["node-a"], HOSTS), runner).await;
    let _rx = attach_peer_link(&engine_b.state, "node-a");

    let shared: Vec<ObjectKey> = (0..HOSTS)
        .map(|i| ObjectKey::host(format!("host{i}")))
        .collect();
    let owned_before: Vec<bool> = shared
        .iter()
        .map(|key| engine_b.state.is_authoritative(key, FEATURE_CHECKER))
        .collect();
    assert!(owned_before.iter().any(|o| *o));
    assert!(owned_before.iter().any(|o| !*o));

    // node-a dies: node-b must take over everything.
    engine_b.state.links.remove("node-a");
    for key in &shared {
        assert!(engine_b.state.is_authoritative(key, FEATURE_CHECKER));
    }

    // node-a returns: node-b relinquishes exactly the objects it never owned.
    let _rx = attach_peer_link(&engine_b.state, "node-a");
    let owned_after: Vec<bool> = shared
        .iter()
        .map(|key| engine_b.state.is_authoritative(key, FEATURE_CHECKER))
        .collect();
    assert_eq!(owned_before, owned_after);
}

#[tokio::test]
async fn feature_filtering_excludes_non_accepting_endpoints() {
    let runner = ScriptedRunner::repeating(0, "OK");
    let mut config = cluster_config("node-a", &["node-b"], 4);
    // node-b only runs checks; it never notifies.
    for endpoint in &mut config.endpoints {
        if endpoint.name == "node-b" {
            endpoint.features = vec![FEATURE_CHECKER.to_string()];
        }
    }
    let engine = start_engine(config, runner).await;
    let _rx = attach_peer_link(&engine.state, "node-b");

    for i in 0..4 {
        let key = ObjectKey::host(format!("host{i}"));
        // node-a is the only notifier-accepting member.
        assert!(engine.state.is_authoritative(&key, FEATURE_NOTIFIER));
    }
}

#[tokio::test]
async fn heartbeats_flow_to_live_links_and_advance_bookmarks() {
    let runner = ScriptedRunner::repeating(0, "OK");
    let engine = start_engine(cluster_config("node-a", &["node-b"], 1), runner).await;
    let mut rx = attach_peer_link(&engine.state, "node-b");

    engine.state.journal_position.advance(42.5);
    beat_once(&engine.state);

    let message = rx.try_recv().expect("heartbeat queued for the live link");
    assert_eq!(message.method, methods::HEARTBEAT);
    assert_eq!(message.params["identity"], "node-a");
    assert_eq!(message.params["log_position"], 42.5);

    // An incoming heartbeat acknowledges the peer's received position.
    let incoming = Message {
        jsonrpc: JSONRPC_VERSION.to_string(),
        method: methods::HEARTBEAT.to_string(),
        params: json!({"identity": "node-b", "log_position": 17.0}),
        ts: 1.0,
    };
    dispatch_incoming(&engine.state, "node-b", incoming).await.unwrap();
    assert_eq!(engine.state.bookmarks.get("node-b").remote, 17.0);

    // The endpoint entity mirrors positions and the seen timestamp.
    beat_once(&engine.state);
    let cell = engine
        .state
        .runtime
        .lookup(&ObjectKey::new(ObjectKind::Endpoint, "node-b".to_string()))
        .unwrap();
    let entity = cell.entity.lock();
    let endpoint = entity.as_endpoint().unwrap();
    assert_eq!(endpoint.state.remote_log_position, 17.0);
    assert!(endpoint.state.seen > 0.0);
}
