// tests/property/roundtrip_test.rs

//! Snapshot/restore round-trip properties: any reachable entity state must
//! survive persistence bit-for-bit.

use proptest::prelude::*;
use std::sync::Arc;

use vigil::core::checkresult::{CheckState, StateType};
use vigil::core::events::EventBus;
use vigil::core::objects::checkable::{AckType, CheckableConfig, Host};
use vigil::core::objects::entity::Entity;
use vigil::core::objects::key::ObjectKey;
use vigil::core::objects::runtime::ObjectRuntime;

fn host_state_strategy() -> impl Strategy<Value = (CheckState, StateType, u32, f64, bool, AckType, u32)>
{
    (
        prop_oneof![
            Just(CheckState::Up),
            Just(CheckState::Down),
        ],
        prop_oneof![Just(StateType::Soft), Just(StateType::Hard)],
        1u32..=5,
        0.0f64..1.0e9,
        any::<bool>(),
        prop_oneof![Just(AckType::None), Just(AckType::Normal), Just(AckType::Sticky)],
        0u32..=3,
    )
}

fn runtime_with_host() -> ObjectRuntime {
    let runtime = ObjectRuntime::new(Arc::new(EventBus::new()));
    runtime
        .register(
            ObjectKey::host("web1"),
            Entity::Host(Host::new(CheckableConfig::default(), vec!["gw".into()])),
        )
        .unwrap();
    runtime
}

proptest! {
    #[test]
    fn snapshot_restore_roundtrip(
        (state, state_type, attempt, next_check, flapping, ack, depth) in host_state_strategy()
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.dat");

        let runtime = runtime_with_host();
        let key = ObjectKey::host("web1");
        {
            let cell = runtime.lookup(&key).unwrap();
            let mut entity = cell.entity.lock();
            let (_, checkable_state, _) = entity.checkable_mut().unwrap();
            checkable_state.state = state;
            checkable_state.state_type = state_type;
            checkable_state.current_attempt = attempt;
            checkable_state.next_check = next_check;
            checkable_state.flapping = flapping;
            checkable_state.acknowledgement = ack;
            checkable_state.in_downtime_depth = depth;
        }
        let before = runtime
            .lookup(&key)
            .unwrap()
            .entity
            .lock()
            .state_value()
            .unwrap();
        runtime.snapshot(&path).unwrap();

        let restored = runtime_with_host();
        restored.restore(&path).unwrap();
        let after = restored
            .lookup(&key)
            .unwrap()
            .entity
            .lock()
            .state_value()
            .unwrap();
        prop_assert_eq!(before, after);
    }

    #[test]
    fn snapshot_is_stable_under_repetition(next_check in 0.0f64..1.0e9) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.dat");

        let runtime = runtime_with_host();
        let key = ObjectKey::host("web1");
        {
            let cell = runtime.lookup(&key).unwrap();
            let mut entity = cell.entity.lock();
            entity.checkable_mut().unwrap().1.next_check = next_check;
        }
        runtime.snapshot(&path).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();

        // Restore + snapshot again must reproduce the identical file.
        runtime.restore(&path).unwrap();
        runtime.snapshot(&path).unwrap();
        let second = std::fs::read_to_string(&path).unwrap();
        prop_assert_eq!(first, second);
    }
}
