// tests/property/consistency_test.rs

//! Invariants of the pure core algorithms: flap detection bounds, sequence
//! dedup, authority determinism, and replay idempotence through the dedup
//! gate.

use proptest::prelude::*;
use std::sync::Arc;

use vigil::core::checkresult::{CheckResult, CheckState, parse_plugin_output};
use vigil::core::cluster::authority;
use vigil::core::events::EventBus;
use vigil::core::flapping;
use vigil::core::objects::checkable::{CheckableConfig, Service};
use vigil::core::objects::entity::Entity;
use vigil::core::objects::key::ObjectKey;
use vigil::core::objects::runtime::ObjectRuntime;
use vigil::core::processor::process_check_result;
use vigil::core::replay::SequenceTracker;

proptest! {
    #[test]
    fn flap_ratio_is_bounded(transitions in proptest::collection::vec(any::<bool>(), 0..100)) {
        let mut history = Vec::new();
        for changed in transitions {
            flapping::push_transition(&mut history, changed);
            let ratio = flapping::change_ratio(&history);
            prop_assert!((0.0..=100.0).contains(&ratio));
            prop_assert!(history.len() <= flapping::FLAP_WINDOW);
        }
    }

    #[test]
    fn sequence_tracker_accepts_strictly_increasing(seqs in proptest::collection::vec(1u64..50, 1..60)) {
        let tracker = SequenceTracker::new();
        let mut reference_max = 0u64;
        for seq in seqs {
            let accepted = tracker.accept("node-b", seq);
            prop_assert_eq!(accepted, seq > reference_max);
            reference_max = reference_max.max(seq);
        }
    }

    #[test]
    fn authority_is_deterministic_and_in_bounds(
        name in "[a-z][a-z0-9-]{0,20}",
        member_count in 1usize..10,
    ) {
        let members: Vec<String> = (0..member_count).map(|i| format!("node-{i}")).collect();
        let first = authority::authority_for(&members, &name, authority::FEATURE_CHECKER);
        let second = authority::authority_for(&members, &name, authority::FEATURE_CHECKER);
        prop_assert_eq!(first, second);
        let owner = first.unwrap();
        prop_assert!(members.iter().any(|m| m == owner));
    }

    #[test]
    fn plugin_output_parsing_never_loses_the_first_line(raw in ".{0,200}") {
        let (output, _, _) = parse_plugin_output(&raw);
        prop_assert!(!output.contains('\n'));
    }

    /// Replaying the same message stream twice through the dedup gate leaves
    /// the same state as replaying it once.
    #[test]
    fn replay_is_idempotent_behind_the_dedup_gate(
        states in proptest::collection::vec(0u8..4, 1..20)
    ) {
        let results: Vec<(u64, CheckResult)> = states
            .iter()
            .enumerate()
            .map(|(i, code)| {
                let execution_end = (i + 1) as f64;
                let cr = CheckResult {
                    schedule_start: execution_end,
                    schedule_end: execution_end,
                    execution_start: execution_end,
                    execution_end,
                    exit_status: *code as i32,
                    output: String::new(),
                    long_output: String::new(),
                    performance_data: String::new(),
                    state: CheckState::from_service_exit(*code as i32),
                    check_source: "node-b".into(),
                    vars_before: None,
                    vars_after: None,
                };
                (i as u64 + 1, cr)
            })
            .collect();

        let run = |passes: usize| {
            let bus = Arc::new(EventBus::new());
            let runtime = ObjectRuntime::new(bus.clone());
            let key = ObjectKey::service("web1", "http");
            runtime
                .register(
                    key.clone(),
                    Entity::Service(Service::new("web1".into(), CheckableConfig::default())),
                )
                .unwrap();
            let tracker = SequenceTracker::new();
            for _ in 0..passes {
                for (sequence, cr) in &results {
                    if tracker.accept("node-b", *sequence) {
                        process_check_result(&runtime, &bus, &key, cr.clone(), "node-b", false)
                            .unwrap();
                    }
                }
            }
            let cell = runtime.lookup(&key).unwrap();
            let entity = cell.entity.lock();
            let (_, state) = entity.checkable().unwrap();
            // Wall-clock timestamps differ between runs; compare the
            // logical state only.
            (
                state.state,
                state.state_type,
                state.current_attempt,
                state.flapping,
                state.flap_history.clone(),
            )
        };

        let once = run(1);
        let twice = run(2);
        prop_assert_eq!(once, twice);
    }
}
