// tests/unit_protocol_test.rs

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

use vigil::core::checkresult::{CheckResult, CheckState, StateType};
use vigil::core::events::Event;
use vigil::core::cluster::protocol::{
    CheckResultParams, Message, MessageCodec, message_for_event, methods,
};
use vigil::core::objects::checkable::AckType;
use vigil::core::objects::key::ObjectKey;
use vigil::core::objects::runtime_objects::{Comment, Downtime};

fn sample_cr() -> CheckResult {
    CheckResult {
        schedule_start: 1.0,
        schedule_end: 2.0,
        execution_start: 1.0,
        execution_end: 2.0,
        exit_status: 2,
        output: "CRITICAL".into(),
        long_output: String::new(),
        performance_data: String::new(),
        state: CheckState::Critical,
        check_source: "node-a".into(),
        vars_before: None,
        vars_after: None,
    }
}

fn sample_comment() -> Comment {
    Comment {
        id: Uuid::new_v4(),
        legacy_id: 1,
        checkable: ObjectKey::host("web1"),
        author: "ops".into(),
        text: "hi".into(),
        entry_time: 1.0,
        expiry: 0.0,
    }
}

fn sample_downtime() -> Downtime {
    Downtime {
        id: Uuid::new_v4(),
        legacy_id: 2,
        checkable: ObjectKey::host("web1"),
        author: "ops".into(),
        text: "window".into(),
        entry_time: 1.0,
        start_time: 10.0,
        end_time: 20.0,
        triggered: false,
    }
}

#[test]
fn every_replicated_event_maps_to_its_method() {
    let object = ObjectKey::host("web1");
    let authority = "node-a".to_string();
    let cases: Vec<(Event, &str)> = vec![
        (
            Event::CheckResult {
                object: object.clone(),
                cr: sample_cr(),
                authority: authority.clone(),
            },
            methods::CHECK_RESULT,
        ),
        (
            Event::StateChange {
                object: object.clone(),
                state: CheckState::Critical,
                state_type: StateType::Hard,
                authority: authority.clone(),
            },
            methods::STATE_CHANGE,
        ),
        (
            Event::NextCheckChanged {
                object: object.clone(),
                next_check: 99.0,
                authority: authority.clone(),
            },
            methods::NEXT_CHECK_CHANGED,
        ),
        (
            Event::CommentAdded {
                object: object.clone(),
                comment: sample_comment(),
                authority: authority.clone(),
            },
            methods::COMMENT_ADDED,
        ),
        (
            Event::CommentRemoved {
                object: object.clone(),
                comment: sample_comment(),
                authority: authority.clone(),
            },
            methods::COMMENT_REMOVED,
        ),
        (
            Event::DowntimeAdded {
                object: object.clone(),
                downtime: sample_downtime(),
                authority: authority.clone(),
            },
            methods::DOWNTIME_ADDED,
        ),
        (
            Event::DowntimeRemoved {
                object: object.clone(),
                downtime: sample_downtime(),
                authority: authority.clone(),
            },
            methods::DOWNTIME_REMOVED,
        ),
        (
            Event::DowntimeTriggered {
                object: object.clone(),
                downtime: sample_downtime(),
                authority: authority.clone(),
            },
            methods::DOWNTIME_TRIGGERED,
        ),
        (
            Event::AcknowledgementSet {
                object: object.clone(),
                author: "ops".into(),
                text: "ack".into(),
                ack_type: AckType::Sticky,
                expiry: 0.0,
                authority: authority.clone(),
            },
            methods::ACK_SET,
        ),
        (
            Event::AcknowledgementCleared {
                object: object.clone(),
                authority: authority.clone(),
            },
            methods::ACK_CLEARED,
        ),
        (
            Event::ConfigUpdated {
                object: object.clone(),
                properties: serde_json::json!({"check_interval": 60.0}),
                authority: authority.clone(),
            },
            methods::CONFIG_UPDATE,
        ),
    ];
    for (index, (event, expected_method)) in cases.into_iter().enumerate() {
        let message = message_for_event(&event, "node-a", index as u64 + 1).unwrap();
        assert_eq!(message.method, expected_method);
        assert_eq!(message.jsonrpc, "2.0");
        assert_eq!(
            message.envelope(),
            Some(("node-a".to_string(), index as u64 + 1))
        );
        assert!(message.is_journaled());
    }
}

#[test]
fn check_result_params_roundtrip() {
    let event = Event::CheckResult {
        object: ObjectKey::service("web1", "http"),
        cr: sample_cr(),
        authority: "node-a".into(),
    };
    let message = message_for_event(&event, "node-a", 42).unwrap();
    let params: CheckResultParams = serde_json::from_value(message.params).unwrap();
    assert_eq!(params.object, ObjectKey::service("web1", "http"));
    assert_eq!(params.cr, sample_cr());
    assert_eq!(params.envelope.sequence, 42);
}

#[test]
fn codec_decodes_back_to_back_frames() {
    let mut codec = MessageCodec::new(1 << 20);
    let mut buf = BytesMut::new();
    let first = Message::new(methods::LOG_REPLAY_COMPLETE, serde_json::json!({}));
    let second = Message::new(
        methods::HEARTBEAT,
        serde_json::json!({"identity": "node-a", "log_position": 5.0}),
    );
    codec.encode(first.clone(), &mut buf).unwrap();
    codec.encode(second.clone(), &mut buf).unwrap();

    assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), first);
    assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), second);
    assert!(codec.decode(&mut buf).unwrap().is_none());
}

#[test]
fn malformed_json_is_a_protocol_violation() {
    let mut codec = MessageCodec::new(1 << 20);
    let mut buf = BytesMut::new();
    let body = b"not json";
    buf.extend_from_slice(&(body.len() as u64).to_le_bytes());
    buf.extend_from_slice(body);
    assert!(codec.decode(&mut buf).is_err());
}
