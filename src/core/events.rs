// src/core/events.rs

//! The process-wide event bus.
//!
//! Publishing is a synchronous fan-out: every subscriber runs on the
//! publishing thread, in registration order. Handlers that need async work
//! hand the event off to their own queue; the cluster relay is the canonical
//! example. Unsubscription blocks until in-flight deliveries complete
//! (publish holds the read lock, unsubscribe takes the write lock).

use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use strum_macros::EnumDiscriminants;

use crate::core::checkresult::{CheckResult, CheckState, StateType};
use crate::core::objects::checkable::AckType;
use crate::core::objects::key::ObjectKey;
use crate::core::objects::runtime_objects::{Comment, Downtime};

/// Reasons a notification was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Problem,
    Reminder,
}

/// Everything observable that happens to an entity flows through here.
/// `authority` is the name of the peer that originated the event.
#[derive(Debug, Clone, EnumDiscriminants)]
#[strum_discriminants(name(EventKind), derive(Hash))]
pub enum Event {
    CheckResult {
        object: ObjectKey,
        cr: CheckResult,
        authority: String,
    },
    StateChange {
        object: ObjectKey,
        state: CheckState,
        state_type: StateType,
        authority: String,
    },
    NextCheckChanged {
        object: ObjectKey,
        next_check: f64,
        authority: String,
    },
    FlappingChanged {
        object: ObjectKey,
        started: bool,
        authority: String,
    },
    AcknowledgementSet {
        object: ObjectKey,
        author: String,
        text: String,
        ack_type: AckType,
        expiry: f64,
        authority: String,
    },
    AcknowledgementCleared {
        object: ObjectKey,
        authority: String,
    },
    CommentAdded {
        object: ObjectKey,
        comment: Comment,
        authority: String,
    },
    CommentRemoved {
        object: ObjectKey,
        comment: Comment,
        authority: String,
    },
    DowntimeAdded {
        object: ObjectKey,
        downtime: Downtime,
        authority: String,
    },
    DowntimeRemoved {
        object: ObjectKey,
        downtime: Downtime,
        authority: String,
    },
    DowntimeTriggered {
        object: ObjectKey,
        downtime: Downtime,
        authority: String,
    },
    NotificationSent {
        object: ObjectKey,
        kind: NotificationKind,
        state: CheckState,
        authority: String,
    },
    AttributeChanged {
        object: ObjectKey,
        attr: String,
        old: Value,
        new: Value,
        authority: String,
    },
    ConfigUpdated {
        object: ObjectKey,
        properties: Value,
        authority: String,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        self.into()
    }

    pub fn object(&self) -> &ObjectKey {
        match self {
            Event::CheckResult { object, .. }
            | Event::StateChange { object, .. }
            | Event::NextCheckChanged { object, .. }
            | Event::FlappingChanged { object, .. }
            | Event::AcknowledgementSet { object, .. }
            | Event::AcknowledgementCleared { object, .. }
            | Event::CommentAdded { object, .. }
            | Event::CommentRemoved { object, .. }
            | Event::DowntimeAdded { object, .. }
            | Event::DowntimeRemoved { object, .. }
            | Event::DowntimeTriggered { object, .. }
            | Event::NotificationSent { object, .. }
            | Event::AttributeChanged { object, .. }
            | Event::ConfigUpdated { object, .. } => object,
        }
    }

    pub fn authority(&self) -> &str {
        match self {
            Event::CheckResult { authority, .. }
            | Event::StateChange { authority, .. }
            | Event::NextCheckChanged { authority, .. }
            | Event::FlappingChanged { authority, .. }
            | Event::AcknowledgementSet { authority, .. }
            | Event::AcknowledgementCleared { authority, .. }
            | Event::CommentAdded { authority, .. }
            | Event::CommentRemoved { authority, .. }
            | Event::DowntimeAdded { authority, .. }
            | Event::DowntimeRemoved { authority, .. }
            | Event::DowntimeTriggered { authority, .. }
            | Event::NotificationSent { authority, .. }
            | Event::AttributeChanged { authority, .. }
            | Event::ConfigUpdated { authority, .. } => authority,
        }
    }
}

type Handler = Box<dyn Fn(&Event) + Send + Sync>;

struct Subscriber {
    id: u64,
    /// `None` subscribes to every kind.
    kinds: Option<Vec<EventKind>>,
    handler: Handler,
}

/// Handle returned by `subscribe`, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// The engine-owned bus value. No module-level singletons: the engine creates
/// one and hands `Arc` clones to whoever publishes or subscribes.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler. `kinds = None` receives every event.
    pub fn subscribe<F>(&self, kinds: Option<Vec<EventKind>>, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push(Subscriber {
            id,
            kinds,
            handler: Box::new(handler),
        });
        SubscriptionId(id)
    }

    /// Removes a subscriber. Blocks until deliveries already in flight have
    /// completed.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.write().retain(|sub| sub.id != id.0);
    }

    /// Delivers the event to every matching subscriber, in registration
    /// order, on the calling thread.
    pub fn publish(&self, event: &Event) {
        let kind = event.kind();
        let subscribers = self.subscribers.read();
        for sub in subscribers.iter() {
            let matches = match &sub.kinds {
                None => true,
                Some(kinds) => kinds.contains(&kind),
            };
            if matches {
                (sub.handler)(event);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn state_change(name: &str) -> Event {
        Event::StateChange {
            object: ObjectKey::host(name),
            state: CheckState::Down,
            state_type: StateType::Hard,
            authority: "node-a".into(),
        }
    }

    #[test]
    fn delivery_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = order.clone();
            bus.subscribe(None, move |_| order.lock().push(tag));
        }
        bus.publish(&state_change("web1"));
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn kind_filter_applies() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        bus.subscribe(Some(vec![EventKind::NextCheckChanged]), move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        bus.publish(&state_change("web1"));
        assert_eq!(hits.load(Ordering::Relaxed), 0);
        bus.publish(&Event::NextCheckChanged {
            object: ObjectKey::host("web1"),
            next_check: 42.0,
            authority: "node-a".into(),
        });
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = bus.subscribe(None, move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        bus.publish(&state_change("web1"));
        bus.unsubscribe(id);
        bus.publish(&state_change("web1"));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
