//! Engine event bus.
//!
//! Observers register per event kind and are invoked synchronously, in
//! registration order, after the state change that produced the event has
//! been committed. Events never carry key material.

use crate::keys::KeyAlgorithm;
use crate::store::AgentPair;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    KeyGenerated,
    ExchangeInitiated,
    ExchangeEstablished,
    ExchangeFailed,
    KeyRotated,
    KeyRevoked,
    KeyRotationWarning,
    SecretRotated,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::KeyGenerated,
        EventKind::ExchangeInitiated,
        EventKind::ExchangeEstablished,
        EventKind::ExchangeFailed,
        EventKind::KeyRotated,
        EventKind::KeyRevoked,
        EventKind::KeyRotationWarning,
        EventKind::SecretRotated,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::KeyGenerated => "key.generated",
            EventKind::ExchangeInitiated => "exchange.initiated",
            EventKind::ExchangeEstablished => "exchange.established",
            EventKind::ExchangeFailed => "exchange.failed",
            EventKind::KeyRotated => "key.rotated",
            EventKind::KeyRevoked => "key.revoked",
            EventKind::KeyRotationWarning => "key.rotation.warning",
            EventKind::SecretRotated => "secret.rotated",
        }
    }

    pub fn from_name(name: &str) -> Option<EventKind> {
        EventKind::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

/// Why a rotation warning fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarningReason {
    UsageThreshold { usage: u64, max_usage: u64 },
    ExpiryApproaching { seconds_left: i64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    KeyGenerated {
        agent_id: String,
        key_id: String,
        algorithm: KeyAlgorithm,
        hsm_backed: bool,
    },
    ExchangeInitiated {
        request_id: Uuid,
        from: String,
        to: String,
    },
    ExchangeEstablished {
        request_id: Uuid,
        secret_id: Uuid,
        pair: AgentPair,
    },
    ExchangeFailed {
        request_id: Uuid,
        from: String,
        to: String,
        reason: String,
    },
    KeyRotated {
        agent_id: String,
        previous_key_id: Option<String>,
        key_id: String,
        emergency: bool,
    },
    KeyRevoked {
        agent_id: String,
        key_id: String,
    },
    KeyRotationWarning {
        agent_id: String,
        key_id: String,
        reason: WarningReason,
    },
    SecretRotated {
        pair: AgentPair,
        previous_secret_id: Uuid,
        secret_id: Uuid,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::KeyGenerated { .. } => EventKind::KeyGenerated,
            EngineEvent::ExchangeInitiated { .. } => EventKind::ExchangeInitiated,
            EngineEvent::ExchangeEstablished { .. } => EventKind::ExchangeEstablished,
            EngineEvent::ExchangeFailed { .. } => EventKind::ExchangeFailed,
            EngineEvent::KeyRotated { .. } => EventKind::KeyRotated,
            EngineEvent::KeyRevoked { .. } => EventKind::KeyRevoked,
            EngineEvent::KeyRotationWarning { .. } => EventKind::KeyRotationWarning,
            EngineEvent::SecretRotated { .. } => EventKind::SecretRotated,
        }
    }
}

/// An event as delivered to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Per-engine sequence number, strictly increasing
    pub sequence: u64,
    pub emitted_at: DateTime<Utc>,
    pub event: EngineEvent,
}

pub type Observer = Arc<dyn Fn(&EventEnvelope) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Event name -> ordered observers
pub struct EventBus {
    observers: RwLock<HashMap<EventKind, Vec<(SubscriptionId, Observer)>>>,
    next_subscription: AtomicU64,
    sequence: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn subscribe<F>(&self, kind: EventKind, observer: F) -> SubscriptionId
    where
        F: Fn(&EventEnvelope) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.observers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(observer)));
        id
    }

    /// Subscribe one observer to every event kind. Returns one id per kind.
    pub fn subscribe_all<F>(&self, observer: F) -> Vec<SubscriptionId>
    where
        F: Fn(&EventEnvelope) + Send + Sync + 'static,
    {
        let observer: Observer = Arc::new(observer);
        EventKind::ALL
            .into_iter()
            .map(|kind| {
                let observer = observer.clone();
                self.subscribe(kind, move |envelope| observer(envelope))
            })
            .collect()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.write();
        let mut removed = false;
        for list in observers.values_mut() {
            let before = list.len();
            list.retain(|(sid, _)| *sid != id);
            removed |= list.len() != before;
        }
        removed
    }

    pub fn observer_count(&self, kind: EventKind) -> usize {
        self.observers.read().get(&kind).map_or(0, |list| list.len())
    }

    /// Deliver an event to the observers of its kind.
    pub fn emit(&self, event: EngineEvent, emitted_at: DateTime<Utc>) {
        let kind = event.kind();
        // Snapshot so observers may (un)subscribe without deadlocking
        let targets: Vec<Observer> = match self.observers.read().get(&kind) {
            Some(list) => list.iter().map(|(_, observer)| observer.clone()).collect(),
            None => Vec::new(),
        };

        let envelope = EventEnvelope {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            emitted_at,
            event,
        };

        tracing::trace!(event = kind.name(), sequence = envelope.sequence, "Emitting event");

        for observer in targets {
            observer(&envelope);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn revoked(key: &str) -> EngineEvent {
        EngineEvent::KeyRevoked {
            agent_id: "alice".to_string(),
            key_id: key.to_string(),
        }
    }

    #[test]
    fn test_names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(EventKind::KeyRotationWarning.name(), "key.rotation.warning");
        assert!(EventKind::from_name("key.unknown").is_none());
    }

    #[test]
    fn test_observers_run_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let log = log.clone();
            bus.subscribe(EventKind::KeyRevoked, move |_| log.lock().push(tag));
        }
        let other = log.clone();
        bus.subscribe(EventKind::KeyGenerated, move |_| other.lock().push("wrong-kind"));

        bus.emit(revoked("k1"), Utc::now());
        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_sequence_increases_and_unsubscribe() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = bus.subscribe(EventKind::KeyRevoked, move |env| sink.lock().push(env.sequence));

        bus.emit(revoked("k1"), Utc::now());
        bus.emit(revoked("k2"), Utc::now());
        assert!(bus.unsubscribe(id));
        bus.emit(revoked("k3"), Utc::now());

        assert_eq!(*seen.lock(), vec![0, 1]);
        assert_eq!(bus.observer_count(EventKind::KeyRevoked), 0);
        assert!(!bus.unsubscribe(id));
    }

    #[test]
    fn test_subscribe_all() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        let ids = bus.subscribe_all(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ids.len(), EventKind::ALL.len());

        bus.emit(revoked("k1"), Utc::now());
        bus.emit(
            EngineEvent::ExchangeInitiated {
                request_id: Uuid::new_v4(),
                from: "alice".to_string(),
                to: "bob".to_string(),
            },
            Utc::now(),
        );
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
