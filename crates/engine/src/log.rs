use std::collections::VecDeque;

use chrono::Utc;
use shared::{
    domain::Origin,
    protocol::{EventPayload, EventRecord},
};
use tracing::warn;

/// Handle returned by [`EventLog::subscribe`]; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Push listener. Returning an error drops the subscription: a faulty
/// listener must never break delivery to the others.
pub type Listener = Box<dyn FnMut(&EventRecord) -> anyhow::Result<()> + Send>;

struct Subscriber {
    id: SubscriberId,
    listener: Listener,
}

/// Append-only event log with a bounded ring buffer and synchronous fan-out.
///
/// The sequence counter is the sole ordering authority: gapless, starting at
/// 1, monotonic for the process lifetime. Eviction past the capacity means
/// `list_since` is a best-effort tail, not a full replay log; callers that
/// fall far behind silently miss the oldest events.
pub struct EventLog {
    events: VecDeque<EventRecord>,
    capacity: usize,
    next_sequence: u64,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            next_sequence: 1,
            subscribers: Vec::new(),
            next_subscriber: 1,
        }
    }

    /// Assigns the next sequence, stores the event, and notifies every
    /// subscriber before returning. Callers hold the engine state lock, so
    /// readers can never observe a half-applied append.
    pub fn append(&mut self, origin: Origin, payload: EventPayload) -> EventRecord {
        let record = EventRecord {
            sequence: self.next_sequence,
            kind: payload.kind(),
            origin,
            timestamp: Utc::now(),
            payload,
        };
        self.next_sequence += 1;
        self.events.push_back(record.clone());
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }

        self.subscribers.retain_mut(|subscriber| {
            match (subscriber.listener)(&record) {
                Ok(()) => true,
                Err(error) => {
                    warn!(
                        subscriber = subscriber.id.0,
                        %error,
                        "event listener failed; dropping subscription"
                    );
                    false
                }
            }
        });

        record
    }

    /// All retained events with `sequence > after`, ascending.
    pub fn list_since(&self, after: u64) -> Vec<EventRecord> {
        self.events
            .iter()
            .filter(|event| event.sequence > after)
            .cloned()
            .collect()
    }

    /// Sequence of the most recently appended event, 0 before the first.
    pub fn latest_sequence(&self) -> u64 {
        self.next_sequence - 1
    }

    pub fn subscribe(&mut self, listener: Listener) -> SubscriberId {
        let id = SubscriberId(self.next_subscriber);
        self.next_subscriber += 1;
        self.subscribers.push(Subscriber { id, listener });
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|subscriber| subscriber.id != id);
        self.subscribers.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn inspected(element: &str) -> EventPayload {
        EventPayload::ElementInspected {
            registration_id: None,
            element: element.to_string(),
        }
    }

    #[test]
    fn sequences_are_gapless_from_one() {
        let mut log = EventLog::new(500);
        for expected in 1..=20u64 {
            let record = log.append(Origin::Human, inspected("div"));
            assert_eq!(record.sequence, expected);
        }
        assert_eq!(log.latest_sequence(), 20);
    }

    #[test]
    fn ring_buffer_evicts_oldest_but_keeps_numbering() {
        let mut log = EventLog::new(3);
        for _ in 0..5 {
            log.append(Origin::Agent, inspected("div"));
        }
        let tail = log.list_since(0);
        let sequences: Vec<u64> = tail.iter().map(|event| event.sequence).collect();
        assert_eq!(sequences, vec![3, 4, 5]);
        // A reader that last saw sequence 1 silently misses 2.
        assert_eq!(log.list_since(1).first().map(|e| e.sequence), Some(3));
    }

    #[test]
    fn list_since_returns_only_newer_events() {
        let mut log = EventLog::new(500);
        for _ in 0..4 {
            log.append(Origin::Human, inspected("div"));
        }
        let tail = log.list_since(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].sequence, 3);
        assert_eq!(tail[1].sequence, 4);
        assert!(log.list_since(4).is_empty());
    }

    #[test]
    fn failing_listener_is_dropped_and_others_keep_receiving() {
        let mut log = EventLog::new(500);
        let good_count = Arc::new(Mutex::new(0u32));
        let bad_count = Arc::new(Mutex::new(0u32));

        let good = Arc::clone(&good_count);
        log.subscribe(Box::new(move |_event| {
            *good.lock().expect("count") += 1;
            Ok(())
        }));
        let bad = Arc::clone(&bad_count);
        log.subscribe(Box::new(move |_event| {
            *bad.lock().expect("count") += 1;
            anyhow::bail!("listener blew up")
        }));

        for _ in 0..10 {
            log.append(Origin::Human, inspected("div"));
        }

        assert_eq!(*good_count.lock().expect("count"), 10);
        assert_eq!(*bad_count.lock().expect("count"), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let mut log = EventLog::new(500);
        let count = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&count);
        let id = log.subscribe(Box::new(move |_event| {
            *counter.lock().expect("count") += 1;
            Ok(())
        }));

        log.append(Origin::Human, inspected("div"));
        assert!(log.unsubscribe(id));
        assert!(!log.unsubscribe(id));
        log.append(Origin::Human, inspected("div"));
        assert_eq!(*count.lock().expect("count"), 1);
    }

    #[test]
    fn origin_is_preserved_on_the_record() {
        let mut log = EventLog::new(500);
        let record = log.append(
            Origin::Agent,
            EventPayload::SuggestionRejected {
                suggestion_id: shared::domain::SuggestionId::generate(),
            },
        );
        assert_eq!(record.origin, Origin::Agent);
    }
}
