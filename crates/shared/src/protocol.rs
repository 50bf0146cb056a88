use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{
    Origin, RegistrationId, SuggestionId, SuggestionOutcome, SuggestionStatus, ValueType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    RegistrationAdded,
    RegistrationRemoved,
    ValueChanged,
    ValueSaved,
    ValueReset,
    ElementInspected,
    SuggestionCreated,
    SuggestionAccepted,
    SuggestionRejected,
}

/// Kind-specific event data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    RegistrationAdded {
        registration_id: RegistrationId,
        locator: String,
        defaults: Vec<PropertyEntry>,
    },
    RegistrationRemoved {
        registration_id: RegistrationId,
        final_config: Vec<PropertyEntry>,
    },
    ValueChanged {
        registration_id: RegistrationId,
        key: String,
        old_value: Value,
        new_value: Value,
        value_type: ValueType,
    },
    ValueSaved {
        registration_id: RegistrationId,
        key: String,
        value: Value,
    },
    ValueReset {
        registration_id: RegistrationId,
        keys: Vec<String>,
    },
    ElementInspected {
        registration_id: Option<RegistrationId>,
        element: String,
    },
    SuggestionCreated {
        suggestion: SuggestionView,
    },
    SuggestionAccepted {
        suggestion_id: SuggestionId,
        registration_id: RegistrationId,
        key: String,
        value: Value,
    },
    SuggestionRejected {
        suggestion_id: SuggestionId,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::RegistrationAdded { .. } => EventKind::RegistrationAdded,
            Self::RegistrationRemoved { .. } => EventKind::RegistrationRemoved,
            Self::ValueChanged { .. } => EventKind::ValueChanged,
            Self::ValueSaved { .. } => EventKind::ValueSaved,
            Self::ValueReset { .. } => EventKind::ValueReset,
            Self::ElementInspected { .. } => EventKind::ElementInspected,
            Self::SuggestionCreated { .. } => EventKind::SuggestionCreated,
            Self::SuggestionAccepted { .. } => EventKind::SuggestionAccepted,
            Self::SuggestionRejected { .. } => EventKind::SuggestionRejected,
        }
    }
}

/// One committed event. `sequence` is the sole ordering authority; the
/// timestamp is informational and must never drive ordering decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub sequence: u64,
    pub kind: EventKind,
    pub origin: Origin,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

/// A key together with a value, in declaration order. Used wherever a whole
/// property map crosses the wire so the declared ordering survives JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyEntry {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertySnapshot {
    pub key: String,
    pub current_value: Value,
    pub source_value: Value,
    pub value_type: ValueType,
    pub dirty: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationSnapshot {
    pub id: RegistrationId,
    pub locator: String,
    pub properties: Vec<PropertySnapshot>,
    pub has_unsaved_changes: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestionView {
    pub id: SuggestionId,
    pub registration_id: RegistrationId,
    pub key: String,
    pub suggested_value: Value,
    pub reason: String,
    pub status: SuggestionStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub registration_id: RegistrationId,
    pub key: String,
    pub old_value: Value,
    pub new_value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveFailure {
    pub registration_id: RegistrationId,
    pub key: String,
    pub error: String,
}

/// Outcome of a `save-all` pass. Each key is attempted independently, so a
/// report can carry both successes and failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveReport {
    pub saved_count: usize,
    pub failures: Vec<SaveFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub id: RegistrationId,
    /// Where this registration's values live in durable storage. Transport
    /// adapters may substitute a configured default when omitted.
    #[serde(default)]
    pub locator: Option<String>,
    pub defaults: Vec<PropertyEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateValueRequest {
    pub registration_id: RegistrationId,
    pub key: String,
    pub value: Value,
    pub origin: Origin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveValueRequest {
    pub registration_id: RegistrationId,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSuggestionRequest {
    pub registration_id: RegistrationId,
    pub key: String,
    pub value: Value,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveSuggestionRequest {
    pub outcome: SuggestionOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectionRequest {
    pub registration_id: Option<RegistrationId>,
    pub element: String,
    pub origin: Origin,
}

/// Response to a pull read of the event tail. `latest_sequence` lets a
/// poller resume even when `events` is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsResponse {
    pub events: Vec<EventRecord>,
    pub latest_sequence: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kinds_use_kebab_case_on_the_wire() {
        let kind = serde_json::to_string(&EventKind::ValueSaved).expect("json");
        assert_eq!(kind, "\"value-saved\"");
        let kind = serde_json::to_string(&EventKind::ElementInspected).expect("json");
        assert_eq!(kind, "\"element-inspected\"");
    }

    #[test]
    fn event_record_round_trips_with_payload_tag() {
        let record = EventRecord {
            sequence: 7,
            kind: EventKind::ValueChanged,
            origin: Origin::Agent,
            timestamp: Utc::now(),
            payload: EventPayload::ValueChanged {
                registration_id: RegistrationId::new("hero"),
                key: "padding".into(),
                old_value: serde_json::json!(60),
                new_value: serde_json::json!(80),
                value_type: ValueType::Number,
            },
        };
        let text = serde_json::to_string(&record).expect("json");
        assert!(text.contains("\"value_changed\""));
        let parsed: EventRecord = serde_json::from_str(&text).expect("parse");
        assert_eq!(parsed.sequence, 7);
        assert_eq!(parsed.payload.kind(), EventKind::ValueChanged);
    }
}
