use std::collections::HashMap;

use chrono::Utc;
use serde_json::Value;
use shared::{
    domain::{RegistrationId, SuggestionId, SuggestionOutcome, SuggestionStatus},
    error::EngineError,
    protocol::SuggestionView,
};

/// Pending/accepted/rejected proposals from agents, in creation order.
/// Resolution is exactly-once; a second attempt is an error, never a silent
/// overwrite.
#[derive(Default)]
pub struct SuggestionQueue {
    order: Vec<SuggestionId>,
    suggestions: HashMap<SuggestionId, SuggestionView>,
}

impl SuggestionQueue {
    pub fn create(
        &mut self,
        registration_id: RegistrationId,
        key: String,
        suggested_value: Value,
        reason: String,
    ) -> SuggestionView {
        let suggestion = SuggestionView {
            id: SuggestionId::generate(),
            registration_id,
            key,
            suggested_value,
            reason,
            status: SuggestionStatus::Pending,
            created_at: Utc::now(),
        };
        self.order.push(suggestion.id);
        self.suggestions.insert(suggestion.id, suggestion.clone());
        suggestion
    }

    pub fn get(&self, id: SuggestionId) -> Result<&SuggestionView, EngineError> {
        self.suggestions
            .get(&id)
            .ok_or(EngineError::SuggestionNotFound(id))
    }

    /// Moves a pending suggestion to its terminal status.
    pub fn resolve(
        &mut self,
        id: SuggestionId,
        outcome: SuggestionOutcome,
    ) -> Result<SuggestionView, EngineError> {
        let suggestion = self
            .suggestions
            .get_mut(&id)
            .ok_or(EngineError::SuggestionNotFound(id))?;
        if suggestion.status != SuggestionStatus::Pending {
            return Err(EngineError::AlreadyResolved(id));
        }
        suggestion.status = match outcome {
            SuggestionOutcome::Accepted => SuggestionStatus::Accepted,
            SuggestionOutcome::Rejected => SuggestionStatus::Rejected,
        };
        Ok(suggestion.clone())
    }

    pub fn list(&self, status: Option<SuggestionStatus>) -> Vec<SuggestionView> {
        self.order
            .iter()
            .filter_map(|id| self.suggestions.get(id))
            .filter(|suggestion| status.is_none_or(|wanted| suggestion.status == wanted))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue_with_one() -> (SuggestionQueue, SuggestionId) {
        let mut queue = SuggestionQueue::default();
        let suggestion = queue.create(
            RegistrationId::new("hero"),
            "padding".into(),
            json!(80),
            "more breathing room".into(),
        );
        (queue, suggestion.id)
    }

    #[test]
    fn created_suggestions_start_pending() {
        let (queue, id) = queue_with_one();
        assert_eq!(
            queue.get(id).expect("present").status,
            SuggestionStatus::Pending
        );
        assert_eq!(queue.list(Some(SuggestionStatus::Pending)).len(), 1);
        assert!(queue.list(Some(SuggestionStatus::Accepted)).is_empty());
    }

    #[test]
    fn resolution_is_exactly_once() {
        let (mut queue, id) = queue_with_one();
        let resolved = queue
            .resolve(id, SuggestionOutcome::Rejected)
            .expect("first resolution");
        assert_eq!(resolved.status, SuggestionStatus::Rejected);

        let second = queue.resolve(id, SuggestionOutcome::Accepted);
        assert!(matches!(second, Err(EngineError::AlreadyResolved(_))));
        // Status must be unchanged by the failed attempt.
        assert_eq!(
            queue.get(id).expect("present").status,
            SuggestionStatus::Rejected
        );
    }

    #[test]
    fn unknown_suggestion_is_not_found() {
        let mut queue = SuggestionQueue::default();
        let missing = queue.resolve(SuggestionId::generate(), SuggestionOutcome::Accepted);
        assert!(matches!(missing, Err(EngineError::SuggestionNotFound(_))));
    }
}
