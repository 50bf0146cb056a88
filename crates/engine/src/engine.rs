use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use persist::Persist;
use serde_json::Value;
use shared::{
    domain::{Origin, RegistrationId, SuggestionId, SuggestionOutcome, SuggestionStatus, ValueType},
    error::EngineError,
    protocol::{
        EventPayload, EventRecord, HistoryEntry, PropertyEntry, RegistrationSnapshot, SaveFailure,
        SaveReport, SuggestionView,
    },
};
use tokio::sync::Notify;
use tracing::debug;

use crate::{
    classify::classify_value,
    history::HistoryStacks,
    log::{EventLog, Listener, SubscriberId},
    registry::{RegistrationTable, UpsertOutcome},
    suggestions::SuggestionQueue,
};

/// Injected value-type classification, defaulting to
/// [`classify_value`](crate::classify::classify_value).
pub type Classifier = Arc<dyn Fn(&str, &Value) -> ValueType + Send + Sync>;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Ring-buffer capacity of the event log.
    pub event_capacity: usize,
    /// Hard ceiling on a long-poll wait; caller-requested waits are clamped.
    pub max_poll_wait: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_capacity: 500,
            max_poll_wait: Duration::from_secs(30),
        }
    }
}

struct CoreState {
    log: EventLog,
    registry: RegistrationTable,
    suggestions: SuggestionQueue,
    history: HistoryStacks,
    save_in_flight: bool,
}

/// The coordination facade: registration table, event log, suggestion queue
/// and history stacks behind one constructed instance with injected
/// dependencies. No process-wide singletons; tests run independent engines
/// side by side.
///
/// All mutating operations serialize through one mutex with short critical
/// sections; the lock is never held across an await, so slow persistence
/// never blocks live edits from other writers.
pub struct Engine {
    state: Mutex<CoreState>,
    persist: Arc<dyn Persist>,
    classify: Classifier,
    changed: Notify,
    max_poll_wait: Duration,
}

impl Engine {
    pub fn new(config: EngineConfig, persist: Arc<dyn Persist>) -> Self {
        Self::with_classifier(config, persist, Arc::new(classify_value))
    }

    pub fn with_classifier(
        config: EngineConfig,
        persist: Arc<dyn Persist>,
        classify: Classifier,
    ) -> Self {
        Self {
            state: Mutex::new(CoreState {
                log: EventLog::new(config.event_capacity),
                registry: RegistrationTable::default(),
                suggestions: SuggestionQueue::default(),
                history: HistoryStacks::default(),
                save_in_flight: false,
            }),
            persist,
            classify,
            changed: Notify::new(),
            max_poll_wait: config.max_poll_wait,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declares (or re-declares) a tunable component instance.
    ///
    /// A first registration seeds current = source = defaults and emits
    /// `registration-added`. A repeat registration is treated as a remount:
    /// live and source values survive, no event is emitted.
    pub fn register(
        &self,
        id: RegistrationId,
        locator: impl Into<String>,
        defaults: Vec<PropertyEntry>,
    ) -> RegistrationSnapshot {
        let locator = locator.into();
        let snapshot = {
            let mut state = self.lock();
            let classify = &self.classify;
            let outcome = state.registry.upsert(id.clone(), locator.clone(), &defaults, |key, value| {
                classify(key, value)
            });
            if let UpsertOutcome::Created = outcome {
                state.log.append(
                    Origin::Human,
                    EventPayload::RegistrationAdded {
                        registration_id: id.clone(),
                        locator,
                        defaults,
                    },
                );
            }
            state
                .registry
                .get(&id)
                .map(|registration| registration.snapshot())
                .unwrap_or_else(|_| RegistrationSnapshot {
                    id,
                    locator: String::new(),
                    properties: Vec::new(),
                    has_unsaved_changes: false,
                })
        };
        self.changed.notify_waiters();
        snapshot
    }

    /// Soft removal; emits `registration-removed` with the final current
    /// config. Historical events stay in the log.
    pub fn unregister(&self, id: &RegistrationId) -> Result<EventRecord, EngineError> {
        let record = {
            let mut state = self.lock();
            let final_config = state.registry.remove(id)?;
            state.log.append(
                Origin::Human,
                EventPayload::RegistrationRemoved {
                    registration_id: id.clone(),
                    final_config,
                },
            )
        };
        self.changed.notify_waiters();
        Ok(record)
    }

    /// Applies a live edit. Returns `Ok(None)` when the value already equals
    /// the current one: no event, no history entry.
    pub fn update_value(
        &self,
        id: &RegistrationId,
        key: &str,
        value: Value,
        origin: Origin,
    ) -> Result<Option<EventRecord>, EngineError> {
        let record = {
            let mut state = self.lock();
            self.apply_update(&mut state, id, key, value, origin, true)?
        };
        if record.is_some() {
            self.changed.notify_waiters();
        }
        Ok(record)
    }

    fn apply_update(
        &self,
        state: &mut CoreState,
        id: &RegistrationId,
        key: &str,
        value: Value,
        origin: Origin,
        record_history: bool,
    ) -> Result<Option<EventRecord>, EngineError> {
        let value_type = (self.classify)(key, &value);
        let old_value = {
            let registration = state.registry.get_mut(id)?;
            let property = registration
                .property_mut(key)
                .ok_or_else(|| EngineError::KeyNotFound {
                    registration: id.clone(),
                    key: key.to_string(),
                })?;
            if property.current == value {
                return Ok(None);
            }
            let old_value = property.current.clone();
            property.current = value.clone();
            property.value_type = value_type;
            old_value
        };

        if record_history {
            state.history.record_edit(HistoryEntry {
                registration_id: id.clone(),
                key: key.to_string(),
                old_value: old_value.clone(),
                new_value: value.clone(),
            });
        }

        let record = state.log.append(
            origin,
            EventPayload::ValueChanged {
                registration_id: id.clone(),
                key: key.to_string(),
                old_value,
                new_value: value,
                value_type,
            },
        );
        Ok(Some(record))
    }

    /// Persists one key through the external capability. On success the
    /// source value collapses to the snapshot that was written; on failure
    /// nothing changes and the key stays dirty. Never retried automatically.
    pub async fn save_value(
        &self,
        id: &RegistrationId,
        key: &str,
    ) -> Result<EventRecord, EngineError> {
        let (locator, value) = {
            let state = self.lock();
            let registration = state.registry.get(id)?;
            let property = registration
                .property(key)
                .ok_or_else(|| EngineError::KeyNotFound {
                    registration: id.clone(),
                    key: key.to_string(),
                })?;
            (registration.locator.clone(), property.current.clone())
        };

        self.persist
            .persist(&locator, id.as_str(), key, &value)
            .await
            .map_err(|source| EngineError::Persist {
                registration: id.clone(),
                key: key.to_string(),
                source,
            })?;

        let record = {
            let mut state = self.lock();
            commit_saved(&mut state, id, key, &value);
            state.log.append(
                Origin::Human,
                EventPayload::ValueSaved {
                    registration_id: id.clone(),
                    key: key.to_string(),
                    value,
                },
            )
        };
        self.changed.notify_waiters();
        Ok(record)
    }

    /// Saves every dirty key, each independently: one failure never aborts
    /// the rest. At most one save pass runs at a time; a second call while
    /// one is in flight gets `SaveInProgress`.
    pub async fn save_all(&self) -> Result<SaveReport, EngineError> {
        let work = {
            let mut state = self.lock();
            if state.save_in_flight {
                return Err(EngineError::SaveInProgress);
            }
            state.save_in_flight = true;
            state.registry.dirty_pairs()
        };
        let _guard = SaveFlagGuard { engine: self };

        let mut saved = Vec::new();
        let mut failures = Vec::new();
        for (id, locator, key, value) in work {
            match self.persist.persist(&locator, id.as_str(), &key, &value).await {
                Ok(()) => saved.push((id, key, value)),
                Err(error) => {
                    debug!(registration = %id, %key, %error, "save-all: key failed");
                    failures.push(SaveFailure {
                        registration_id: id,
                        key,
                        error: format!("{error:#}"),
                    });
                }
            }
        }

        let saved_count = saved.len();
        if !saved.is_empty() {
            let mut state = self.lock();
            for (id, key, value) in saved {
                commit_saved(&mut state, &id, &key, &value);
                state.log.append(
                    Origin::Human,
                    EventPayload::ValueSaved {
                        registration_id: id,
                        key,
                        value,
                    },
                );
            }
            drop(state);
            self.changed.notify_waiters();
        }

        Ok(SaveReport {
            saved_count,
            failures,
        })
    }

    /// Restores every property of one registration to its source value.
    /// In-memory only; durable storage is never touched. Returns `None`
    /// when nothing was dirty.
    pub fn reset_registration(
        &self,
        id: &RegistrationId,
    ) -> Result<Option<EventRecord>, EngineError> {
        let record = {
            let mut state = self.lock();
            reset_one(&mut state, id)?
        };
        if record.is_some() {
            self.changed.notify_waiters();
        }
        Ok(record)
    }

    /// Resets every active registration; one `value-reset` event per
    /// registration that actually had dirty keys.
    pub fn reset_all(&self) -> Vec<EventRecord> {
        let records = {
            let mut state = self.lock();
            let ids: Vec<RegistrationId> = state
                .registry
                .iter_active()
                .map(|registration| registration.id.clone())
                .collect();
            let mut records = Vec::new();
            for id in ids {
                if let Ok(Some(record)) = reset_one(&mut state, &id) {
                    records.push(record);
                }
            }
            records
        };
        if !records.is_empty() {
            self.changed.notify_waiters();
        }
        records
    }

    /// Reverts the most recent recorded mutation. The revert itself emits a
    /// `value-changed` event but records no history entry; the popped entry
    /// moves to the redo stack instead.
    pub fn undo(&self) -> Result<Option<HistoryEntry>, EngineError> {
        let entry = {
            let mut state = self.lock();
            let Some(entry) = state.history.pop_undo() else {
                return Ok(None);
            };
            let applied = self.apply_update(
                &mut state,
                &entry.registration_id,
                &entry.key,
                entry.old_value.clone(),
                Origin::Human,
                false,
            );
            match applied {
                Ok(_) => {
                    state.history.push_redo(entry.clone());
                    entry
                }
                Err(error) => {
                    // Target vanished mid-session; put the entry back so the
                    // stacks stay consistent with what the caller saw.
                    state.history.push_undo_from_redo(entry);
                    return Err(error);
                }
            }
        };
        self.changed.notify_waiters();
        Ok(Some(entry))
    }

    /// Re-applies the most recently undone mutation.
    pub fn redo(&self) -> Result<Option<HistoryEntry>, EngineError> {
        let entry = {
            let mut state = self.lock();
            let Some(entry) = state.history.pop_redo() else {
                return Ok(None);
            };
            let applied = self.apply_update(
                &mut state,
                &entry.registration_id,
                &entry.key,
                entry.new_value.clone(),
                Origin::Human,
                false,
            );
            match applied {
                Ok(_) => {
                    state.history.push_undo_from_redo(entry.clone());
                    entry
                }
                Err(error) => {
                    state.history.push_redo(entry);
                    return Err(error);
                }
            }
        };
        self.changed.notify_waiters();
        Ok(Some(entry))
    }

    /// Files an agent proposal against an existing registration and key.
    pub fn create_suggestion(
        &self,
        id: &RegistrationId,
        key: &str,
        value: Value,
        reason: impl Into<String>,
    ) -> Result<SuggestionView, EngineError> {
        let suggestion = {
            let mut state = self.lock();
            let registration = state.registry.get(id)?;
            if registration.property(key).is_none() {
                return Err(EngineError::KeyNotFound {
                    registration: id.clone(),
                    key: key.to_string(),
                });
            }
            let suggestion =
                state
                    .suggestions
                    .create(id.clone(), key.to_string(), value, reason.into());
            state.log.append(
                Origin::Agent,
                EventPayload::SuggestionCreated {
                    suggestion: suggestion.clone(),
                },
            );
            suggestion
        };
        self.changed.notify_waiters();
        Ok(suggestion)
    }

    /// Applies a human disposition to a pending suggestion, exactly once.
    ///
    /// Acceptance routes through the same path as a direct edit (so a
    /// `value-changed` event with origin human precedes the
    /// `suggestion-accepted` event) but is never auto-saved; saving remains
    /// a separate explicit action.
    pub fn resolve_suggestion(
        &self,
        id: SuggestionId,
        outcome: SuggestionOutcome,
    ) -> Result<SuggestionView, EngineError> {
        let suggestion = {
            let mut state = self.lock();
            if outcome == SuggestionOutcome::Accepted {
                let pending = state.suggestions.get(id)?.clone();
                if pending.status == SuggestionStatus::Pending {
                    // Validate the target before flipping the status so a
                    // stale suggestion fails cleanly and stays pending.
                    let registration = state.registry.get(&pending.registration_id)?;
                    if registration.property(&pending.key).is_none() {
                        return Err(EngineError::KeyNotFound {
                            registration: pending.registration_id.clone(),
                            key: pending.key.clone(),
                        });
                    }
                }
            }

            let suggestion = state.suggestions.resolve(id, outcome)?;
            match outcome {
                SuggestionOutcome::Accepted => {
                    self.apply_update(
                        &mut state,
                        &suggestion.registration_id,
                        &suggestion.key,
                        suggestion.suggested_value.clone(),
                        Origin::Human,
                        true,
                    )?;
                    state.log.append(
                        Origin::Human,
                        EventPayload::SuggestionAccepted {
                            suggestion_id: suggestion.id,
                            registration_id: suggestion.registration_id.clone(),
                            key: suggestion.key.clone(),
                            value: suggestion.suggested_value.clone(),
                        },
                    );
                }
                SuggestionOutcome::Rejected => {
                    state.log.append(
                        Origin::Human,
                        EventPayload::SuggestionRejected {
                            suggestion_id: suggestion.id,
                        },
                    );
                }
            }
            suggestion
        };
        self.changed.notify_waiters();
        Ok(suggestion)
    }

    pub fn list_suggestions(&self, status: Option<SuggestionStatus>) -> Vec<SuggestionView> {
        self.lock().suggestions.list(status)
    }

    /// Notes that an element is being inspected, so the other side of the
    /// session (usually an agent) can see what the human is pointing at.
    pub fn record_inspection(
        &self,
        registration_id: Option<RegistrationId>,
        element: impl Into<String>,
        origin: Origin,
    ) -> EventRecord {
        let record = {
            let mut state = self.lock();
            state.log.append(
                origin,
                EventPayload::ElementInspected {
                    registration_id,
                    element: element.into(),
                },
            )
        };
        self.changed.notify_waiters();
        record
    }

    pub fn list_registrations(&self) -> Vec<RegistrationSnapshot> {
        self.lock()
            .registry
            .iter_active()
            .map(|registration| registration.snapshot())
            .collect()
    }

    pub fn get_registration(&self, id: &RegistrationId) -> Option<RegistrationSnapshot> {
        self.lock()
            .registry
            .get(id)
            .ok()
            .map(|registration| registration.snapshot())
    }

    pub fn has_unsaved_changes(&self, id: &RegistrationId) -> Result<bool, EngineError> {
        Ok(self.lock().registry.get(id)?.has_unsaved_changes())
    }

    /// Best-effort tail of retained events with `sequence > after`. Events
    /// older than the ring buffer are silently gone.
    pub fn list_since(&self, after: u64) -> Vec<EventRecord> {
        self.lock().log.list_since(after)
    }

    pub fn latest_sequence(&self) -> u64 {
        self.lock().log.latest_sequence()
    }

    /// Long-poll read: returns as soon as events newer than `after` exist,
    /// or an empty vec once the (clamped) wait elapses. Never blocks
    /// indefinitely.
    pub async fn wait_for_events(&self, after: u64, wait: Duration) -> Vec<EventRecord> {
        let wait = wait.min(self.max_poll_wait);
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let events = self.lock().log.list_since(after);
            if !events.is_empty() {
                return events;
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Vec::new();
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Vec::new();
            }
        }
    }

    /// Registers a push listener, called synchronously with every appended
    /// event in commit order. A listener that fails is dropped; the rest
    /// keep receiving.
    pub fn subscribe(&self, listener: Listener) -> SubscriberId {
        self.lock().log.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.lock().log.unsubscribe(id)
    }
}

fn commit_saved(state: &mut CoreState, id: &RegistrationId, key: &str, value: &Value) {
    // The registration may have been removed while the write was in flight;
    // the durable write still happened, only the in-memory collapse is
    // skipped then.
    if let Ok(registration) = state.registry.get_mut(id) {
        if let Some(property) = registration.property_mut(key) {
            property.source = value.clone();
        }
    }
}

fn reset_one(
    state: &mut CoreState,
    id: &RegistrationId,
) -> Result<Option<EventRecord>, EngineError> {
    let mut entries = Vec::new();
    {
        let registration = state.registry.get_mut(id)?;
        let dirty: Vec<String> = registration
            .entries()
            .filter(|(_, property)| property.dirty())
            .map(|(key, _)| key.to_string())
            .collect();
        for key in dirty {
            if let Some(property) = registration.property_mut(&key) {
                entries.push(HistoryEntry {
                    registration_id: id.clone(),
                    key,
                    old_value: property.current.clone(),
                    new_value: property.source.clone(),
                });
                property.current = property.source.clone();
            }
        }
    }
    if entries.is_empty() {
        return Ok(None);
    }

    let keys: Vec<String> = entries.iter().map(|entry| entry.key.clone()).collect();
    for entry in entries {
        state.history.record_edit(entry);
    }
    let record = state.log.append(
        Origin::Human,
        EventPayload::ValueReset {
            registration_id: id.clone(),
            keys,
        },
    );
    Ok(Some(record))
}

/// Clears the save-all guard even when the calling future is dropped
/// mid-write, so an abandoned pass cannot wedge every later one.
struct SaveFlagGuard<'a> {
    engine: &'a Engine,
}

impl Drop for SaveFlagGuard<'_> {
    fn drop(&mut self) {
        self.engine.lock().save_in_flight = false;
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
