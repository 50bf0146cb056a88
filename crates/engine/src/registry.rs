use std::collections::HashMap;

use serde_json::Value;
use shared::{
    domain::{RegistrationId, ValueType},
    error::EngineError,
    protocol::{PropertyEntry, PropertySnapshot, RegistrationSnapshot},
};

#[derive(Debug, Clone)]
pub struct PropertyState {
    pub current: Value,
    pub source: Value,
    pub value_type: ValueType,
}

impl PropertyState {
    pub fn dirty(&self) -> bool {
        self.current != self.source
    }
}

/// One registered tunable component instance. `keys` preserves declaration
/// order; `properties` backs the lookups.
pub struct Registration {
    pub id: RegistrationId,
    pub locator: String,
    keys: Vec<String>,
    properties: HashMap<String, PropertyState>,
    pub removed: bool,
}

impl Registration {
    pub fn property(&self, key: &str) -> Option<&PropertyState> {
        self.properties.get(key)
    }

    pub fn property_mut(&mut self, key: &str) -> Option<&mut PropertyState> {
        self.properties.get_mut(key)
    }

    /// Properties in declaration order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &PropertyState)> {
        self.keys
            .iter()
            .filter_map(|key| self.properties.get(key).map(|state| (key.as_str(), state)))
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.properties.values().any(PropertyState::dirty)
    }

    pub fn current_config(&self) -> Vec<PropertyEntry> {
        self.entries()
            .map(|(key, state)| PropertyEntry {
                key: key.to_string(),
                value: state.current.clone(),
            })
            .collect()
    }

    pub fn snapshot(&self) -> RegistrationSnapshot {
        RegistrationSnapshot {
            id: self.id.clone(),
            locator: self.locator.clone(),
            properties: self
                .entries()
                .map(|(key, state)| PropertySnapshot {
                    key: key.to_string(),
                    current_value: state.current.clone(),
                    source_value: state.source.clone(),
                    value_type: state.value_type,
                    dirty: state.dirty(),
                })
                .collect(),
            has_unsaved_changes: self.has_unsaved_changes(),
        }
    }
}

pub enum UpsertOutcome {
    /// First sighting: current and source were seeded from the defaults.
    Created,
    /// The component remounted; live and source values were preserved.
    Remounted,
}

/// In-memory table of registrations, keyed by id with stable iteration
/// order. Removal is soft so that a later remount restores nothing but the
/// id slot; historical events are never touched.
#[derive(Default)]
pub struct RegistrationTable {
    order: Vec<RegistrationId>,
    registrations: HashMap<RegistrationId, Registration>,
}

impl RegistrationTable {
    pub fn upsert(
        &mut self,
        id: RegistrationId,
        locator: String,
        defaults: &[PropertyEntry],
        classify: impl Fn(&str, &Value) -> ValueType,
    ) -> UpsertOutcome {
        if let Some(existing) = self.registrations.get_mut(&id) {
            existing.locator = locator;
            existing.removed = false;
            // Remount: keep live edits, only seed keys not seen before.
            for entry in defaults {
                if !existing.properties.contains_key(&entry.key) {
                    existing.keys.push(entry.key.clone());
                    existing.properties.insert(
                        entry.key.clone(),
                        PropertyState {
                            current: entry.value.clone(),
                            source: entry.value.clone(),
                            value_type: classify(&entry.key, &entry.value),
                        },
                    );
                }
            }
            return UpsertOutcome::Remounted;
        }

        let mut keys = Vec::with_capacity(defaults.len());
        let mut properties = HashMap::with_capacity(defaults.len());
        for entry in defaults {
            keys.push(entry.key.clone());
            properties.insert(
                entry.key.clone(),
                PropertyState {
                    current: entry.value.clone(),
                    source: entry.value.clone(),
                    value_type: classify(&entry.key, &entry.value),
                },
            );
        }
        self.order.push(id.clone());
        self.registrations.insert(
            id.clone(),
            Registration {
                id,
                locator,
                keys,
                properties,
                removed: false,
            },
        );
        UpsertOutcome::Created
    }

    pub fn get(&self, id: &RegistrationId) -> Result<&Registration, EngineError> {
        self.registrations
            .get(id)
            .filter(|registration| !registration.removed)
            .ok_or_else(|| EngineError::RegistrationNotFound(id.clone()))
    }

    pub fn get_mut(&mut self, id: &RegistrationId) -> Result<&mut Registration, EngineError> {
        self.registrations
            .get_mut(id)
            .filter(|registration| !registration.removed)
            .ok_or_else(|| EngineError::RegistrationNotFound(id.clone()))
    }

    /// Marks the registration removed and returns its final current config.
    pub fn remove(&mut self, id: &RegistrationId) -> Result<Vec<PropertyEntry>, EngineError> {
        let registration = self.get_mut(id)?;
        registration.removed = true;
        Ok(registration.current_config())
    }

    /// Active registrations in first-registration order.
    pub fn iter_active(&self) -> impl Iterator<Item = &Registration> {
        self.order
            .iter()
            .filter_map(|id| self.registrations.get(id))
            .filter(|registration| !registration.removed)
    }

    /// Dirty `(id, locator, key, current)` tuples across every active
    /// registration, used by save-all to snapshot its work list.
    pub fn dirty_pairs(&self) -> Vec<(RegistrationId, String, String, Value)> {
        self.iter_active()
            .flat_map(|registration| {
                registration.entries().filter(|(_, state)| state.dirty()).map(
                    move |(key, state)| {
                        (
                            registration.id.clone(),
                            registration.locator.clone(),
                            key.to_string(),
                            state.current.clone(),
                        )
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify_value;
    use serde_json::json;

    fn defaults() -> Vec<PropertyEntry> {
        vec![
            PropertyEntry {
                key: "padding".into(),
                value: json!(60),
            },
            PropertyEntry {
                key: "accent".into(),
                value: json!("#3b82f6"),
            },
        ]
    }

    #[test]
    fn upsert_seeds_current_and_source_from_defaults() {
        let mut table = RegistrationTable::default();
        let outcome = table.upsert(
            RegistrationId::new("hero"),
            "src/Hero.tsx".into(),
            &defaults(),
            classify_value,
        );
        assert!(matches!(outcome, UpsertOutcome::Created));

        let registration = table.get(&RegistrationId::new("hero")).expect("registered");
        let padding = registration.property("padding").expect("padding");
        assert_eq!(padding.current, json!(60));
        assert_eq!(padding.source, json!(60));
        assert_eq!(padding.value_type, ValueType::Number);
        assert_eq!(
            registration.property("accent").expect("accent").value_type,
            ValueType::Color
        );
        assert!(!registration.has_unsaved_changes());
    }

    #[test]
    fn remount_preserves_live_edits() {
        let mut table = RegistrationTable::default();
        let id = RegistrationId::new("hero");
        table.upsert(id.clone(), "src/Hero.tsx".into(), &defaults(), classify_value);
        table
            .get_mut(&id)
            .expect("registered")
            .property_mut("padding")
            .expect("padding")
            .current = json!(95);

        let outcome = table.upsert(id.clone(), "src/Hero.tsx".into(), &defaults(), classify_value);
        assert!(matches!(outcome, UpsertOutcome::Remounted));
        let registration = table.get(&id).expect("registered");
        assert_eq!(
            registration.property("padding").expect("padding").current,
            json!(95)
        );
        assert!(registration.has_unsaved_changes());
    }

    #[test]
    fn removal_is_soft_and_reports_final_config() {
        let mut table = RegistrationTable::default();
        let id = RegistrationId::new("hero");
        table.upsert(id.clone(), "src/Hero.tsx".into(), &defaults(), classify_value);

        let final_config = table.remove(&id).expect("removed");
        assert_eq!(final_config.len(), 2);
        assert_eq!(final_config[0].key, "padding");
        assert!(table.get(&id).is_err());
        assert!(table.remove(&id).is_err());
        assert_eq!(table.iter_active().count(), 0);
    }

    #[test]
    fn entries_keep_declaration_order() {
        let mut table = RegistrationTable::default();
        let id = RegistrationId::new("hero");
        table.upsert(id.clone(), "src/Hero.tsx".into(), &defaults(), classify_value);
        let keys: Vec<&str> = table
            .get(&id)
            .expect("registered")
            .entries()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec!["padding", "accent"]);
    }

    #[test]
    fn dirty_pairs_only_lists_changed_keys() {
        let mut table = RegistrationTable::default();
        let id = RegistrationId::new("hero");
        table.upsert(id.clone(), "src/Hero.tsx".into(), &defaults(), classify_value);
        assert!(table.dirty_pairs().is_empty());

        table
            .get_mut(&id)
            .expect("registered")
            .property_mut("padding")
            .expect("padding")
            .current = json!(80);
        let pairs = table.dirty_pairs();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].2, "padding");
        assert_eq!(pairs[0].3, json!(80));
    }
}
