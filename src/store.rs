use std::collections::BTreeMap;

use crate::core::{Key, Settings, Value};
use crate::setting::{Constraint, FixUp, SettingAttributes, SettingState};

/// Per-node registry of declared settings and derived stored data.
///
/// The set of setting keys is fixed at construction; values, constraints and
/// attributes change, keys never do. Stored data entries are either present or
/// absent, absence meaning "not derived yet".
#[derive(Debug, Clone, Default)]
pub struct SettingStore {
    keys: Vec<Key>,
    settings: BTreeMap<Key, SettingState>,
    stored: BTreeMap<Key, Value>,
}

impl SettingStore {
    /// Declares `keys` in order. Keys missing from `defaults` start as `Null`.
    pub(crate) fn new(keys: Vec<Key>, defaults: &Settings) -> Self {
        let settings = keys
            .iter()
            .map(|key| {
                let value = defaults.get(key).cloned().unwrap_or(Value::Null);
                (key.clone(), SettingState::new(value))
            })
            .collect();

        Self {
            keys,
            settings,
            stored: BTreeMap::new(),
        }
    }

    /// The declared setting keys, in declaration order.
    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn contains(&self, key: &str) -> bool {
        self.settings.contains_key(key)
    }

    pub fn state(&self, key: &str) -> Option<&SettingState> {
        self.settings.get(key)
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.settings.get(key).map(SettingState::value)
    }

    /// Writes a value, returning whether it changed. Undeclared keys are ignored.
    pub(crate) fn set_value(&mut self, key: &str, value: Value) -> bool {
        match self.settings.get_mut(key) {
            Some(state) if state.value != value => {
                state.value = value;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn set_overridden(&mut self, key: &str, overridden: bool) {
        if let Some(state) = self.settings.get_mut(key) {
            state.overridden = overridden;
        }
    }

    pub(crate) fn apply_constraint(&mut self, key: &str, constraint: Constraint) -> FixUp {
        match self.settings.get_mut(key) {
            Some(state) => state.apply_constraint(constraint),
            None => FixUp::default(),
        }
    }

    /// Forgets the constraint of a setting, keeping its value. Returns
    /// whether there was one.
    pub(crate) fn clear_constraint(&mut self, key: &str) -> bool {
        self.settings
            .get_mut(key)
            .and_then(|state| state.constraint.take())
            .is_some()
    }

    pub(crate) fn set_attributes(&mut self, key: &str, attributes: SettingAttributes) -> bool {
        match self.settings.get_mut(key) {
            Some(state) if state.attributes != attributes => {
                state.attributes = attributes;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn set_loading(&mut self, key: &str, loading: bool) {
        if let Some(state) = self.settings.get_mut(key) {
            state.loading = loading;
        }
    }

    pub fn is_loading(&self) -> bool {
        self.settings.values().any(SettingState::is_loading)
    }

    pub fn stored(&self, key: &str) -> Option<&Value> {
        self.stored.get(key)
    }

    /// Writes or clears a stored-data entry, returning whether it changed.
    pub(crate) fn set_stored(&mut self, key: &Key, value: Option<Value>) -> bool {
        match value {
            Some(value) => self.stored.insert(key.clone(), value.clone()).as_ref() != Some(&value),
            None => self.stored.remove(key).is_some(),
        }
    }

    /// A copy of the current setting values.
    pub fn snapshot(&self) -> Settings {
        self.settings
            .iter()
            .map(|(key, state)| (key.clone(), state.value.clone()))
            .collect()
    }

    pub(crate) fn stored_snapshot(&self) -> BTreeMap<Key, Value> {
        self.stored.clone()
    }

    /// Whether every setting with a known constraint holds a legal value.
    pub fn all_values_valid(&self) -> bool {
        self.settings.values().all(SettingState::is_valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::settings;
    use serde_json::json;

    fn store() -> SettingStore {
        SettingStore::new(
            vec!["A".into(), "B".into()],
            &settings([("A", "1"), ("Z", "ignored")]),
        )
    }

    #[test]
    fn test_keys_fixed_and_defaults_applied() {
        let store = store();
        assert_eq!(store.keys(), &[Key::from("A"), Key::from("B")]);
        assert_eq!(store.value("A"), Some(&json!("1")));
        assert_eq!(store.value("B"), Some(&Value::Null));
        assert!(!store.contains("Z"));
    }

    #[test]
    fn test_set_value_reports_change() {
        let mut store = store();
        assert!(store.set_value("A", json!("2")));
        assert!(!store.set_value("A", json!("2")));
        assert!(!store.set_value("Z", json!("2")));
    }

    #[test]
    fn test_clear_constraint_keeps_value() {
        let mut store = store();
        store.apply_constraint("A", Constraint::one_of(["1", "2"]));

        assert!(store.clear_constraint("A"));
        assert!(!store.clear_constraint("A"));
        assert_eq!(store.state("A").and_then(SettingState::constraint), None);
        assert_eq!(store.value("A"), Some(&json!("1")));
    }

    #[test]
    fn test_stored_data() {
        let mut store = store();
        let key = Key::from("realizations");

        assert!(store.set_stored(&key, Some(json!([0, 1]))));
        assert!(!store.set_stored(&key, Some(json!([0, 1]))));
        assert!(store.set_stored(&key, Some(json!([0]))));
        assert!(store.set_stored(&key, None));
        assert!(!store.set_stored(&key, None));
        assert_eq!(store.stored("realizations"), None);
    }

    #[test]
    fn test_validity_follows_constraints() {
        let mut store = store();
        assert!(store.all_values_valid());

        store.apply_constraint("B", Constraint::empty());
        assert!(!store.all_values_valid());

        store.apply_constraint("B", Constraint::one_of(["x"]));
        assert!(store.all_values_valid());
        assert_eq!(store.value("B"), Some(&json!("x")));
    }
}
