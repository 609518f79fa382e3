use crate::core::{Key, NULL, Settings, Value};

/// Cross-tree settings shared by every provider, e.g. the selected field or
/// the intersection polyline.
///
/// Reads of a key that has not been resolved yet yield `Value::Null`, never a
/// stale value. Every effective write bumps the version.
#[derive(Debug, Clone, Default)]
pub struct GlobalSettings {
    values: Settings,
    version: u64,
}

impl GlobalSettings {
    pub fn new(values: Settings) -> Self {
        Self { values, version: 0 }
    }

    pub fn get(&self, key: &str) -> &Value {
        self.values.get(key).unwrap_or(&NULL)
    }

    pub fn is_resolved(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Writes a value, returning whether anything changed.
    pub(crate) fn set(&mut self, key: Key, value: Value) -> bool {
        if self.values.get(&key) == Some(&value) {
            return false;
        }

        self.values.insert(key, value);
        self.version += 1;
        true
    }

    /// Marks a key as unresolved again, returning whether it was resolved.
    pub(crate) fn clear(&mut self, key: &str) -> bool {
        let removed = self.values.remove(key).is_some();
        if removed {
            self.version += 1;
        }
        removed
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn snapshot(&self) -> Settings {
        self.values.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unresolved_reads_null() {
        let globals = GlobalSettings::default();
        assert_eq!(globals.get("field"), &Value::Null);
        assert!(!globals.is_resolved("field"));
    }

    #[test]
    fn test_version_moves_on_effective_writes() {
        let mut globals = GlobalSettings::default();

        assert!(globals.set("field".into(), json!("drogon")));
        assert_eq!(globals.version(), 1);

        assert!(!globals.set("field".into(), json!("drogon")));
        assert_eq!(globals.version(), 1);

        assert!(globals.clear("field"));
        assert!(!globals.clear("field"));
        assert_eq!(globals.version(), 2);
    }
}
