use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Atomic reference-counted string type used for setting and stored-data keys.
pub type Key = Arc<str>;

/// The value of a setting, a constraint member, a stored-data entry or the
/// output of a helper dependency. `Value::Null` is the "empty" value.
pub type Value = serde_json::Value;

/// A snapshot of setting values, keyed by setting key.
pub type Settings = BTreeMap<Key, Value>;

/// A type-erased, thread-safe container for fetched provider data.
pub type Payload = Arc<dyn Any + Send + Sync>;

pub(crate) static NULL: Value = Value::Null;

/// Stable identity of a provider or group in the composition tree.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub(crate) u64);

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Builds a [`Settings`] snapshot from string keys.
///
/// ```rust
/// let settings = strata::settings([("ensemble", "drogon"), ("realization", "0")]);
/// assert_eq!(settings.len(), 2);
/// ```
pub fn settings<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Settings
where
    K: Into<Key>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .collect()
}

/// A 32-byte BLAKE3 hash used as the input signature of helper dependencies.
///
/// Two evaluations that read the same input values produce the same
/// fingerprint, which lets the helper cache answer from memory instead of
/// starting a new computation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    /// Fingerprints a sequence of values. `serde_json` serializes objects
    /// with sorted keys, so equal values always hash equally.
    pub(crate) fn of_values<'a>(values: impl IntoIterator<Item = &'a Value>) -> Self {
        let mut hasher = blake3::Hasher::new();

        for value in values {
            // Writing into a hasher cannot fail, and a `Value` always serializes.
            let _ = serde_json::to_writer(&mut hasher, value);
            hasher.update(&[0x1e]);
        }

        hasher.finalize().into()
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for byte in self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl Debug for Hash32 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", &self.to_hex()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_stable() {
        let a = Hash32::of_values([&json!({"b": 1, "a": 2}), &json!("x")]);
        let b = Hash32::of_values([&json!({"a": 2, "b": 1}), &json!("x")]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_separates_values() {
        // ["ab"] and ["a", "b"] must not collide
        let a = Hash32::of_values([&json!("ab")]);
        let b = Hash32::of_values([&json!("a"), &json!("b")]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_settings_builder() {
        let s = settings([("A", "1"), ("B", "x")]);
        assert_eq!(s.get("A"), Some(&json!("1")));
        assert_eq!(s.get("C"), None);
    }
}
