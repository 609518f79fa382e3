//! Setting values and the constraints that govern them.
//!
//! A setting's legal values are described by a [`Constraint`]. Whenever the
//! constraint of a setting changes, the current value is *fixed up*: if it is
//! no longer legal it is replaced with the first legal value, or with
//! `Value::Null` when nothing is legal. Fix-up is idempotent, so re-applying
//! an unchanged constraint never alters an already valid value.

use serde::{Deserialize, Serialize};

use crate::core::Value;

/// The set of legal values for one setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Constraint {
    /// Any value is accepted.
    Unconstrained,
    /// An enumerated list of legal values, in display order. Empty means no
    /// value is legal.
    OneOf { values: Vec<Value> },
    /// An inclusive numeric range. `min > max` means no value is legal.
    Range { min: f64, max: f64 },
}

impl Constraint {
    /// An enumerated constraint with the given members.
    pub fn one_of<V>(values: impl IntoIterator<Item = V>) -> Self
    where
        V: Into<Value>,
    {
        Constraint::OneOf {
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// The constraint an updater should produce when its inputs are not ready.
    pub fn empty() -> Self {
        Constraint::OneOf { values: vec![] }
    }

    pub fn range(min: f64, max: f64) -> Self {
        Constraint::Range { min, max }
    }

    /// Whether no value at all is legal.
    pub fn is_empty(&self) -> bool {
        match self {
            Constraint::Unconstrained => false,
            Constraint::OneOf { values } => values.is_empty(),
            Constraint::Range { min, max } => min > max,
        }
    }

    /// Whether `value` is a legal value. `Null` is never a member.
    pub fn contains(&self, value: &Value) -> bool {
        match self {
            Constraint::Unconstrained => true,
            Constraint::OneOf { values } => !value.is_null() && values.contains(value),
            Constraint::Range { min, max } => value
                .as_f64()
                .is_some_and(|number| *min <= number && number <= *max),
        }
    }

    /// Returns the value `current` should take under this constraint.
    pub fn fix_up(&self, current: &Value) -> Value {
        if self.contains(current) {
            return current.clone();
        }

        match self {
            Constraint::Unconstrained => current.clone(),
            Constraint::OneOf { values } => values.first().cloned().unwrap_or(Value::Null),
            Constraint::Range { min, max } if min <= max => {
                let clamped = current.as_f64().map_or(*min, |number| number.clamp(*min, *max));
                serde_json::Number::from_f64(clamped).map_or(Value::Null, Value::Number)
            }
            Constraint::Range { .. } => Value::Null,
        }
    }

    /// The constraint admitting exactly the values legal under both.
    ///
    /// Enumerations keep the order of `self`.
    pub fn intersect(&self, other: &Constraint) -> Constraint {
        match (self, other) {
            (Constraint::Unconstrained, c) | (c, Constraint::Unconstrained) => c.clone(),
            (Constraint::OneOf { values }, c) => Constraint::OneOf {
                values: values.iter().filter(|v| c.contains(v)).cloned().collect(),
            },
            (c @ Constraint::Range { .. }, Constraint::OneOf { values }) => Constraint::OneOf {
                values: values.iter().filter(|v| c.contains(v)).cloned().collect(),
            },
            (Constraint::Range { min: a, max: b }, Constraint::Range { min: c, max: d }) => {
                Constraint::Range {
                    min: a.max(*c),
                    max: b.min(*d),
                }
            }
        }
    }
}

/// Presentation flags for a setting, produced by attribute updaters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingAttributes {
    pub enabled: bool,
    pub visible: bool,
}

impl Default for SettingAttributes {
    fn default() -> Self {
        Self {
            enabled: true,
            visible: true,
        }
    }
}

/// The outcome of applying a new constraint to a setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct FixUp {
    pub constraint_changed: bool,
    pub value_changed: bool,
}

/// Everything the engine tracks for one setting.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingState {
    pub(crate) value: Value,
    /// `None` until an available-values updater has run.
    pub(crate) constraint: Option<Constraint>,
    pub(crate) attributes: SettingAttributes,
    /// Waiting on a pending helper dependency.
    pub(crate) loading: bool,
    /// Governed by an ancestor group sharing this setting.
    pub(crate) overridden: bool,
}

impl SettingState {
    pub(crate) fn new(value: Value) -> Self {
        Self {
            value,
            constraint: None,
            attributes: SettingAttributes::default(),
            loading: false,
            overridden: false,
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn constraint(&self) -> Option<&Constraint> {
        self.constraint.as_ref()
    }

    pub fn attributes(&self) -> SettingAttributes {
        self.attributes
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn is_overridden(&self) -> bool {
        self.overridden
    }

    /// Whether the current value satisfies the known constraint. Settings
    /// without a known constraint are considered valid.
    pub fn is_valid(&self) -> bool {
        match &self.constraint {
            Some(constraint) => constraint.contains(&self.value),
            None => true,
        }
    }

    /// Stores a new constraint and fixes the value up against it. Overridden
    /// settings keep their injected value.
    pub(crate) fn apply_constraint(&mut self, constraint: Constraint) -> FixUp {
        let mut outcome = FixUp::default();

        if self.constraint.as_ref() != Some(&constraint) {
            outcome.constraint_changed = true;
        }

        if !self.overridden {
            let fixed = constraint.fix_up(&self.value);
            if fixed != self.value {
                self.value = fixed;
                outcome.value_changed = true;
            }
        }

        self.constraint = Some(constraint);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fix_up_replaces_with_first() {
        let c = Constraint::one_of(["x", "y"]);
        assert_eq!(c.fix_up(&json!("z")), json!("x"));
        assert_eq!(c.fix_up(&Value::Null), json!("x"));
        assert_eq!(c.fix_up(&json!("y")), json!("y"));
    }

    #[test]
    fn test_fix_up_empty_is_null() {
        assert_eq!(Constraint::empty().fix_up(&json!("x")), Value::Null);
        assert_eq!(Constraint::range(2.0, 1.0).fix_up(&json!(1.5)), Value::Null);
    }

    #[test]
    fn test_fix_up_idempotent() {
        let constraints = [
            Constraint::one_of(["a", "b"]),
            Constraint::empty(),
            Constraint::range(0.0, 10.0),
            Constraint::Unconstrained,
        ];
        let values = [json!("a"), json!("q"), Value::Null, json!(42), json!(-3.5)];

        for c in &constraints {
            for v in &values {
                let once = c.fix_up(v);
                assert_eq!(c.fix_up(&once), once, "{c:?} on {v}");
            }
        }
    }

    #[test]
    fn test_range_clamps() {
        let c = Constraint::range(0.0, 10.0);
        assert_eq!(c.fix_up(&json!(12)), json!(10.0));
        assert_eq!(c.fix_up(&json!("text")), json!(0.0));
        assert_eq!(c.fix_up(&json!(5)), json!(5));
    }

    #[test]
    fn test_intersect() {
        let a = Constraint::one_of(["a", "b", "c"]);
        let b = Constraint::one_of(["c", "b"]);
        assert_eq!(a.intersect(&b), Constraint::one_of(["b", "c"]));
        assert_eq!(a.intersect(&Constraint::Unconstrained), a);

        let r = Constraint::range(0.0, 5.0).intersect(&Constraint::range(3.0, 9.0));
        assert_eq!(r, Constraint::range(3.0, 5.0));

        let mixed = Constraint::range(0.0, 5.0).intersect(&Constraint::one_of([1, 7]));
        assert_eq!(mixed, Constraint::one_of([1]));
    }

    #[test]
    fn test_apply_constraint_reports_changes() {
        let mut state = SettingState::new(json!("x"));

        let first = state.apply_constraint(Constraint::one_of(["x", "y"]));
        assert!(first.constraint_changed);
        assert!(!first.value_changed);

        let again = state.apply_constraint(Constraint::one_of(["x", "y"]));
        assert_eq!(again, FixUp::default());

        let narrowed = state.apply_constraint(Constraint::one_of(["z"]));
        assert!(narrowed.value_changed);
        assert_eq!(state.value(), &json!("z"));
    }

    #[test]
    fn test_overridden_keeps_value() {
        let mut state = SettingState::new(json!("shared"));
        state.overridden = true;

        let outcome = state.apply_constraint(Constraint::one_of(["x"]));
        assert!(!outcome.value_changed);
        assert_eq!(state.value(), &json!("shared"));
        assert!(!state.is_valid());
    }
}
