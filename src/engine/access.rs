use crate::core::{NULL, Value};
use crate::engine::graph::{HelperId, Input};
use crate::engine::helper::HelperCache;
use crate::globals::GlobalSettings;
use crate::setting::Constraint;
use crate::store::SettingStore;

/// Read access handed to updaters and helper computations.
///
/// Only the inputs an updater declared are visible. Reading anything else is
/// a declaration bug: it is logged and answered with the empty value, because
/// the evaluator would not re-run the updater when that input changes.
pub struct UpdaterArgs<'a> {
    store: &'a SettingStore,
    globals: &'a GlobalSettings,
    helpers: &'a HelperCache,
    inputs: &'a [Input],
}

impl<'a> UpdaterArgs<'a> {
    pub(crate) fn new(
        store: &'a SettingStore,
        globals: &'a GlobalSettings,
        helpers: &'a HelperCache,
        inputs: &'a [Input],
    ) -> Self {
        Self {
            store,
            globals,
            helpers,
            inputs,
        }
    }

    fn declared(&self, wanted: impl Fn(&Input) -> bool, what: &str) -> bool {
        let declared = self.inputs.iter().any(wanted);
        if !declared {
            tracing::warn!("read of undeclared input {what}");
        }
        declared
    }

    /// The current value of a local setting, `Null` if unset.
    pub fn setting(&self, key: &str) -> &'a Value {
        if !self.declared(|i| matches!(i, Input::Setting(k) if &**k == key), key) {
            return &NULL;
        }
        self.store.value(key).unwrap_or(&NULL)
    }

    /// The current value of a global setting, `Null` while unresolved.
    pub fn global(&self, key: &str) -> &'a Value {
        if !self.declared(|i| matches!(i, Input::Global(k) if &**k == key), key) {
            return &NULL;
        }
        self.globals.get(key)
    }

    /// The cached output of a helper dependency. `None` means the helper
    /// failed and must be treated as "not ready".
    pub fn helper(&self, id: HelperId) -> Option<&'a Value> {
        let name = self.helpers.name(id);
        if !self.declared(|i| *i == Input::Helper(id), name) {
            return None;
        }
        self.helpers.value(id)
    }

    /// A stored-data entry already resolved earlier in this round.
    pub fn stored(&self, key: &str) -> Option<&'a Value> {
        if !self.declared(|i| matches!(i, Input::Stored(k) if &**k == key), key) {
            return None;
        }
        self.store.stored(key)
    }
}

/// Read access handed to `DataProvider::are_settings_valid`.
pub struct SettingsAccess<'a> {
    pub(crate) store: &'a SettingStore,
    pub(crate) globals: &'a GlobalSettings,
}

impl<'a> SettingsAccess<'a> {
    pub fn setting(&self, key: &str) -> &'a Value {
        self.store.value(key).unwrap_or(&NULL)
    }

    pub fn constraint(&self, key: &str) -> Option<&'a Constraint> {
        self.store.state(key).and_then(|state| state.constraint())
    }

    pub fn stored(&self, key: &str) -> Option<&'a Value> {
        self.store.stored(key)
    }

    pub fn global(&self, key: &str) -> &'a Value {
        self.globals.get(key)
    }

    /// Whether every setting with a known constraint holds a legal value.
    /// This is what providers get unless they override the validity check.
    pub fn all_values_valid(&self) -> bool {
        self.store.all_values_valid()
    }
}
