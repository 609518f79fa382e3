use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{Key, Settings, Value};
use crate::engine::{Engine, validate_provider};
use crate::error::EngineError;
use crate::provider::{DataProvider, GroupDefinition, ROOT_KIND, RootGroup};

/// Provider and group kinds known to an engine, built once at startup.
pub(crate) struct Registry {
    pub providers: HashMap<Key, Arc<dyn DataProvider>>,
    pub groups: HashMap<Key, Arc<dyn GroupDefinition>>,
}

/// The blueprint for an engine.
///
/// `Blueprint` registers the provider and group kinds the tree may contain
/// and the initial global settings. Once configured, [`Blueprint::finish`]
/// validates every provider kind and produces an [`Engine`].
///
/// # Example
///
/// ```rust,no_run
/// use strata::Blueprint;
///
/// # async fn run() -> Result<(), strata::EngineError> {
/// let engine = Blueprint::new()
///     .global("field", "drogon")
///     .finish()?;
/// # Ok(())
/// # }
/// ```
pub struct Blueprint {
    providers: HashMap<Key, Arc<dyn DataProvider>>,
    groups: HashMap<Key, Arc<dyn GroupDefinition>>,
    globals: Settings,
}

impl Blueprint {
    /// Creates an empty blueprint knowing only the root group kind.
    pub fn new() -> Self {
        let mut groups: HashMap<Key, Arc<dyn GroupDefinition>> = HashMap::new();
        groups.insert(ROOT_KIND.into(), Arc::new(RootGroup));

        Self {
            providers: HashMap::new(),
            groups,
            globals: Settings::new(),
        }
    }

    /// Registers a provider kind. A later registration of the same kind wins.
    pub fn provider(mut self, kind: impl Into<Key>, provider: impl DataProvider) -> Self {
        self.providers.insert(kind.into(), Arc::new(provider));
        self
    }

    /// Registers a group kind. Registering [`ROOT_KIND`] replaces the
    /// built-in root, e.g. to share settings across the whole tree.
    pub fn group(mut self, kind: impl Into<Key>, group: impl GroupDefinition) -> Self {
        self.groups.insert(kind.into(), Arc::new(group));
        self
    }

    /// Resolves a global setting up front.
    pub fn global(mut self, key: impl Into<Key>, value: impl Into<Value>) -> Self {
        self.globals.insert(key.into(), value.into());
        self
    }

    /// Validates the declarations of every provider kind and creates the
    /// engine. Must be called within a tokio runtime.
    pub fn finish(self) -> Result<Engine, EngineError> {
        let registry = Registry {
            providers: self.providers,
            groups: self.groups,
        };

        let mut kinds: Vec<_> = registry.providers.keys().cloned().collect();
        kinds.sort();

        for kind in &kinds {
            validate_provider(&registry, kind)?;
        }

        tracing::info!(
            providers = registry.providers.len(),
            groups = registry.groups.len(),
            "engine ready"
        );

        Engine::new(registry, self.globals)
    }
}

impl Default for Blueprint {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Payload;
    use crate::engine::{Dependencies, FetchContext, Input};
    use crate::error::DependencyError;
    use crate::setting::Constraint;
    use futures::FutureExt;
    use futures::future::BoxFuture;

    struct Cyclic;

    impl DataProvider for Cyclic {
        fn settings(&self) -> Vec<Key> {
            vec!["A".into(), "B".into()]
        }

        fn default_name(&self) -> String {
            "cyclic".into()
        }

        fn define_dependencies(&self, deps: &mut Dependencies) {
            deps.available_values("A", [Input::setting("B")], |_| Constraint::Unconstrained);
            deps.available_values("B", [Input::setting("A")], |_| Constraint::Unconstrained);
        }

        fn fetch_data(&self, _: FetchContext) -> BoxFuture<'static, anyhow::Result<Payload>> {
            async { Err(anyhow::anyhow!("never fetched")) }.boxed()
        }
    }

    #[tokio::test]
    async fn test_finish_rejects_cycles() {
        let result = Blueprint::new().provider("cyclic", Cyclic).finish();

        assert!(matches!(
            result,
            Err(EngineError::Dependency(DependencyError::Cycle { .. }))
        ));
    }

    #[test]
    fn test_finish_requires_runtime() {
        let result = Blueprint::new().finish();
        assert!(matches!(result, Err(EngineError::Runtime(_))));
    }

    #[tokio::test]
    async fn test_globals_seeded() {
        let engine = Blueprint::new().global("field", "drogon").finish().unwrap();
        assert_eq!(engine.global("field"), "drogon");
        assert_eq!(engine.kind(engine.root()).unwrap(), ROOT_KIND);
    }
}
