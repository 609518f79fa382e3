//! Collaborator contracts implemented by concrete provider and group kinds.

use futures::future::BoxFuture;

use crate::core::{Key, Payload, Settings};
use crate::engine::{Dependencies, FetchContext, SettingsAccess};

/// The kind of the built-in root group.
pub const ROOT_KIND: &str = "root";

/// A kind of data provider: a leaf of the composition tree that declares
/// settings, derives stored data and fetches one payload.
///
/// One value implements a kind and is shared by every node of that kind;
/// per-node state lives in the engine. Every method except
/// [`DataProvider::fetch_data`] must be cheap and synchronous.
///
/// ```rust
/// use futures::FutureExt;
/// use futures::future::BoxFuture;
/// use strata::{Constraint, DataProvider, Dependencies, FetchContext, Input, Key, Payload};
/// use std::sync::Arc;
///
/// struct Surface;
///
/// impl DataProvider for Surface {
///     fn settings(&self) -> Vec<Key> {
///         vec!["attribute".into()]
///     }
///
///     fn default_name(&self) -> String {
///         "Surface".into()
///     }
///
///     fn define_dependencies(&self, deps: &mut Dependencies) {
///         deps.available_values("attribute", [Input::global("field")], |args| {
///             match args.global("field").as_str() {
///                 Some(_) => Constraint::one_of(["depth", "time"]),
///                 None => Constraint::empty(),
///             }
///         });
///     }
///
///     fn fetch_data(&self, ctx: FetchContext) -> BoxFuture<'static, anyhow::Result<Payload>> {
///         let attribute = ctx.setting("attribute").clone();
///         async move { Ok(Arc::new(attribute) as Payload) }.boxed()
///     }
/// }
/// ```
pub trait DataProvider: Send + Sync + 'static {
    /// The ordered, fixed list of setting keys.
    fn settings(&self) -> Vec<Key>;

    fn default_name(&self) -> String;

    /// Initial values, possibly partial. Missing keys start as `Null`.
    fn default_settings(&self) -> Settings {
        Settings::new()
    }

    /// Whether moving from the settings of the last fetch to `next` needs a
    /// new fetch. Must return `false` for equal snapshots.
    fn settings_require_refetch(&self, prev: &Settings, next: &Settings) -> bool {
        prev != next
    }

    /// Whether the current settings allow a fetch at all.
    fn are_settings_valid(&self, access: &SettingsAccess<'_>) -> bool {
        access.all_values_valid()
    }

    fn define_dependencies(&self, _deps: &mut Dependencies) {}

    /// Fetches the main payload. The context carries a snapshot of the
    /// settings, stored data and globals, and a cancellation token that fires
    /// as soon as the attempt is superseded.
    fn fetch_data(&self, ctx: FetchContext) -> BoxFuture<'static, anyhow::Result<Payload>>;

    /// The value range of a fetched payload, e.g. for color scales.
    fn value_range(&self, _data: &Payload) -> Option<(f64, f64)> {
        None
    }
}

/// A kind of group: a composite node that may share settings with its
/// descendants.
pub trait GroupDefinition: Send + Sync + 'static {
    fn default_name(&self) -> String;

    /// Keys this group injects into descendant providers declaring them.
    fn shared_settings(&self) -> Vec<Key> {
        Vec::new()
    }

    fn default_settings(&self) -> Settings {
        Settings::new()
    }
}

pub(crate) struct RootGroup;

impl GroupDefinition for RootGroup {
    fn default_name(&self) -> String {
        String::from("Root")
    }
}
