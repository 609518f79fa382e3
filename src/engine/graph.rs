//! The per-provider dependency graph.
//!
//! Providers declare *updaters* (available values, attributes, stored data)
//! and *helper dependencies* against explicit inputs. The declarations are
//! compiled into a DAG whose vertices are inputs, helpers, updaters and their
//! targets:
//!
//! ```text
//!   Setting(A) ──> Helper(ensembles) ──> Updater(available B) ──> Setting(B)
//!                                                                   │
//!   Global(field) ─────────────────────> Updater(stored xs) ──> Stored(xs)
//! ```
//!
//! An evaluation round walks the vertices in topological order once. A vertex
//! is visited only when one of its direct inputs changed in this round, so no
//! updater runs twice and no updater runs without a reason.

use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter, Write};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use petgraph::Direction;
use petgraph::Graph;
use petgraph::graph::NodeIndex;
use tokio_util::sync::CancellationToken;

use crate::core::{Key, Value};
use crate::engine::access::UpdaterArgs;
use crate::engine::helper::{HelperCache, HelperFn, HelperJob, Refresh, helper_fn};
use crate::error::{DependencyError, panic_message};
use crate::globals::GlobalSettings;
use crate::setting::{Constraint, SettingAttributes};
use crate::store::SettingStore;

/// A handle to a helper dependency declared through [`Dependencies::helper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HelperId(pub(crate) usize);

/// Something an updater reads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Input {
    /// A setting declared by the same provider.
    Setting(Key),
    /// A cross-tree global setting.
    Global(Key),
    /// The cached output of a helper dependency.
    Helper(HelperId),
    /// A stored-data entry produced by another updater of the same provider.
    Stored(Key),
}

impl Input {
    pub fn setting(key: impl Into<Key>) -> Self {
        Input::Setting(key.into())
    }

    pub fn global(key: impl Into<Key>) -> Self {
        Input::Global(key.into())
    }

    pub fn helper(id: HelperId) -> Self {
        Input::Helper(id)
    }

    pub fn stored(key: impl Into<Key>) -> Self {
        Input::Stored(key.into())
    }
}

type UpdaterFn<T> = Arc<dyn Fn(&UpdaterArgs<'_>) -> T + Send + Sync>;

#[derive(Clone, PartialEq, Eq, Hash)]
pub(crate) enum Target {
    AvailableValues(Key),
    Attributes(Key),
    StoredData(Key),
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::AvailableValues(key) => write!(f, "available values of '{key}'"),
            Target::Attributes(key) => write!(f, "attributes of '{key}'"),
            Target::StoredData(key) => write!(f, "stored data '{key}'"),
        }
    }
}

#[derive(Clone)]
enum Update {
    AvailableValues(UpdaterFn<Constraint>),
    Attributes(UpdaterFn<SettingAttributes>),
    StoredData(UpdaterFn<Option<Value>>),
}

#[derive(Clone)]
struct Updater {
    target: Target,
    inputs: Vec<Input>,
    update: Update,
}

enum Output {
    Constraint(Constraint),
    Attributes(SettingAttributes),
    Stored(Option<Value>),
}

/// Collects the dependency declarations of one provider instance.
///
/// Passed to `DataProvider::define_dependencies`. Updaters must be
/// deterministic given their declared inputs and may only read what they
/// declared.
#[derive(Default)]
pub struct Dependencies {
    helpers: Vec<(Key, Vec<Input>, HelperFn)>,
    updaters: Vec<Updater>,
}

impl Dependencies {
    /// Declares an asynchronous helper computation. It may read local and
    /// global settings only; the values it reads form its input signature.
    /// The token is cancelled as soon as the computation is superseded.
    pub fn helper<F>(
        &mut self,
        name: impl Into<Key>,
        inputs: impl IntoIterator<Item = Input>,
        compute: F,
    ) -> HelperId
    where
        F: Fn(&UpdaterArgs<'_>, CancellationToken) -> BoxFuture<'static, anyhow::Result<Value>>
            + Send
            + Sync
            + 'static,
    {
        self.helpers
            .push((name.into(), inputs.into_iter().collect(), helper_fn(compute)));
        HelperId(self.helpers.len() - 1)
    }

    /// Declares the updater producing the legal values of setting `key`.
    pub fn available_values<F>(
        &mut self,
        key: impl Into<Key>,
        inputs: impl IntoIterator<Item = Input>,
        update: F,
    ) where
        F: Fn(&UpdaterArgs<'_>) -> Constraint + Send + Sync + 'static,
    {
        self.updaters.push(Updater {
            target: Target::AvailableValues(key.into()),
            inputs: inputs.into_iter().collect(),
            update: Update::AvailableValues(Arc::new(update)),
        });
    }

    /// Declares the updater producing the attributes of setting `key`.
    pub fn attributes<F>(
        &mut self,
        key: impl Into<Key>,
        inputs: impl IntoIterator<Item = Input>,
        update: F,
    ) where
        F: Fn(&UpdaterArgs<'_>) -> SettingAttributes + Send + Sync + 'static,
    {
        self.updaters.push(Updater {
            target: Target::Attributes(key.into()),
            inputs: inputs.into_iter().collect(),
            update: Update::Attributes(Arc::new(update)),
        });
    }

    /// Declares the updater producing stored-data entry `key`. Returning
    /// `None` clears the entry.
    pub fn stored_data<F>(
        &mut self,
        key: impl Into<Key>,
        inputs: impl IntoIterator<Item = Input>,
        update: F,
    ) where
        F: Fn(&UpdaterArgs<'_>) -> Option<Value> + Send + Sync + 'static,
    {
        self.updaters.push(Updater {
            target: Target::StoredData(key.into()),
            inputs: inputs.into_iter().collect(),
            update: Update::StoredData(Arc::new(update)),
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Vertex {
    Setting(Key),
    Global(Key),
    Helper(HelperId),
    Stored(Key),
    Updater(usize),
}

/// Where an evaluation round starts.
pub(crate) enum Seeds {
    /// Run every updater and refresh every helper, e.g. right after creation.
    All,
    /// Propagate from these changed vertices only.
    Changed(Vec<NodeIndex>),
}

/// What an evaluation round did.
#[derive(Default)]
pub(crate) struct Round {
    pub jobs: Vec<HelperJob>,
    pub invocations: u64,
    pub helper_starts: u64,
    /// Settings whose constraint changed.
    pub constraints_changed: Vec<Key>,
    /// Any setting value changed through fix-up.
    pub values_changed: bool,
    /// Anything observable changed.
    pub changed: bool,
}

pub(crate) struct DependencyGraph {
    graph: Graph<Vertex, ()>,
    order: Vec<NodeIndex>,
    settings: HashMap<Key, NodeIndex>,
    globals: HashMap<Key, NodeIndex>,
    stored: HashMap<Key, NodeIndex>,
    helpers: Vec<NodeIndex>,
    updaters: Vec<Updater>,
}

impl DependencyGraph {
    /// Compiles the declarations of a provider of `kind` declaring `keys`.
    pub(crate) fn build(
        kind: &Key,
        keys: &[Key],
        dependencies: Dependencies,
    ) -> Result<(Self, HelperCache), DependencyError> {
        let mut graph = Graph::new();
        let mut settings = HashMap::new();
        let mut globals: HashMap<Key, NodeIndex> = HashMap::new();
        let mut stored = HashMap::new();

        for key in keys {
            settings.insert(key.clone(), graph.add_node(Vertex::Setting(key.clone())));
        }

        let unknown_setting = |key: &Key| DependencyError::UnknownSetting {
            kind: kind.clone(),
            key: key.clone(),
        };

        // Helpers read settings and globals only.
        let mut cache = HelperCache::default();
        let mut helpers = Vec::with_capacity(dependencies.helpers.len());

        for (name, inputs, compute) in dependencies.helpers {
            let index = graph.add_node(Vertex::Helper(HelperId(helpers.len())));

            for input in &inputs {
                let source = match input {
                    Input::Setting(key) => *settings.get(key).ok_or_else(|| unknown_setting(key))?,
                    Input::Global(key) => *globals
                        .entry(key.clone())
                        .or_insert_with(|| graph.add_node(Vertex::Global(key.clone()))),
                    Input::Helper(_) | Input::Stored(_) => {
                        return Err(DependencyError::HelperInput {
                            kind: kind.clone(),
                            name,
                        });
                    }
                };
                graph.update_edge(source, index, ());
            }

            cache.register(name, inputs, compute);
            helpers.push(index);
        }

        // Targets first, so updaters may read stored data declared later.
        let mut targets = HashSet::new();
        for updater in &dependencies.updaters {
            let duplicate = || DependencyError::DuplicateUpdater {
                kind: kind.clone(),
                target: updater.target.to_string(),
            };

            if !targets.insert(updater.target.clone()) {
                return Err(duplicate());
            }

            match &updater.target {
                Target::AvailableValues(key) | Target::Attributes(key) => {
                    if !settings.contains_key(key) {
                        return Err(unknown_setting(key));
                    }
                }
                Target::StoredData(key) => {
                    stored.insert(key.clone(), graph.add_node(Vertex::Stored(key.clone())));
                }
            }
        }

        for (position, updater) in dependencies.updaters.iter().enumerate() {
            let index = graph.add_node(Vertex::Updater(position));

            for input in &updater.inputs {
                let source = match input {
                    Input::Setting(key) => *settings.get(key).ok_or_else(|| unknown_setting(key))?,
                    Input::Global(key) => *globals
                        .entry(key.clone())
                        .or_insert_with(|| graph.add_node(Vertex::Global(key.clone()))),
                    Input::Helper(id) => *helpers.get(id.0).ok_or_else(|| {
                        DependencyError::UnknownHelper {
                            kind: kind.clone(),
                            target: updater.target.to_string(),
                        }
                    })?,
                    Input::Stored(key) => *stored.get(key).ok_or_else(|| {
                        DependencyError::UnknownStoredData {
                            kind: kind.clone(),
                            key: key.clone(),
                        }
                    })?,
                };
                graph.update_edge(source, index, ());
            }

            match &updater.target {
                Target::AvailableValues(key) => {
                    graph.add_edge(index, settings[key], ());
                }
                Target::StoredData(key) => {
                    graph.add_edge(index, stored[key], ());
                }
                Target::Attributes(_) => {}
            }
        }

        let order = petgraph::algo::toposort(&graph, None).map_err(|cycle| {
            DependencyError::Cycle {
                kind: kind.clone(),
                vertex: describe(&graph[cycle.node_id()], &dependencies.updaters, &cache),
            }
        })?;

        let graph = Self {
            graph,
            order,
            settings,
            globals,
            stored,
            helpers,
            updaters: dependencies.updaters,
        };

        Ok((graph, cache))
    }

    pub(crate) fn setting_vertex(&self, key: &str) -> Option<NodeIndex> {
        self.settings.get(key).copied()
    }

    pub(crate) fn global_vertex(&self, key: &str) -> Option<NodeIndex> {
        self.globals.get(key).copied()
    }

    pub(crate) fn helper_vertex(&self, id: HelperId) -> Option<NodeIndex> {
        self.helpers.get(id.0).copied()
    }

    /// Runs one evaluation round.
    pub(crate) fn evaluate(
        &self,
        seeds: Seeds,
        store: &mut SettingStore,
        globals: &GlobalSettings,
        helpers: &mut HelperCache,
    ) -> Round {
        let mut round = Round::default();

        let (force, mut changed): (bool, HashSet<NodeIndex>) = match seeds {
            Seeds::All => (true, HashSet::new()),
            Seeds::Changed(vertices) => (false, vertices.into_iter().collect()),
        };

        if !force && changed.is_empty() {
            return round;
        }

        for &index in &self.order {
            let triggered = force
                || changed.contains(&index)
                || self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .any(|dependency| changed.contains(&dependency));

            if !triggered {
                continue;
            }

            match &self.graph[index] {
                Vertex::Setting(_) | Vertex::Global(_) | Vertex::Stored(_) => {}
                Vertex::Helper(id) => match helpers.refresh(*id, store, globals) {
                    Refresh::Unchanged => {}
                    Refresh::Started(job) => {
                        round.helper_starts += 1;
                        round.jobs.push(job);
                        changed.insert(index);
                    }
                    Refresh::Restored | Refresh::Failed => {
                        changed.insert(index);
                    }
                },
                Vertex::Updater(position) => {
                    self.run_updater(*position, index, store, globals, helpers, &mut changed, &mut round);
                }
            }
        }

        round
    }

    fn run_updater(
        &self,
        position: usize,
        index: NodeIndex,
        store: &mut SettingStore,
        globals: &GlobalSettings,
        helpers: &HelperCache,
        changed: &mut HashSet<NodeIndex>,
        round: &mut Round,
    ) {
        let updater = &self.updaters[position];

        let waiting = updater
            .inputs
            .iter()
            .any(|input| matches!(input, Input::Helper(id) if helpers.is_pending(*id)));

        if waiting {
            tracing::debug!(updater = %updater.target, "waiting on helper dependency");
            if let Target::AvailableValues(key) = &updater.target {
                store.set_loading(key, true);
            }
            return;
        }

        round.invocations += 1;

        let output = {
            let args = UpdaterArgs::new(store, globals, helpers, &updater.inputs);
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| match &updater.update {
                Update::AvailableValues(f) => Output::Constraint(f(&args)),
                Update::Attributes(f) => Output::Attributes(f(&args)),
                Update::StoredData(f) => Output::Stored(f(&args)),
            }));

            result.unwrap_or_else(|panic| {
                tracing::error!(
                    updater = %updater.target,
                    "updater panicked: {}",
                    panic_message(panic)
                );
                match &updater.update {
                    Update::AvailableValues(_) => Output::Constraint(Constraint::empty()),
                    Update::Attributes(_) => Output::Attributes(SettingAttributes::default()),
                    Update::StoredData(_) => Output::Stored(None),
                }
            })
        };

        match (&updater.target, output) {
            (Target::AvailableValues(key), Output::Constraint(constraint)) => {
                if store.state(key).is_some_and(|state| state.is_loading()) {
                    store.set_loading(key, false);
                    round.changed = true;
                }

                let fix = store.apply_constraint(key, constraint);

                if fix.constraint_changed {
                    changed.insert(index);
                    round.constraints_changed.push(key.clone());
                    round.changed = true;
                }

                if fix.value_changed {
                    tracing::debug!(setting = %key, "value fixed up to new constraint");
                    changed.insert(self.settings[key]);
                    round.values_changed = true;
                    round.changed = true;
                }
            }
            (Target::Attributes(key), Output::Attributes(attributes)) => {
                if store.set_attributes(key, attributes) {
                    changed.insert(index);
                    round.changed = true;
                }
            }
            (Target::StoredData(key), Output::Stored(value)) => {
                if store.set_stored(key, value) {
                    changed.insert(index);
                    changed.insert(self.stored[key]);
                    round.changed = true;
                }
            }
            _ => unreachable!("updater output does not match its target"),
        }
    }

    /// Renders the graph as a Mermaid diagram.
    pub(crate) fn render_mermaid(&self, helpers: &HelperCache) -> String {
        let mut f = String::new();
        // Writing into a String cannot fail.
        let _ = writeln!(f, "graph LR");

        for index in self.graph.node_indices() {
            let label = describe(&self.graph[index], &self.updaters, helpers).replace('"', "#quot;");
            let _ = writeln!(f, "    {}[\"{}\"]", index.index(), label);
        }

        for edge in self.graph.raw_edges() {
            let _ = writeln!(f, "    {} --> {}", edge.source().index(), edge.target().index());
        }

        f
    }
}

fn describe(vertex: &Vertex, updaters: &[Updater], helpers: &HelperCache) -> String {
    match vertex {
        Vertex::Setting(key) => format!("setting '{key}'"),
        Vertex::Global(key) => format!("global '{key}'"),
        Vertex::Helper(id) => format!("helper '{}'", helpers.name(*id)),
        Vertex::Stored(key) => format!("stored '{key}'"),
        Vertex::Updater(position) => format!("updater for {}", updaters[*position].target),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::settings;
    use futures::FutureExt;
    use serde_json::json;

    fn kind() -> Key {
        Key::from("test")
    }

    fn keys(names: &[&str]) -> Vec<Key> {
        names.iter().map(|name| Key::from(*name)).collect()
    }

    /// B's legal values depend on A.
    fn dependent_b(deps: &mut Dependencies) {
        deps.available_values("B", [Input::setting("A")], |args| {
            match args.setting("A").as_str() {
                Some("1") => Constraint::one_of(["x", "y"]),
                Some("2") => Constraint::one_of(["z"]),
                _ => Constraint::empty(),
            }
        });
    }

    fn setup(
        define: impl FnOnce(&mut Dependencies),
        names: &[&str],
        values: &[(&str, &str)],
    ) -> (DependencyGraph, HelperCache, SettingStore) {
        let mut deps = Dependencies::default();
        define(&mut deps);
        let keys = keys(names);
        let (graph, cache) = DependencyGraph::build(&kind(), &keys, deps).unwrap();
        let store = SettingStore::new(keys, &settings(values.iter().copied()));
        (graph, cache, store)
    }

    #[test]
    fn test_dependent_constraint_narrowing() {
        let (graph, mut cache, mut store) =
            setup(dependent_b, &["A", "B"], &[("A", "1"), ("B", "x")]);
        let globals = GlobalSettings::default();

        graph.evaluate(Seeds::All, &mut store, &globals, &mut cache);
        assert_eq!(store.value("B"), Some(&json!("x")));

        store.set_value("A", json!("2"));
        let seed = graph.setting_vertex("A").unwrap();
        let round = graph.evaluate(Seeds::Changed(vec![seed]), &mut store, &globals, &mut cache);

        assert_eq!(round.invocations, 1);
        assert!(round.values_changed);
        assert_eq!(round.constraints_changed, vec![Key::from("B")]);
        assert_eq!(store.value("B"), Some(&json!("z")));
    }

    #[test]
    fn test_no_redundant_recomputation() {
        let (graph, mut cache, mut store) = setup(
            |deps| {
                dependent_b(deps);
                deps.stored_data("unrelated", [Input::setting("C")], |args| {
                    Some(args.setting("C").clone())
                });
            },
            &["A", "B", "C"],
            &[("A", "1"), ("C", "c")],
        );
        let globals = GlobalSettings::default();

        let first = graph.evaluate(Seeds::All, &mut store, &globals, &mut cache);
        assert_eq!(first.invocations, 2);

        let again = graph.evaluate(Seeds::Changed(vec![]), &mut store, &globals, &mut cache);
        assert_eq!(again.invocations, 0);
        assert!(!again.changed);

        // Only the updater reading A runs.
        store.set_value("A", json!("2"));
        let seed = graph.setting_vertex("A").unwrap();
        let round = graph.evaluate(Seeds::Changed(vec![seed]), &mut store, &globals, &mut cache);
        assert_eq!(round.invocations, 1);
    }

    #[test]
    fn test_unchanged_constraint_stops_propagation() {
        let (graph, mut cache, mut store) = setup(
            |deps| {
                deps.available_values("B", [Input::setting("A")], |_| Constraint::one_of(["x"]));
                deps.stored_data("from_b", [Input::setting("B")], |args| {
                    Some(args.setting("B").clone())
                });
            },
            &["A", "B"],
            &[("A", "1")],
        );
        let globals = GlobalSettings::default();
        graph.evaluate(Seeds::All, &mut store, &globals, &mut cache);

        store.set_value("A", json!("2"));
        let seed = graph.setting_vertex("A").unwrap();
        let round = graph.evaluate(Seeds::Changed(vec![seed]), &mut store, &globals, &mut cache);

        // B's updater reruns, but B did not change, so the stored updater does not.
        assert_eq!(round.invocations, 1);
        assert_eq!(store.stored("from_b"), Some(&json!("x")));
    }

    #[test]
    fn test_attributes_follow_their_input() {
        let (graph, mut cache, mut store) = setup(
            |deps| {
                deps.attributes("B", [Input::setting("mode")], |args| SettingAttributes {
                    enabled: args.setting("mode") == "manual",
                    ..SettingAttributes::default()
                });
                deps.stored_data("unrelated", [Input::setting("C")], |args| {
                    Some(args.setting("C").clone())
                });
            },
            &["mode", "B", "C"],
            &[("mode", "auto")],
        );
        let globals = GlobalSettings::default();
        let enabled = |store: &SettingStore| store.state("B").unwrap().attributes().enabled;

        graph.evaluate(Seeds::All, &mut store, &globals, &mut cache);
        assert!(!enabled(&store));

        store.set_value("mode", json!("manual"));
        let seed = graph.setting_vertex("mode").unwrap();
        let round = graph.evaluate(Seeds::Changed(vec![seed]), &mut store, &globals, &mut cache);
        assert_eq!(round.invocations, 1);
        assert!(round.changed);
        assert!(enabled(&store));

        // Another input moving leaves the attribute updater alone.
        store.set_value("C", json!("c"));
        let seed = graph.setting_vertex("C").unwrap();
        let round = graph.evaluate(Seeds::Changed(vec![seed]), &mut store, &globals, &mut cache);
        assert_eq!(round.invocations, 1);
        assert!(enabled(&store));
    }

    #[test]
    fn test_stored_data_chain() {
        let (graph, mut cache, mut store) = setup(
            |deps| {
                deps.stored_data("doubled", [Input::stored("base")], |args| {
                    args.stored("base").and_then(Value::as_i64).map(|v| json!(v * 2))
                });
                deps.stored_data("base", [Input::global("count")], |args| {
                    args.global("count").as_i64().map(|v| json!(v))
                });
            },
            &[],
            &[],
        );
        let mut globals = GlobalSettings::default();

        graph.evaluate(Seeds::All, &mut store, &globals, &mut cache);
        assert_eq!(store.stored("doubled"), None);

        globals.set("count".into(), json!(21));
        let seed = graph.global_vertex("count").unwrap();
        graph.evaluate(Seeds::Changed(vec![seed]), &mut store, &globals, &mut cache);
        assert_eq!(store.stored("doubled"), Some(&json!(42)));
    }

    #[test]
    fn test_pending_helper_defers_updaters() {
        let (graph, mut cache, mut store) = setup(
            |deps| {
                let ensembles = deps.helper("ensembles", [Input::setting("case")], |args, _| {
                    let case = args.setting("case").clone();
                    async move { Ok(json!([case])) }.boxed()
                });
                deps.available_values("ensemble", [Input::helper(ensembles)], move |args| {
                    match args.helper(ensembles).and_then(Value::as_array) {
                        Some(values) => Constraint::one_of(values.clone()),
                        None => Constraint::empty(),
                    }
                });
            },
            &["case", "ensemble"],
            &[("case", "drogon"), ("ensemble", "persisted")],
        );
        let globals = GlobalSettings::default();

        let mut round = graph.evaluate(Seeds::All, &mut store, &globals, &mut cache);
        assert_eq!(round.invocations, 0);
        assert_eq!(round.jobs.len(), 1);
        assert!(store.state("ensemble").unwrap().is_loading());
        // No fix-up while waiting.
        assert_eq!(store.value("ensemble"), Some(&json!("persisted")));

        let job = round.jobs.pop().unwrap();
        assert!(cache.resolve(job.helper, job.generation, Some(Ok(json!(["drogon"])))));

        let seed = graph.helper_vertex(job.helper).unwrap();
        let round = graph.evaluate(Seeds::Changed(vec![seed]), &mut store, &globals, &mut cache);
        assert_eq!(round.invocations, 1);
        assert!(round.jobs.is_empty());
        assert!(!store.state("ensemble").unwrap().is_loading());
        assert_eq!(store.value("ensemble"), Some(&json!("drogon")));
    }

    #[test]
    fn test_failed_helper_cascades_to_empty() {
        let (graph, mut cache, mut store) = setup(
            |deps| {
                let meta = deps.helper("meta", [], |_, _| {
                    async { Err(anyhow::anyhow!("offline")) }.boxed()
                });
                deps.available_values("B", [Input::helper(meta)], move |args| {
                    match args.helper(meta) {
                        Some(_) => Constraint::one_of(["x"]),
                        None => Constraint::empty(),
                    }
                });
            },
            &["B"],
            &[("B", "x")],
        );
        let globals = GlobalSettings::default();

        let mut round = graph.evaluate(Seeds::All, &mut store, &globals, &mut cache);
        let job = round.jobs.pop().unwrap();
        cache.resolve(job.helper, job.generation, Some(Err(anyhow::anyhow!("offline"))));

        let seed = graph.helper_vertex(job.helper).unwrap();
        graph.evaluate(Seeds::Changed(vec![seed]), &mut store, &globals, &mut cache);
        assert_eq!(store.value("B"), Some(&Value::Null));
        assert!(!store.all_values_valid());
    }

    #[test]
    fn test_shared_helper_computed_once() {
        let (graph, mut cache, mut store) = setup(
            |deps| {
                let meta = deps.helper("meta", [Input::setting("A")], |_, _| {
                    async { Ok(json!(["x"])) }.boxed()
                });
                for key in ["B", "C"] {
                    deps.available_values(key, [Input::helper(meta)], move |args| {
                        match args.helper(meta).and_then(Value::as_array) {
                            Some(values) => Constraint::one_of(values.clone()),
                            None => Constraint::empty(),
                        }
                    });
                }
            },
            &["A", "B", "C"],
            &[("A", "1")],
        );
        let globals = GlobalSettings::default();

        let mut round = graph.evaluate(Seeds::All, &mut store, &globals, &mut cache);
        assert_eq!(round.helper_starts, 1);

        let job = round.jobs.pop().unwrap();
        cache.resolve(job.helper, job.generation, Some(Ok(json!(["x"]))));
        let seed = graph.helper_vertex(job.helper).unwrap();
        let round = graph.evaluate(Seeds::Changed(vec![seed]), &mut store, &globals, &mut cache);

        assert_eq!(round.invocations, 2);
        assert_eq!(round.helper_starts, 0);
        assert_eq!(store.value("B"), Some(&json!("x")));
        assert_eq!(store.value("C"), Some(&json!("x")));
    }

    #[test]
    fn test_cycle_rejected() {
        let mut deps = Dependencies::default();
        deps.available_values("A", [Input::setting("B")], |_| Constraint::Unconstrained);
        deps.available_values("B", [Input::setting("A")], |_| Constraint::Unconstrained);

        let err = DependencyGraph::build(&kind(), &keys(&["A", "B"]), deps).err().unwrap();
        assert!(matches!(err, DependencyError::Cycle { .. }));
    }

    #[test]
    fn test_declaration_errors() {
        let mut deps = Dependencies::default();
        deps.available_values("missing", [], |_| Constraint::Unconstrained);
        let err = DependencyGraph::build(&kind(), &keys(&["A"]), deps).err().unwrap();
        assert!(matches!(err, DependencyError::UnknownSetting { .. }));

        let mut deps = Dependencies::default();
        deps.stored_data("x", [Input::stored("nobody")], |_| None);
        let err = DependencyGraph::build(&kind(), &[], deps).err().unwrap();
        assert!(matches!(err, DependencyError::UnknownStoredData { .. }));

        let mut deps = Dependencies::default();
        deps.attributes("A", [], |_| SettingAttributes::default());
        deps.attributes("A", [], |_| SettingAttributes::default());
        let err = DependencyGraph::build(&kind(), &keys(&["A"]), deps).err().unwrap();
        assert!(matches!(err, DependencyError::DuplicateUpdater { .. }));

        let mut deps = Dependencies::default();
        deps.stored_data("x", [], |_| None);
        deps.helper("h", [Input::stored("x")], |_, _| async { Ok(Value::Null) }.boxed());
        let err = DependencyGraph::build(&kind(), &[], deps).err().unwrap();
        assert!(matches!(err, DependencyError::HelperInput { .. }));
    }

    #[test]
    fn test_panicking_updater_yields_empty() {
        let (graph, mut cache, mut store) = setup(
            |deps| {
                deps.available_values("B", [], |_| panic!("broken updater"));
            },
            &["B"],
            &[("B", "x")],
        );

        graph.evaluate(Seeds::All, &mut store, &GlobalSettings::default(), &mut cache);
        assert_eq!(store.value("B"), Some(&Value::Null));
    }

    #[test]
    fn test_render_mermaid() {
        let (graph, cache, _) = setup(dependent_b, &["A", "B"], &[]);
        let mermaid = graph.render_mermaid(&cache);

        assert!(mermaid.starts_with("graph LR"));
        assert!(mermaid.contains("setting 'A'"));
        assert!(mermaid.contains("updater for available values of 'B'"));
    }
}
