mod access;
mod diagnostics;
mod fetch;
mod graph;
mod helper;
mod tree;

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::blueprint::Registry;
use crate::core::{Key, NodeId, Payload, Settings, Value};
use crate::error::{EngineError, FetchError, panic_message};
use crate::globals::GlobalSettings;
use crate::setting::{Constraint, SettingState};
use crate::store::SettingStore;

pub use access::{SettingsAccess, UpdaterArgs};
pub use diagnostics::Diagnostics;
pub use fetch::{FetchContext, FetchStatus};
pub use graph::{Dependencies, HelperId, Input};

pub(crate) use tree::{Node, NodeKind, Tree};

use fetch::{FetchJob, FetchState};
use graph::{DependencyGraph, Seeds};
use helper::HelperJob;
use tree::{GroupNode, ProviderNode};

/// The outcome of a spawned job, sent back to the engine exactly once.
enum Completion {
    Helper {
        node: NodeId,
        helper: HelperId,
        generation: u64,
        result: Option<anyhow::Result<Value>>,
    },
    Fetch {
        node: NodeId,
        generation: u64,
        result: Option<anyhow::Result<Payload>>,
    },
}

enum Work {
    /// Run an evaluation round for a provider.
    Round(NodeId, Seeds),
    /// Recompute the constraint of a shared group setting.
    Shared(NodeId, Key),
}

/// The engine: a tree of groups and data providers, the global settings, and
/// the driver that keeps settings, stored data and fetched data consistent.
///
/// All mutation happens through `&mut self`. Asynchronous work (helper
/// dependencies and fetches) runs on the tokio runtime the engine was built
/// in, and its results are applied only when the caller drives the engine
/// with [`Engine::process_pending`], [`Engine::next_event`] or
/// [`Engine::settle`].
pub struct Engine {
    pub(crate) registry: Registry,
    pub(crate) tree: Tree,
    pub(crate) globals: GlobalSettings,
    runtime: Handle,
    sender: UnboundedSender<Completion>,
    receiver: UnboundedReceiver<Completion>,
    in_flight: usize,
    instance: u64,
    revision: u64,
    diagnostics: Diagnostics,
}

static INSTANCES: AtomicU64 = AtomicU64::new(0);

impl Engine {
    pub(crate) fn new(registry: Registry, globals: Settings) -> Result<Self, EngineError> {
        let runtime = Handle::try_current()?;
        let (sender, receiver) = unbounded_channel();
        let root = make_group(&registry, &Key::from(crate::provider::ROOT_KIND))?;

        Ok(Self {
            registry,
            tree: Tree::new(root),
            globals: GlobalSettings::new(globals),
            runtime,
            sender,
            receiver,
            in_flight: 0,
            instance: INSTANCES.fetch_add(1, Ordering::Relaxed),
            revision: 0,
            diagnostics: Diagnostics::default(),
        })
    }

    // TREE

    pub fn root(&self) -> NodeId {
        self.tree.root()
    }

    /// Adds a data provider of `kind` as the last child of group `parent`.
    pub fn add_provider(&mut self, parent: NodeId, kind: &str) -> Result<NodeId, EngineError> {
        self.create_provider(parent, kind, None, &Settings::new())
    }

    /// Adds a group of `kind` as the last child of group `parent`.
    pub fn add_group(&mut self, parent: NodeId, kind: &str) -> Result<NodeId, EngineError> {
        self.create_group(parent, kind, None, &Settings::new())
    }

    pub(crate) fn create_provider(
        &mut self,
        parent: NodeId,
        kind: &str,
        name: Option<String>,
        initial: &Settings,
    ) -> Result<NodeId, EngineError> {
        self.require_group(parent)?;

        let kind = Key::from(kind);
        let mut node = make_provider(&self.registry, &kind, initial)?;
        if let Some(name) = name {
            node.name = name;
        }

        let id = self.tree.insert(parent, None, NodeKind::Provider(Box::new(node)));
        tracing::info!(node = %id, kind = %kind, "added data provider");

        // Group values go in before the first round.
        self.apply_overrides(id);
        self.propagate(vec![Work::Round(id, Seeds::All)]);
        self.touch();

        Ok(id)
    }

    pub(crate) fn create_group(
        &mut self,
        parent: NodeId,
        kind: &str,
        name: Option<String>,
        initial: &Settings,
    ) -> Result<NodeId, EngineError> {
        self.require_group(parent)?;

        let kind = Key::from(kind);
        let mut group = make_group(&self.registry, &kind)?;
        if let Some(name) = name {
            group.name = name;
        }
        for (key, value) in initial {
            group.store.set_value(key, value.clone());
        }

        let id = self.tree.insert(parent, None, NodeKind::Group(group));
        tracing::info!(node = %id, kind = %kind, "added group");
        self.touch();

        Ok(id)
    }

    /// Removes a node and its subtree, cancelling all work they own.
    pub fn remove(&mut self, id: NodeId) -> Result<(), EngineError> {
        if id == self.tree.root() {
            return Err(EngineError::RootNode);
        }
        self.node(id)?;

        let ancestors = self.tree.ancestors(id);

        for node in self.tree.remove(id) {
            if let NodeKind::Provider(mut provider) = node.kind {
                provider.cancel();
            }
        }

        tracing::info!(node = %id, "removed node");
        let work = self.shared_work(&ancestors);
        self.propagate(work);
        self.touch();

        Ok(())
    }

    /// Moves a node under group `parent` at `position`, or last when `None`.
    pub fn move_node(
        &mut self,
        id: NodeId,
        parent: NodeId,
        position: Option<usize>,
    ) -> Result<(), EngineError> {
        if id == self.tree.root() {
            return Err(EngineError::RootNode);
        }
        self.node(id)?;
        self.require_group(parent)?;

        let subtree = self.tree.subtree(id);
        if subtree.contains(&parent) {
            return Err(EngineError::InvalidMove(id));
        }

        let mut groups = self.tree.ancestors(id);
        self.tree.relocate(id, parent, position);
        groups.extend(self.tree.ancestors(id));
        groups.sort();
        groups.dedup();

        let mut work = Vec::new();
        for node in subtree {
            let changed = self.apply_overrides(node);
            if !changed.is_empty() {
                work.push(Work::Round(node, Seeds::Changed(changed)));
            }
        }
        work.extend(self.shared_work(&groups));

        self.propagate(work);
        self.touch();

        Ok(())
    }

    pub fn set_name(&mut self, id: NodeId, name: impl Into<String>) -> Result<(), EngineError> {
        let node = self.tree.get_mut(id).ok_or(EngineError::NodeNotFound(id))?;
        match &mut node.kind {
            NodeKind::Provider(provider) => provider.name = name.into(),
            NodeKind::Group(group) => group.name = name.into(),
        }
        self.touch();
        Ok(())
    }

    // SETTINGS

    /// Writes a setting of a provider, or a shared setting of a group.
    ///
    /// Values outside a known constraint are rejected, as are writes to a
    /// provider setting governed by a group.
    pub fn set_setting(
        &mut self,
        id: NodeId,
        key: &str,
        value: impl Into<Value>,
    ) -> Result<(), EngineError> {
        let value = value.into();
        let governor = self.tree.governor(id, key);
        let node = self.tree.get_mut(id).ok_or(EngineError::NodeNotFound(id))?;

        let unknown = || EngineError::UnknownSetting {
            node: id,
            key: key.into(),
        };

        match &mut node.kind {
            NodeKind::Provider(provider) => {
                let state = provider.store.state(key).ok_or_else(unknown)?;

                if state.is_overridden()
                    && let Some(group) = governor
                {
                    return Err(EngineError::SettingOverridden {
                        node: id,
                        key: key.into(),
                        group,
                    });
                }

                check_allowed(state, key, &value)?;

                if !provider.store.set_value(key, value) {
                    return Ok(());
                }

                tracing::debug!(node = %id, setting = key, "setting changed");
                let seeds = provider.graph.setting_vertex(key).into_iter().collect();
                self.propagate(vec![Work::Round(id, Seeds::Changed(seeds))]);
            }
            NodeKind::Group(group) => {
                let state = group.store.state(key).ok_or_else(unknown)?;
                check_allowed(state, key, &value)?;

                if !group.store.set_value(key, value.clone()) {
                    return Ok(());
                }

                tracing::debug!(node = %id, setting = key, "shared setting changed");
                let work = self.inject(id, key, &value);
                self.propagate(work);
            }
        }

        self.touch();
        Ok(())
    }

    /// Resolves a global setting and re-evaluates every provider reading it.
    pub fn set_global(&mut self, key: &str, value: impl Into<Value>) {
        if self.globals.set(key.into(), value.into()) {
            tracing::debug!(global = key, "global setting changed");
            self.global_changed(key);
        }
    }

    /// Marks a global setting as unresolved again. Readers observe `Null`.
    pub fn clear_global(&mut self, key: &str) {
        if self.globals.clear(key) {
            tracing::debug!(global = key, "global setting cleared");
            self.global_changed(key);
        }
    }

    fn global_changed(&mut self, key: &str) {
        let work = self
            .tree
            .providers()
            .filter_map(|(id, provider)| {
                let vertex = provider.graph.global_vertex(key)?;
                Some(Work::Round(id, Seeds::Changed(vec![vertex])))
            })
            .collect();

        self.propagate(work);
        self.touch();
    }

    // READ ACCESS

    pub fn children(&self, id: NodeId) -> Result<&[NodeId], EngineError> {
        self.group(id).map(|group| group.children.as_slice())
    }

    pub fn parent(&self, id: NodeId) -> Result<Option<NodeId>, EngineError> {
        self.node(id).map(|node| node.parent)
    }

    pub fn kind(&self, id: NodeId) -> Result<&str, EngineError> {
        self.node(id).map(|node| &**node.kind_name())
    }

    pub fn name(&self, id: NodeId) -> Result<&str, EngineError> {
        self.node(id).map(Node::name)
    }

    pub fn is_group(&self, id: NodeId) -> Result<bool, EngineError> {
        self.node(id).map(|node| node.as_group().is_some())
    }

    /// The setting keys of a provider, or the shared keys of a group.
    pub fn setting_keys(&self, id: NodeId) -> Result<&[Key], EngineError> {
        self.node(id).map(|node| node.store().keys())
    }

    pub fn setting(&self, id: NodeId, key: &str) -> Result<&Value, EngineError> {
        self.setting_state(id, key).map(SettingState::value)
    }

    /// Value, constraint, attributes and flags of one setting.
    pub fn setting_state(&self, id: NodeId, key: &str) -> Result<&SettingState, EngineError> {
        self.node(id)?
            .store()
            .state(key)
            .ok_or_else(|| EngineError::UnknownSetting {
                node: id,
                key: key.into(),
            })
    }

    pub fn constraint(&self, id: NodeId, key: &str) -> Result<Option<&Constraint>, EngineError> {
        self.setting_state(id, key).map(SettingState::constraint)
    }

    pub fn stored(&self, id: NodeId, key: &str) -> Result<Option<&Value>, EngineError> {
        self.provider(id).map(|provider| provider.store.stored(key))
    }

    pub fn status(&self, id: NodeId) -> Result<FetchStatus, EngineError> {
        self.provider(id).map(|provider| provider.fetch.status())
    }

    /// The message of the last failed fetch while the status is `ERROR`.
    pub fn error(&self, id: NodeId) -> Result<Option<&str>, EngineError> {
        self.provider(id).map(|provider| provider.fetch.error())
    }

    /// Whether the provider waits on helper dependencies before fetching.
    pub fn is_suspended(&self, id: NodeId) -> Result<bool, EngineError> {
        self.provider(id).map(|provider| provider.fetch.is_suspended())
    }

    /// The last fetched payload, downcast to `T`.
    pub fn data<T>(&self, id: NodeId) -> Result<Option<Arc<T>>, EngineError>
    where
        T: Send + Sync + 'static,
    {
        let provider = self.provider(id)?;
        Ok(provider
            .fetch
            .data()
            .and_then(|payload| payload.clone().downcast::<T>().ok()))
    }

    /// Keys of the queries registered by the in-flight fetch.
    pub fn active_queries(&self, id: NodeId) -> Result<Vec<Key>, EngineError> {
        self.provider(id).map(|provider| provider.fetch.active_queries())
    }

    pub fn globals(&self) -> &GlobalSettings {
        &self.globals
    }

    pub fn global(&self, key: &str) -> &Value {
        self.globals.get(key)
    }

    /// Moves whenever anything observable changed.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Distinguishes engines living in the same process.
    pub(crate) fn instance(&self) -> u64 {
        self.instance
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics
    }

    /// Number of spawned jobs whose completion has not been applied yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Renders a provider's dependency graph as a Mermaid diagram.
    pub fn render_dependencies(&self, id: NodeId) -> Result<String, EngineError> {
        self.provider(id)
            .map(|provider| provider.graph.render_mermaid(&provider.helpers))
    }

    fn node(&self, id: NodeId) -> Result<&Node, EngineError> {
        self.tree.get(id).ok_or(EngineError::NodeNotFound(id))
    }

    fn provider(&self, id: NodeId) -> Result<&ProviderNode, EngineError> {
        self.node(id)?.as_provider().ok_or(EngineError::NotAProvider(id))
    }

    fn group(&self, id: NodeId) -> Result<&GroupNode, EngineError> {
        self.node(id)?.as_group().ok_or(EngineError::NotAGroup(id))
    }

    fn require_group(&self, id: NodeId) -> Result<(), EngineError> {
        self.group(id).map(|_| ())
    }

    // DRIVER

    /// Applies every completion that already arrived, without waiting.
    /// Returns how many were applied.
    pub fn process_pending(&mut self) -> usize {
        let mut count = 0;
        while let Ok(completion) = self.receiver.try_recv() {
            self.apply(completion);
            count += 1;
        }
        count
    }

    /// Waits for the next completion and applies it. Returns `false` when
    /// nothing is in flight.
    pub async fn next_event(&mut self) -> bool {
        if self.in_flight == 0 {
            return false;
        }

        match self.receiver.recv().await {
            Some(completion) => {
                self.apply(completion);
                true
            }
            None => false,
        }
    }

    /// Drives the engine until no job is in flight. A fetch that never
    /// resolves keeps this waiting.
    pub async fn settle(&mut self) {
        while self.next_event().await {}
    }

    fn apply(&mut self, completion: Completion) {
        self.in_flight = self.in_flight.saturating_sub(1);

        match completion {
            Completion::Helper {
                node,
                helper,
                generation,
                result,
            } => {
                let Some(provider) = self.tree.provider_mut(node) else {
                    self.diagnostics.stale_completions += 1;
                    return;
                };

                if !provider.helpers.resolve(helper, generation, result) {
                    self.diagnostics.stale_completions += 1;
                    return;
                }

                let seeds = provider.graph.helper_vertex(helper).into_iter().collect();
                self.propagate(vec![Work::Round(node, Seeds::Changed(seeds))]);
                self.touch();
            }
            Completion::Fetch {
                node,
                generation,
                result,
            } => {
                let applied = self
                    .tree
                    .provider_mut(node)
                    .is_some_and(|provider| provider.fetch.complete(generation, result));

                if applied {
                    self.touch();
                } else {
                    self.diagnostics.stale_completions += 1;
                }
            }
        }
    }

    fn propagate(&mut self, work: Vec<Work>) {
        let mut queue = VecDeque::from(work);

        while let Some(item) = queue.pop_front() {
            match item {
                Work::Round(id, seeds) => self.react(id, seeds, &mut queue),
                Work::Shared(group, key) => self.refresh_shared(group, &key, &mut queue),
            }
        }
    }

    /// One evaluation round for a provider, followed by the refetch decision.
    fn react(&mut self, id: NodeId, seeds: Seeds, queue: &mut VecDeque<Work>) {
        let Some(provider) = self.tree.provider_mut(id) else {
            return;
        };

        let span = tracing::debug_span!("round", node = %id, kind = %provider.kind);
        let _enter = span.enter();

        let round = provider
            .graph
            .evaluate(seeds, &mut provider.store, &self.globals, &mut provider.helpers);

        if round.values_changed {
            tracing::debug!("settings fixed up");
        }

        let before = provider.fetch.status();
        provider.fetch.set_suspended(provider.helpers.any_pending());
        let fetch = provider
            .fetch
            .update(&*provider.provider, &provider.store, &self.globals);
        let dirty = round.changed || fetch.is_some() || before != provider.fetch.status();

        let shared: Vec<Key> = round
            .constraints_changed
            .into_iter()
            .filter(|key| provider.store.state(key).is_some_and(SettingState::is_overridden))
            .collect();

        self.diagnostics.rounds += 1;
        self.diagnostics.updater_invocations += round.invocations;
        self.diagnostics.helper_starts += round.helper_starts;

        for job in round.jobs {
            self.spawn_helper(id, job);
        }

        if let Some(job) = fetch {
            tracing::info!(node = %id, generation = job.generation, "fetching data");
            self.diagnostics.fetch_starts += 1;
            self.spawn_fetch(id, job);
        }

        for key in shared {
            if let Some(group) = self.tree.governor(id, &key) {
                queue.push_back(Work::Shared(group, key));
            }
        }

        if dirty {
            self.touch();
        }
    }

    // SHARED SETTINGS

    /// Marks governed provider settings as overridden and copies the group
    /// values in. Returns the setting vertices whose value changed.
    fn apply_overrides(&mut self, id: NodeId) -> Vec<petgraph::graph::NodeIndex> {
        let keys = match self.tree.get(id).and_then(Node::as_provider) {
            Some(provider) => provider.store.keys().to_vec(),
            None => return Vec::new(),
        };

        let mut changed = Vec::new();

        for key in keys {
            let shared = self.tree.governor(id, &key).and_then(|group| {
                self.tree
                    .get(group)
                    .and_then(|node| node.store().value(&key))
                    .cloned()
            });

            let Some(provider) = self.tree.provider_mut(id) else {
                break;
            };

            let value_changed = match shared {
                Some(value) => {
                    provider.store.set_overridden(&key, true);
                    provider.store.set_value(&key, value)
                }
                None if provider.store.state(&key).is_some_and(SettingState::is_overridden) => {
                    // Back under its own constraint.
                    provider.store.set_overridden(&key, false);
                    let constraint = provider.store.state(&key).and_then(|s| s.constraint().cloned());
                    constraint.is_some_and(|c| provider.store.apply_constraint(&key, c).value_changed)
                }
                None => false,
            };

            if value_changed && let Some(vertex) = provider.graph.setting_vertex(&key) {
                changed.push(vertex);
            }
        }

        changed
    }

    fn shared_work(&self, groups: &[NodeId]) -> Vec<Work> {
        groups
            .iter()
            .filter_map(|id| self.tree.get(*id).map(|node| (*id, node.store().keys())))
            .flat_map(|(id, keys)| keys.iter().map(move |key| Work::Shared(id, key.clone())))
            .collect()
    }

    /// Intersects the constraints of the governed providers, fixes the group
    /// value up against it and re-injects the value.
    fn refresh_shared(&mut self, group: NodeId, key: &Key, queue: &mut VecDeque<Work>) {
        let governed = self.tree.governed(group, key);

        let constraint = governed
            .iter()
            .filter_map(|id| {
                self.tree
                    .get(*id)
                    .and_then(|node| node.store().state(key))
                    .and_then(SettingState::constraint)
            })
            .fold(None, |acc: Option<Constraint>, next| match acc {
                None => Some(next.clone()),
                Some(acc) => Some(acc.intersect(next)),
            });

        let Some(constraint) = constraint else {
            // Nothing governed narrows the setting any more.
            if let Some(node) = self.tree.group_mut(group)
                && node.store.clear_constraint(key)
            {
                tracing::debug!(node = %group, setting = %key, "shared constraint cleared");
                self.touch();
            }
            return;
        };

        let Some(node) = self.tree.group_mut(group) else {
            return;
        };

        let fix = node.store.apply_constraint(key, constraint);
        let value = node.store.value(key).cloned().unwrap_or(Value::Null);

        if fix.constraint_changed || fix.value_changed {
            tracing::debug!(node = %group, setting = %key, "shared constraint changed");
            self.touch();
        }

        queue.extend(self.inject(group, key, &value));
    }

    /// Copies a group value into every provider it governs.
    fn inject(&mut self, group: NodeId, key: &str, value: &Value) -> Vec<Work> {
        let mut work = Vec::new();

        for id in self.tree.governed(group, key) {
            let Some(provider) = self.tree.provider_mut(id) else {
                continue;
            };

            if provider.store.set_value(key, value.clone()) {
                let seeds = provider.graph.setting_vertex(key).into_iter().collect();
                work.push(Work::Round(id, Seeds::Changed(seeds)));
            }
        }

        work
    }

    // JOBS

    fn spawn_helper(&mut self, node: NodeId, job: HelperJob) {
        let HelperJob {
            helper,
            generation,
            token,
            future,
        } = job;

        let sender = self.sender.clone();
        self.in_flight += 1;

        self.runtime.spawn(async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                result = AssertUnwindSafe(future).catch_unwind() => Some(result.unwrap_or_else(|panic| {
                    Err(anyhow::anyhow!("helper panicked: {}", panic_message(panic)))
                })),
            };

            // The engine may have been dropped.
            let _ = sender.send(Completion::Helper {
                node,
                helper,
                generation,
                result,
            });
        });
    }

    fn spawn_fetch(&mut self, node: NodeId, job: FetchJob) {
        let FetchJob {
            generation,
            token,
            future,
        } = job;

        let sender = self.sender.clone();
        self.in_flight += 1;

        self.runtime.spawn(async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                result = AssertUnwindSafe(future).catch_unwind() => Some(result.unwrap_or_else(|panic| {
                    Err(FetchError::Panicked(panic_message(panic)).into())
                })),
            };

            let _ = sender.send(Completion::Fetch {
                node,
                generation,
                result,
            });
        });
    }

    /// Cancels all work in the tree.
    pub(crate) fn cancel_all(&mut self) {
        for provider in self.tree.providers_mut() {
            provider.cancel();
        }
    }

    pub(crate) fn touch(&mut self) {
        self.revision += 1;
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

fn check_allowed(state: &SettingState, key: &str, value: &Value) -> Result<(), EngineError> {
    if !state.is_loading()
        && let Some(constraint) = state.constraint()
        && !constraint.contains(value)
    {
        return Err(EngineError::ValueNotAllowed {
            key: key.into(),
            value: value.clone(),
        });
    }
    Ok(())
}

fn make_group(registry: &Registry, kind: &Key) -> Result<GroupNode, EngineError> {
    let definition = registry
        .groups
        .get(kind)
        .ok_or_else(|| EngineError::UnknownGroupKind(kind.clone()))?;

    Ok(GroupNode {
        kind: kind.clone(),
        name: definition.default_name(),
        store: SettingStore::new(definition.shared_settings(), &definition.default_settings()),
        children: Vec::new(),
    })
}

fn make_provider(
    registry: &Registry,
    kind: &Key,
    initial: &Settings,
) -> Result<ProviderNode, EngineError> {
    let provider = registry
        .providers
        .get(kind)
        .cloned()
        .ok_or_else(|| EngineError::UnknownProviderKind(kind.clone()))?;

    let keys = provider.settings();

    let mut values = provider.default_settings();
    values.extend(
        initial
            .iter()
            .filter(|(key, _)| keys.contains(key))
            .map(|(key, value)| (key.clone(), value.clone())),
    );

    let mut dependencies = Dependencies::default();
    provider.define_dependencies(&mut dependencies);
    let (graph, helpers) = DependencyGraph::build(kind, &keys, dependencies)?;

    Ok(ProviderNode {
        kind: kind.clone(),
        name: provider.default_name(),
        store: SettingStore::new(keys, &values),
        graph,
        helpers,
        fetch: FetchState::default(),
        provider,
    })
}

/// Checks the declarations of a provider kind without creating a node.
pub(crate) fn validate_provider(registry: &Registry, kind: &Key) -> Result<(), EngineError> {
    make_provider(registry, kind, &Settings::new()).map(|_| ())
}
