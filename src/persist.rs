//! Saving and restoring the composition tree.
//!
//! The state is plain JSON: the resolved globals and the tree, each node
//! carrying its kind, name and setting values. Node ids, constraints, stored
//! data and fetched payloads are not persisted; they are derived again after
//! loading.

use serde::{Deserialize, Serialize};

use crate::core::{Key, NodeId, Settings};
use crate::engine::{Engine, NodeKind};
use crate::error::EngineError;

#[derive(Debug, Serialize, Deserialize)]
struct State {
    globals: Settings,
    root: NodeState,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum NodeState {
    Provider {
        kind: Key,
        name: String,
        settings: Settings,
    },
    Group {
        kind: Key,
        name: String,
        settings: Settings,
        children: Vec<NodeState>,
    },
}

impl Engine {
    /// Encodes the tree and the globals as an opaque string.
    pub fn serialize_state(&self) -> Result<String, EngineError> {
        let state = State {
            globals: self.globals.snapshot(),
            root: self.node_state(self.root()),
        };

        Ok(serde_json::to_string(&state)?)
    }

    fn node_state(&self, id: NodeId) -> NodeState {
        let Some(node) = self.tree.get(id) else {
            return NodeState::Group {
                kind: Key::from(crate::provider::ROOT_KIND),
                name: String::new(),
                settings: Settings::new(),
                children: Vec::new(),
            };
        };

        match &node.kind {
            NodeKind::Provider(provider) => NodeState::Provider {
                kind: provider.kind.clone(),
                name: provider.name.clone(),
                settings: provider.store.snapshot(),
            },
            NodeKind::Group(group) => NodeState::Group {
                kind: group.kind.clone(),
                name: group.name.clone(),
                settings: group.store.snapshot(),
                children: group
                    .children
                    .iter()
                    .map(|child| self.node_state(*child))
                    .collect(),
            },
        }
    }

    /// Replaces the whole tree and the globals with a serialized state.
    ///
    /// All in-flight work is cancelled first. Persisted values are applied
    /// before each provider's first evaluation round, so values that are
    /// still legal survive the reload unchanged. The state is decoded and
    /// every kind in it checked before anything is touched, so a rejected
    /// state leaves the engine as it was.
    pub fn deserialize_state(&mut self, state: &str) -> Result<(), EngineError> {
        let state: State = serde_json::from_str(state)?;
        self.check_kinds(&state.root)?;

        let NodeState::Group {
            settings, children, name, ..
        } = state.root
        else {
            return Err(EngineError::NotAGroup(self.root()));
        };

        tracing::info!("restoring engine state");

        let root = self.root();
        for child in self.tree.children(root).to_vec() {
            self.remove(child)?;
        }

        for key in self.globals.snapshot().keys() {
            self.clear_global(key);
        }
        for (key, value) in state.globals {
            self.set_global(&key, value);
        }

        if let Some(group) = self.tree.group_mut(root) {
            group.name = name;
            for (key, value) in &settings {
                group.store.set_value(key, value.clone());
            }
        }

        for child in children {
            self.restore(root, child)?;
        }

        self.touch();
        Ok(())
    }

    fn check_kinds(&self, state: &NodeState) -> Result<(), EngineError> {
        match state {
            NodeState::Provider { kind, .. } => {
                if !self.registry.providers.contains_key(kind) {
                    return Err(EngineError::UnknownProviderKind(kind.clone()));
                }
            }
            NodeState::Group { kind, children, .. } => {
                if !self.registry.groups.contains_key(kind) {
                    return Err(EngineError::UnknownGroupKind(kind.clone()));
                }
                for child in children {
                    self.check_kinds(child)?;
                }
            }
        }
        Ok(())
    }

    fn restore(&mut self, parent: NodeId, state: NodeState) -> Result<(), EngineError> {
        match state {
            NodeState::Provider {
                kind,
                name,
                settings,
            } => {
                self.create_provider(parent, &kind, Some(name), &settings)?;
            }
            NodeState::Group {
                kind,
                name,
                settings,
                children,
            } => {
                let id = self.create_group(parent, &kind, Some(name), &settings)?;
                for child in children {
                    self.restore(id, child)?;
                }
            }
        }
        Ok(())
    }
}
