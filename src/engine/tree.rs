use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::{Key, NodeId};
use crate::engine::fetch::FetchState;
use crate::engine::graph::DependencyGraph;
use crate::engine::helper::HelperCache;
use crate::provider::DataProvider;
use crate::store::SettingStore;

pub(crate) struct ProviderNode {
    pub kind: Key,
    pub name: String,
    pub provider: Arc<dyn DataProvider>,
    pub store: SettingStore,
    pub graph: DependencyGraph,
    pub helpers: HelperCache,
    pub fetch: FetchState,
}

impl ProviderNode {
    /// Cancels every in-flight computation owned by this node.
    pub(crate) fn cancel(&mut self) {
        self.helpers.cancel_all();
        self.fetch.cancel();
    }
}

pub(crate) struct GroupNode {
    pub kind: Key,
    pub name: String,
    /// Shared settings only.
    pub store: SettingStore,
    pub children: Vec<NodeId>,
}

pub(crate) enum NodeKind {
    Provider(Box<ProviderNode>),
    Group(GroupNode),
}

pub(crate) struct Node {
    pub parent: Option<NodeId>,
    pub kind: NodeKind,
}

impl Node {
    pub(crate) fn kind_name(&self) -> &Key {
        match &self.kind {
            NodeKind::Provider(provider) => &provider.kind,
            NodeKind::Group(group) => &group.kind,
        }
    }

    pub(crate) fn name(&self) -> &str {
        match &self.kind {
            NodeKind::Provider(provider) => &provider.name,
            NodeKind::Group(group) => &group.name,
        }
    }

    pub(crate) fn store(&self) -> &SettingStore {
        match &self.kind {
            NodeKind::Provider(provider) => &provider.store,
            NodeKind::Group(group) => &group.store,
        }
    }

    pub(crate) fn as_provider(&self) -> Option<&ProviderNode> {
        match &self.kind {
            NodeKind::Provider(provider) => Some(&**provider),
            NodeKind::Group(_) => None,
        }
    }

    pub(crate) fn as_group(&self) -> Option<&GroupNode> {
        match &self.kind {
            NodeKind::Group(group) => Some(group),
            NodeKind::Provider(_) => None,
        }
    }
}

/// The composition tree. Groups own ordered child lists; every node knows its
/// parent. The root is a group that can be neither removed nor moved.
pub(crate) struct Tree {
    nodes: BTreeMap<NodeId, Node>,
    root: NodeId,
    next: u64,
}

impl Tree {
    pub(crate) fn new(root: GroupNode) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            NodeId(0),
            Node {
                parent: None,
                kind: NodeKind::Group(root),
            },
        );

        Self {
            nodes,
            root: NodeId(0),
            next: 1,
        }
    }

    pub(crate) fn root(&self) -> NodeId {
        self.root
    }

    pub(crate) fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub(crate) fn provider_mut(&mut self, id: NodeId) -> Option<&mut ProviderNode> {
        match self.nodes.get_mut(&id).map(|node| &mut node.kind) {
            Some(NodeKind::Provider(provider)) => Some(&mut **provider),
            _ => None,
        }
    }

    pub(crate) fn group_mut(&mut self, id: NodeId) -> Option<&mut GroupNode> {
        match self.nodes.get_mut(&id).map(|node| &mut node.kind) {
            Some(NodeKind::Group(group)) => Some(group),
            _ => None,
        }
    }

    pub(crate) fn children(&self, id: NodeId) -> &[NodeId] {
        self.get(id)
            .and_then(Node::as_group)
            .map_or(&[][..], |group| group.children.as_slice())
    }

    /// Inserts `kind` under the group `parent` at `position` (clamped).
    /// The caller has checked that `parent` is a group.
    pub(crate) fn insert(&mut self, parent: NodeId, position: Option<usize>, kind: NodeKind) -> NodeId {
        let id = NodeId(self.next);
        self.next += 1;

        self.nodes.insert(
            id,
            Node {
                parent: Some(parent),
                kind,
            },
        );

        self.attach(parent, position, id);
        id
    }

    fn attach(&mut self, parent: NodeId, position: Option<usize>, id: NodeId) {
        if let Some(group) = self.group_mut(parent) {
            let position = position.unwrap_or(group.children.len()).min(group.children.len());
            group.children.insert(position, id);
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.parent = Some(parent);
        }
    }

    fn detach(&mut self, id: NodeId) {
        let parent = self.get(id).and_then(|node| node.parent);
        if let Some(group) = parent.and_then(|parent| self.group_mut(parent)) {
            group.children.retain(|child| *child != id);
        }
    }

    /// Removes `id` and its subtree, returning the removed nodes.
    pub(crate) fn remove(&mut self, id: NodeId) -> Vec<Node> {
        let subtree = self.subtree(id);
        self.detach(id);

        subtree
            .into_iter()
            .filter_map(|id| self.nodes.remove(&id))
            .collect()
    }

    /// Moves `id` under `parent` at `position`.
    pub(crate) fn relocate(&mut self, id: NodeId, parent: NodeId, position: Option<usize>) {
        self.detach(id);
        self.attach(parent, position, id);
    }

    /// `id` followed by all its descendants, depth first in child order.
    pub(crate) fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut acc = Vec::new();
        let mut stack = vec![id];

        while let Some(next) = stack.pop() {
            if self.nodes.contains_key(&next) {
                acc.push(next);
                stack.extend(self.children(next).iter().rev());
            }
        }

        acc
    }

    /// Proper ancestors of `id`, nearest first.
    pub(crate) fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut acc = Vec::new();
        let mut cursor = self.get(id).and_then(|node| node.parent);

        while let Some(next) = cursor {
            acc.push(next);
            cursor = self.get(next).and_then(|node| node.parent);
        }

        acc
    }

    /// The nearest ancestor group sharing setting `key`.
    pub(crate) fn governor(&self, id: NodeId, key: &str) -> Option<NodeId> {
        self.ancestors(id)
            .into_iter()
            .find(|ancestor| self.get(*ancestor).is_some_and(|node| node.store().contains(key)))
    }

    /// Providers in the subtree of `group` whose setting `key` is governed by it.
    pub(crate) fn governed(&self, group: NodeId, key: &str) -> Vec<NodeId> {
        self.subtree(group)
            .into_iter()
            .filter(|id| {
                self.get(*id)
                    .and_then(Node::as_provider)
                    .is_some_and(|provider| provider.store.contains(key))
                    && self.governor(*id, key) == Some(group)
            })
            .collect()
    }

    pub(crate) fn providers(&self) -> impl Iterator<Item = (NodeId, &ProviderNode)> {
        self.nodes
            .iter()
            .filter_map(|(id, node)| node.as_provider().map(|provider| (*id, provider)))
    }

    pub(crate) fn providers_mut(&mut self) -> impl Iterator<Item = &mut ProviderNode> {
        self.nodes.values_mut().filter_map(|node| match &mut node.kind {
            NodeKind::Provider(provider) => Some(&mut **provider),
            NodeKind::Group(_) => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Settings;

    fn group(shared: &[&str]) -> NodeKind {
        let keys = shared.iter().map(|key| Key::from(*key)).collect();
        NodeKind::Group(GroupNode {
            kind: "group".into(),
            name: "group".into(),
            store: SettingStore::new(keys, &Settings::new()),
            children: Vec::new(),
        })
    }

    fn tree() -> Tree {
        Tree::new(GroupNode {
            kind: "root".into(),
            name: "root".into(),
            store: SettingStore::default(),
            children: Vec::new(),
        })
    }

    #[test]
    fn test_insert_positions() {
        let mut tree = tree();
        let root = tree.root();

        let a = tree.insert(root, None, group(&[]));
        let b = tree.insert(root, Some(0), group(&[]));
        let c = tree.insert(root, Some(99), group(&[]));

        assert_eq!(tree.children(root), &[b, a, c]);
    }

    #[test]
    fn test_subtree_and_ancestors() {
        let mut tree = tree();
        let root = tree.root();

        let outer = tree.insert(root, None, group(&[]));
        let inner = tree.insert(outer, None, group(&[]));
        let sibling = tree.insert(outer, None, group(&[]));

        assert_eq!(tree.subtree(outer), vec![outer, inner, sibling]);
        assert_eq!(tree.ancestors(inner), vec![outer, root]);

        let removed = tree.remove(outer);
        assert_eq!(removed.len(), 3);
        assert!(tree.children(root).is_empty());
        assert!(tree.get(inner).is_none());
    }

    #[test]
    fn test_nearest_governor_wins() {
        let mut tree = tree();
        let root = tree.root();

        let outer = tree.insert(root, None, group(&["ensemble"]));
        let inner = tree.insert(outer, None, group(&["ensemble"]));
        let leaf = tree.insert(inner, None, group(&[]));

        assert_eq!(tree.governor(leaf, "ensemble"), Some(inner));
        assert_eq!(tree.governor(inner, "ensemble"), Some(outer));
        assert_eq!(tree.governor(leaf, "realization"), None);

        tree.relocate(leaf, outer, None);
        assert_eq!(tree.governor(leaf, "ensemble"), Some(outer));
        assert_eq!(tree.children(inner), &[] as &[NodeId]);
    }
}
