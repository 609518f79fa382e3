//! Bottom-up assembly of the renderer-facing product.
//!
//! The assembler walks the composition tree once, asks the transforms
//! registered for each provider kind for a render item, a bounding box and
//! annotations, and folds the results up through the groups:
//!
//! ```text
//!   root ── boxes ∪, annotations ++, loading Σ, errors ++
//!    ├── group ── boxes ∪, annotations ++ (props computed first)
//!    │    ├── provider (SUCCESS) ── item, box, annotations
//!    │    └── provider (LOADING) ── nothing, counted as loading
//!    └── provider (ERROR) ── nothing, message collected
//! ```
//!
//! Assembly reads the engine and never mutates it, so the same revision
//! always produces an equal product.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::{Key, NULL, NodeId, Payload, Value};
use crate::engine::{Engine, FetchStatus, Node, NodeKind};
use crate::error::{FetchError, panic_message};
use crate::store::SettingStore;

/// An axis-aligned box. Each axis is `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: [f64; 2],
    pub y: [f64; 2],
    pub z: [f64; 2],
}

impl BoundingBox {
    pub fn new(x: [f64; 2], y: [f64; 2], z: [f64; 2]) -> Self {
        Self { x, y, z }
    }

    /// A flat box at `z = 0`.
    pub fn xy(x: [f64; 2], y: [f64; 2]) -> Self {
        Self::new(x, y, [0.0, 0.0])
    }

    /// The smallest box enclosing both.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        fn axis(a: [f64; 2], b: [f64; 2]) -> [f64; 2] {
            [a[0].min(b[0]), a[1].max(b[1])]
        }

        BoundingBox {
            x: axis(self.x, other.x),
            y: axis(self.y, other.y),
            z: axis(self.z, other.z),
        }
    }

    /// Combines two optional boxes; a missing box is absorbed.
    pub fn combine(a: Option<BoundingBox>, b: Option<BoundingBox>) -> Option<BoundingBox> {
        match (a, b) {
            (Some(a), Some(b)) => Some(a.union(&b)),
            (a, None) => a,
            (None, b) => b,
        }
    }

    pub fn contains(&self, [x, y, z]: [f64; 3]) -> bool {
        let inside = |[min, max]: [f64; 2], v: f64| min <= v && v <= max;
        inside(self.x, x) && inside(self.y, y) && inside(self.z, z)
    }
}

/// Read access handed to provider transforms.
pub struct TransformArgs<'a> {
    id: NodeId,
    name: &'a str,
    store: &'a SettingStore,
    data: &'a Payload,
    loading: bool,
    value_range: Option<(f64, f64)>,
    engine: &'a Engine,
    props: Option<&'a Value>,
}

impl<'a> TransformArgs<'a> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &'a str {
        self.name
    }

    /// The fetched payload, if it is a `T`.
    pub fn data<T: Any>(&self) -> Option<&'a T> {
        self.data.downcast_ref::<T>()
    }

    pub fn setting(&self, key: &str) -> &'a Value {
        self.store.value(key).unwrap_or(&NULL)
    }

    /// A stored-data entry. `None` means it is not derived yet; a transform
    /// that needs it answers `Ok(None)` and waits for a later pass.
    pub fn stored(&self, key: &str) -> Option<&'a Value> {
        self.store.stored(key)
    }

    /// A stored-data entry whose absence breaks the provider's own contract,
    /// e.g. data the fetch already relied on. Missing data becomes the
    /// provider's error. Use [`TransformArgs::stored`] for the not-ready case.
    pub fn require_stored(&self, key: &str) -> Result<&'a Value, FetchError> {
        self.stored(key)
            .ok_or_else(|| FetchError::MissingStoredData(key.into()))
    }

    pub fn global(&self, key: &str) -> &'a Value {
        self.engine.global(key)
    }

    /// Whether any setting waits on a helper dependency.
    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn value_range(&self) -> Option<(f64, f64)> {
        self.value_range
    }

    /// Properties collected by the nearest ancestor group that has any.
    pub fn group_props(&self) -> Option<&'a Value> {
        self.props
    }
}

/// Read access handed to group property collectors.
pub struct GroupArgs<'a> {
    id: NodeId,
    name: &'a str,
    store: &'a SettingStore,
    engine: &'a Engine,
    props: Option<&'a Value>,
}

impl<'a> GroupArgs<'a> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &'a str {
        self.name
    }

    /// A shared setting of this group.
    pub fn setting(&self, key: &str) -> &'a Value {
        self.store.value(key).unwrap_or(&NULL)
    }

    pub fn global(&self, key: &str) -> &'a Value {
        self.engine.global(key)
    }

    pub fn children(&self) -> &'a [NodeId] {
        self.engine.children(self.id).unwrap_or(&[])
    }

    /// Properties of the nearest ancestor group that has any.
    pub fn inherited(&self) -> Option<&'a Value> {
        self.props
    }
}

type Transform<T> = Arc<dyn Fn(&TransformArgs<'_>) -> anyhow::Result<T> + Send + Sync>;

/// Transforms registered for one provider kind.
pub struct ProviderTransforms<I, A> {
    visualization: Transform<Option<I>>,
    bounding_box: Option<Transform<Option<BoundingBox>>>,
    annotations: Option<Transform<Vec<A>>>,
}

impl<I, A> ProviderTransforms<I, A> {
    /// `visualization` may return `None` when its own preconditions are unmet.
    pub fn new<F>(visualization: F) -> Self
    where
        F: Fn(&TransformArgs<'_>) -> anyhow::Result<Option<I>> + Send + Sync + 'static,
    {
        Self {
            visualization: Arc::new(visualization),
            bounding_box: None,
            annotations: None,
        }
    }

    pub fn bounding_box<F>(mut self, f: F) -> Self
    where
        F: Fn(&TransformArgs<'_>) -> anyhow::Result<Option<BoundingBox>> + Send + Sync + 'static,
    {
        self.bounding_box = Some(Arc::new(f));
        self
    }

    pub fn annotations<F>(mut self, f: F) -> Self
    where
        F: Fn(&TransformArgs<'_>) -> anyhow::Result<Vec<A>> + Send + Sync + 'static,
    {
        self.annotations = Some(Arc::new(f));
        self
    }
}

/// The property collector registered for one group kind.
pub struct GroupTransforms {
    collector: Arc<dyn Fn(&GroupArgs<'_>) -> Value + Send + Sync>,
}

impl GroupTransforms {
    pub fn new<F>(collector: F) -> Self
    where
        F: Fn(&GroupArgs<'_>) -> Value + Send + Sync + 'static,
    {
        Self {
            collector: Arc::new(collector),
        }
    }
}

/// Maps provider and group kinds to their transforms.
pub struct VisualizationTargets<I, A> {
    providers: HashMap<Key, ProviderTransforms<I, A>>,
    groups: HashMap<Key, GroupTransforms>,
}

impl<I, A> VisualizationTargets<I, A> {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            groups: HashMap::new(),
        }
    }

    pub fn provider(mut self, kind: impl Into<Key>, transforms: ProviderTransforms<I, A>) -> Self {
        self.providers.insert(kind.into(), transforms);
        self
    }

    pub fn group(mut self, kind: impl Into<Key>, transforms: GroupTransforms) -> Self {
        self.groups.insert(kind.into(), transforms);
        self
    }
}

impl<I, A> Default for VisualizationTargets<I, A> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderProduct<I, A> {
    pub id: NodeId,
    pub name: String,
    pub kind: Key,
    pub status: FetchStatus,
    pub item: Option<I>,
    pub bounding_box: Option<BoundingBox>,
    pub annotations: Vec<A>,
    /// Fetch failure or transform failure.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupProduct<I, A> {
    pub id: NodeId,
    pub name: String,
    pub kind: Key,
    pub props: Option<Value>,
    pub children: Vec<ProductNode<I, A>>,
    pub bounding_box: Option<BoundingBox>,
    pub annotations: Vec<A>,
}

impl<I, A> GroupProduct<I, A> {
    /// Render items of the subtree, in tree order.
    pub fn items(&self) -> Vec<&I> {
        let mut acc = Vec::new();
        for child in &self.children {
            match child {
                ProductNode::Provider(provider) => acc.extend(provider.item.as_ref()),
                ProductNode::Group(group) => acc.extend(group.items()),
            }
        }
        acc
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProductNode<I, A> {
    Provider(ProviderProduct<I, A>),
    Group(GroupProduct<I, A>),
}

impl<I, A> ProductNode<I, A> {
    pub fn id(&self) -> NodeId {
        match self {
            ProductNode::Provider(provider) => provider.id,
            ProductNode::Group(group) => group.id,
        }
    }

    pub fn bounding_box(&self) -> Option<BoundingBox> {
        match self {
            ProductNode::Provider(provider) => provider.bounding_box,
            ProductNode::Group(group) => group.bounding_box,
        }
    }

    pub fn annotations(&self) -> &[A] {
        match self {
            ProductNode::Provider(provider) => &provider.annotations,
            ProductNode::Group(group) => &group.annotations,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub id: NodeId,
    pub name: String,
    pub message: String,
}

/// The immutable output of one assembly pass.
#[derive(Debug, Clone, PartialEq)]
pub struct VisualizationProduct<I, A> {
    pub revision: u64,
    pub root: GroupProduct<I, A>,
    pub num_loading_data_providers: usize,
    pub errors: Vec<ProviderError>,
}

impl<I, A> VisualizationProduct<I, A> {
    /// Looks up the product of a node by id.
    pub fn find(&self, id: NodeId) -> Option<&ProductNode<I, A>> {
        fn walk<I, A>(group: &GroupProduct<I, A>, id: NodeId) -> Option<&ProductNode<I, A>> {
            group.children.iter().find_map(|child| match child {
                _ if child.id() == id => Some(child),
                ProductNode::Group(inner) => walk(inner, id),
                ProductNode::Provider(_) => None,
            })
        }

        walk(&self.root, id)
    }
}

#[derive(Default)]
struct Totals {
    loading: usize,
    errors: Vec<ProviderError>,
}

/// Assembles products and caches the last one by engine and revision.
pub struct Assembler<I, A> {
    targets: VisualizationTargets<I, A>,
    cache: Option<(u64, Arc<VisualizationProduct<I, A>>)>,
}

impl<I, A> Assembler<I, A>
where
    A: Clone,
{
    pub fn new(targets: VisualizationTargets<I, A>) -> Self {
        Self {
            targets,
            cache: None,
        }
    }

    /// The product for the engine's current revision, reassembled only when
    /// the revision moved or a different engine is passed in.
    pub fn product(&mut self, engine: &Engine) -> Arc<VisualizationProduct<I, A>> {
        if let Some((instance, cached)) = &self.cache
            && *instance == engine.instance()
            && cached.revision == engine.revision()
        {
            return cached.clone();
        }

        let product = Arc::new(self.assemble(engine));
        self.cache = Some((engine.instance(), product.clone()));
        product
    }

    /// Runs one assembly pass.
    pub fn assemble(&self, engine: &Engine) -> VisualizationProduct<I, A> {
        let span = tracing::debug_span!("assemble", revision = engine.revision());
        let _enter = span.enter();

        let mut totals = Totals::default();
        let root = engine.root();
        let root = match engine.tree.get(root) {
            Some(node) => self.group(engine, root, node, None, &mut totals),
            None => GroupProduct {
                id: root,
                name: String::new(),
                kind: Key::from(crate::provider::ROOT_KIND),
                props: None,
                children: Vec::new(),
                bounding_box: None,
                annotations: Vec::new(),
            },
        };

        VisualizationProduct {
            revision: engine.revision(),
            root,
            num_loading_data_providers: totals.loading,
            errors: totals.errors,
        }
    }

    fn group(
        &self,
        engine: &Engine,
        id: NodeId,
        node: &Node,
        inherited: Option<&Value>,
        totals: &mut Totals,
    ) -> GroupProduct<I, A> {
        let kind = node.kind_name().clone();
        let store = node.store();

        // Own props first, children see them.
        let props = self.targets.groups.get(&kind).and_then(|transforms| {
            let args = GroupArgs {
                id,
                name: node.name(),
                store,
                engine,
                props: inherited,
            };

            match std::panic::catch_unwind(AssertUnwindSafe(|| (transforms.collector)(&args))) {
                Ok(props) => Some(props),
                Err(panic) => {
                    tracing::error!(node = %id, "group collector panicked: {}", panic_message(panic));
                    None
                }
            }
        });

        let visible = props.as_ref().or(inherited);

        let mut children = Vec::new();
        for child in engine.tree.children(id) {
            let Some(child_node) = engine.tree.get(*child) else {
                continue;
            };

            let product = match &child_node.kind {
                NodeKind::Group(_) => {
                    ProductNode::Group(self.group(engine, *child, child_node, visible, totals))
                }
                NodeKind::Provider(_) => {
                    ProductNode::Provider(self.provider(engine, *child, child_node, visible, totals))
                }
            };

            children.push(product);
        }

        let bounding_box = children
            .iter()
            .fold(None, |acc, child| BoundingBox::combine(acc, child.bounding_box()));

        let annotations = children
            .iter()
            .flat_map(|child| child.annotations().iter().cloned())
            .collect();

        GroupProduct {
            id,
            name: node.name().to_string(),
            kind,
            props,
            children,
            bounding_box,
            annotations,
        }
    }

    fn provider(
        &self,
        engine: &Engine,
        id: NodeId,
        node: &Node,
        props: Option<&Value>,
        totals: &mut Totals,
    ) -> ProviderProduct<I, A> {
        let kind = node.kind_name().clone();
        let mut product = ProviderProduct {
            id,
            name: node.name().to_string(),
            kind: kind.clone(),
            status: FetchStatus::Idle,
            item: None,
            bounding_box: None,
            annotations: Vec::new(),
            error: None,
        };

        let Some(provider) = node.as_provider() else {
            return product;
        };

        product.status = provider.fetch.status();

        match product.status {
            FetchStatus::Loading => totals.loading += 1,
            FetchStatus::Error => {
                let message = provider.fetch.error().unwrap_or("unknown error").to_string();
                product.error = Some(message);
            }
            _ => {}
        }

        if product.status == FetchStatus::Success
            && let Some(data) = provider.fetch.data()
        {
            match self.targets.providers.get(&kind) {
                Some(transforms) => {
                    let args = TransformArgs {
                        id,
                        name: &provider.name,
                        store: &provider.store,
                        data,
                        loading: provider.store.is_loading(),
                        value_range: provider.provider.value_range(data),
                        engine,
                        props,
                    };

                    if let Err(err) = run_transforms(transforms, &args, &mut product) {
                        tracing::warn!(node = %id, "transform failed: {err}");
                        product.item = None;
                        product.bounding_box = None;
                        product.annotations.clear();
                        product.error = Some(err);
                    }
                }
                None => tracing::debug!(kind = %kind, "no transforms registered"),
            }
        }

        if let Some(message) = &product.error {
            totals.errors.push(ProviderError {
                id,
                name: product.name.clone(),
                message: message.clone(),
            });
        }

        product
    }
}

fn run_transforms<I, A>(
    transforms: &ProviderTransforms<I, A>,
    args: &TransformArgs<'_>,
    product: &mut ProviderProduct<I, A>,
) -> Result<(), String> {
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| -> anyhow::Result<()> {
        product.item = (transforms.visualization)(args)?;

        if let Some(f) = &transforms.bounding_box {
            product.bounding_box = f(args)?;
        }

        if let Some(f) = &transforms.annotations {
            product.annotations = f(args)?;
        }

        Ok(())
    }));

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(format!("{err:#}")),
        Err(panic) => Err(FetchError::Panicked(panic_message(panic)).to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxes() -> [BoundingBox; 3] {
        [
            BoundingBox::xy([0.0, 10.0], [0.0, 5.0]),
            BoundingBox::xy([-3.0, 2.0], [4.0, 8.0]),
            BoundingBox::new([1.0, 1.0], [1.0, 1.0], [-7.0, 7.0]),
        ]
    }

    #[test]
    fn test_combine_absorbs_none() {
        let [a, ..] = boxes();
        assert_eq!(BoundingBox::combine(Some(a), None), Some(a));
        assert_eq!(BoundingBox::combine(None, Some(a)), Some(a));
        assert_eq!(BoundingBox::combine(None, None), None);
    }

    #[test]
    fn test_union_encloses_both_minimally() {
        let boxes = boxes();

        for a in &boxes {
            for b in &boxes {
                let union = a.union(b);

                for bx in [a, b] {
                    for x in bx.x {
                        for y in bx.y {
                            for z in bx.z {
                                assert!(union.contains([x, y, z]));
                            }
                        }
                    }
                }

                // Every face touches one of the inputs.
                assert_eq!(union.x[0], a.x[0].min(b.x[0]));
                assert_eq!(union.y[1], a.y[1].max(b.y[1]));
                assert_eq!(union.z[0], a.z[0].min(b.z[0]));
            }
        }
    }

    #[test]
    fn test_union_commutes() {
        let [a, b, c] = boxes();
        assert_eq!(a.union(&b), b.union(&a));
        assert_eq!(a.union(&b).union(&c), a.union(&b.union(&c)));
    }
}
