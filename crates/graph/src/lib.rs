//! Kiln graph: the static DAG of dependents for one application kind.
//!
//! Graphs are declared once at startup with [`ReconcileGraph::builder`] and are immutable
//! afterwards. `build()` validates names and edges and resolves the traversal order, so a
//! misconfigured graph never reaches a reconcile pass.

#![forbid(unsafe_code)]

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;

use kiln_core::{Condition, ConfigError, DependentResource, TypeKey};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::debug;

pub type Edges = SmallVec<[String; 4]>;

/// One dependent in the graph.
///
/// `depends_on` edges are hard: if the target is skipped, this node is skipped too.
/// `after` edges only order traversal and gate on readiness of an applied target; a
/// skipped target is treated as not applicable.
#[derive(Clone)]
pub struct DependentNode {
    name: String,
    dependent: Arc<dyn DependentResource>,
    precondition: Option<Arc<dyn Condition>>,
    postcondition: Option<Arc<dyn Condition>>,
    depends_on: Edges,
    after: Edges,
}

impl DependentNode {
    pub fn new(name: &str, dependent: impl DependentResource + 'static) -> Self {
        Self::from_arc(name, Arc::new(dependent))
    }

    pub fn from_arc(name: &str, dependent: Arc<dyn DependentResource>) -> Self {
        Self {
            name: name.to_string(),
            dependent,
            precondition: None,
            postcondition: None,
            depends_on: SmallVec::new(),
            after: SmallVec::new(),
        }
    }

    pub fn depends_on<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn after<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.after.extend(names.into_iter().map(Into::into));
        self
    }

    /// Reconcile precondition: when false the node is skipped for the pass.
    pub fn reconcile_when(mut self, cond: impl Condition + 'static) -> Self {
        self.precondition = Some(Arc::new(cond));
        self
    }

    /// Ready postcondition: when false the applied node counts as not ready.
    pub fn ready_when(mut self, cond: impl Condition + 'static) -> Self {
        self.postcondition = Some(Arc::new(cond));
        self
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn dependent(&self) -> &dyn DependentResource { self.dependent.as_ref() }
    pub fn type_key(&self) -> TypeKey { self.dependent.type_key() }
    pub fn precondition(&self) -> Option<&dyn Condition> { self.precondition.as_deref() }
    pub fn postcondition(&self) -> Option<&dyn Condition> { self.postcondition.as_deref() }
    pub fn hard_deps(&self) -> &[String] { &self.depends_on }
    pub fn soft_deps(&self) -> &[String] { &self.after }

    /// All edges, hard first.
    pub fn all_deps(&self) -> impl Iterator<Item = &str> {
        self.depends_on.iter().chain(self.after.iter()).map(|s| s.as_str())
    }
}

impl fmt::Debug for DependentNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependentNode")
            .field("name", &self.name)
            .field("type", &self.dependent.type_key().gvk_key())
            .field("depends_on", &self.depends_on)
            .field("after", &self.after)
            .field("precondition", &self.precondition.is_some())
            .field("postcondition", &self.postcondition.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<DependentNode>,
}

impl GraphBuilder {
    pub fn node(mut self, node: DependentNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn build(self) -> Result<ReconcileGraph, ConfigError> { ReconcileGraph::new(self.nodes) }
}

/// Validated dependency graph with its resolved traversal order.
#[derive(Debug)]
pub struct ReconcileGraph {
    nodes: Vec<DependentNode>,
    index: FxHashMap<String, usize>,
    order: Vec<usize>,
}

impl ReconcileGraph {
    pub fn builder() -> GraphBuilder { GraphBuilder::default() }

    /// Validate and order `nodes` (declaration order is significant for tie breaks).
    pub fn new(nodes: Vec<DependentNode>) -> Result<Self, ConfigError> {
        let mut index = FxHashMap::default();
        for (i, n) in nodes.iter().enumerate() {
            if index.insert(n.name.clone(), i).is_some() {
                return Err(ConfigError::DuplicateNode(n.name.clone()));
            }
        }
        for n in &nodes {
            if let Some(missing) = n.all_deps().find(|d| !index.contains_key(*d)) {
                return Err(ConfigError::DanglingDependency { node: n.name.clone(), missing: missing.to_string() });
            }
        }
        let order = resolve_order(&nodes, &index)?;
        debug!(nodes = nodes.len(), "reconcile graph resolved");
        Ok(Self { nodes, index, order })
    }

    /// Node names in traversal order: every dependency precedes its dependents.
    pub fn resolve_order(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.nodes[i].name.as_str()).collect()
    }

    /// Same as [`resolve_order`](Self::resolve_order).
    pub fn order(&self) -> Vec<&str> { self.resolve_order() }

    /// Nodes in traversal order.
    pub fn ordered(&self) -> impl Iterator<Item = &DependentNode> {
        self.order.iter().map(move |&i| &self.nodes[i])
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[DependentNode] { &self.nodes }

    pub fn node(&self, name: &str) -> Option<&DependentNode> { self.index.get(name).map(|&i| &self.nodes[i]) }

    /// Names of nodes that list `name` among their dependencies (hard or soft), in declaration order.
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.all_deps().any(|d| d == name))
            .map(|n| n.name.as_str())
            .collect()
    }

    /// Distinct managed types, in first-declared order.
    pub fn type_keys(&self) -> Vec<TypeKey> {
        let mut out: Vec<TypeKey> = Vec::new();
        for n in &self.nodes {
            let tk = n.type_key();
            if !out.contains(&tk) { out.push(tk); }
        }
        out
    }

    pub fn len(&self) -> usize { self.nodes.len() }
    pub fn is_empty(&self) -> bool { self.nodes.is_empty() }
}

/// Kahn's algorithm; among ready nodes the earliest declared goes first.
fn resolve_order(nodes: &[DependentNode], index: &FxHashMap<String, usize>) -> Result<Vec<usize>, ConfigError> {
    let mut indegree = vec![0usize; nodes.len()];
    let mut dependents: Vec<SmallVec<[usize; 4]>> = vec![SmallVec::new(); nodes.len()];
    for (i, n) in nodes.iter().enumerate() {
        for d in n.all_deps() {
            // Validated above; duplicates in a dep list count once per occurrence on both sides.
            if let Some(&j) = index.get(d) {
                indegree[i] += 1;
                dependents[j].push(i);
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> =
        indegree.iter().enumerate().filter(|(_, d)| **d == 0).map(|(i, _)| Reverse(i)).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &k in &dependents[i] {
            indegree[k] -= 1;
            if indegree[k] == 0 { ready.push(Reverse(k)); }
        }
    }

    if order.len() != nodes.len() {
        let nodes = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d > 0)
            .map(|(i, _)| nodes[i].name.clone())
            .collect();
        return Err(ConfigError::Cycle { nodes });
    }
    Ok(order)
}
