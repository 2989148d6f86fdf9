//! Kiln core types and contracts shared by the graph, engine and cluster crates.
//!
//! Everything a dependent, a condition, or a cluster backend needs to agree on lives
//! here: type keys, primary identity, the `Observed` sum type, per-node pass state and
//! the composite status written back onto primaries.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::{DynamicObject, GroupVersionKind, ObjectMeta, TypeMeta};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub type Json = serde_json::Value;

// ---------------- Errors ----------------

/// Static graph/app configuration problems. Fatal at startup, never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("duplicate dependent node: {0}")]
    DuplicateNode(String),
    #[error("node {node} depends on unknown node {missing}")]
    DanglingDependency { node: String, missing: String },
    #[error("dependency cycle among nodes: {}", .nodes.join(", "))]
    Cycle { nodes: Vec<String> },
    #[error("invalid type key: {0} (expect v1/Kind or group/v1/Kind)")]
    InvalidTypeKey(String),
}

/// Failure to produce or apply one dependent. Local to that node.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApplyError {
    #[error("desired state: {0}")]
    Produce(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport: {0}")]
    Transport(String),
    #[error("malformed object: {0}")]
    Malformed(String),
}

/// Failure writing a composite status back onto a primary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StatusError {
    /// Someone else wrote the primary since we read it; re-read and retry.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("status write failed: {0}")]
    Other(String),
}

// ---------------- Identity ----------------

/// Group/version/kind of a managed object type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeKey {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl TypeKey {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    /// Parse `v1/Kind` or `group/version/Kind`.
    pub fn parse(key: &str) -> Result<Self, ConfigError> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", version, kind)),
            [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
                Ok(Self::new(group, version, kind))
            }
            _ => Err(ConfigError::InvalidTypeKey(key.to_string())),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn to_gvk(&self) -> GroupVersionKind {
        GroupVersionKind { group: self.group.clone(), version: self.version.clone(), kind: self.kind.clone() }
    }

    /// Build an object of this type. `data` carries everything besides metadata (spec, data, ...).
    pub fn object(&self, namespace: Option<&str>, name: &str, data: Json) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta { api_version: self.api_version(), kind: self.kind.clone() }),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: namespace.map(|s| s.to_string()),
                ..Default::default()
            },
            data,
        }
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.gvk_key()) }
}

/// Identity of a primary: (kind, namespace, name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrimaryRef {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl PrimaryRef {
    pub fn new(kind: &str, namespace: Option<&str>, name: &str) -> Self {
        Self { kind: kind.to_string(), namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }
}

impl fmt::Display for PrimaryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Controller owner of an object, if any. Only the owner flagged `controller: true` counts.
pub fn controller_owner(meta: &ObjectMeta) -> Option<PrimaryRef> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|o| o.controller.unwrap_or(false))
        .map(|o| PrimaryRef { kind: o.kind.clone(), namespace: meta.namespace.clone(), name: o.name.clone() })
}

// ---------------- Primary ----------------

/// One application instance as read from the cluster. `spec` is fixed for the duration of a pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Primary {
    pub reference: PrimaryRef,
    pub api_version: String,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
    pub generation: Option<i64>,
    pub labels: BTreeMap<String, String>,
    pub spec: Json,
    pub status: Json,
}

impl Primary {
    pub fn from_dynamic(type_key: &TypeKey, obj: &DynamicObject) -> Result<Self, ApplyError> {
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| ApplyError::Malformed(format!("{} without metadata.name", type_key.kind)))?;
        Ok(Self {
            reference: PrimaryRef { kind: type_key.kind.clone(), namespace: obj.metadata.namespace.clone(), name },
            api_version: type_key.api_version(),
            uid: obj.metadata.uid.clone(),
            resource_version: obj.metadata.resource_version.clone(),
            generation: obj.metadata.generation,
            labels: obj.metadata.labels.clone().unwrap_or_default(),
            spec: obj.data.get("spec").cloned().unwrap_or(Json::Null),
            status: obj.data.get("status").cloned().unwrap_or(Json::Null),
        })
    }

    pub fn name(&self) -> &str { &self.reference.name }
    pub fn namespace(&self) -> Option<&str> { self.reference.namespace.as_deref() }

    /// Deserialize the spec into an app-specific type.
    pub fn spec_as<T: DeserializeOwned>(&self) -> Result<T, ApplyError> {
        serde_json::from_value(self.spec.clone())
            .map_err(|e| ApplyError::Produce(format!("{} spec: {}", self.reference.kind, e)))
    }

    /// Spec field at a JSON pointer, e.g. `/backups/schedule`.
    pub fn spec_field(&self, pointer: &str) -> Option<&Json> {
        self.spec.pointer(pointer).filter(|v| !v.is_null())
    }

    /// Controller owner reference pointing back at this primary. None until the primary has a uid.
    pub fn owner_reference(&self) -> Option<OwnerReference> {
        let uid = self.uid.clone()?;
        Some(OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.reference.kind.clone(),
            name: self.reference.name.clone(),
            uid,
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }
}

// ---------------- Observation ----------------

/// Last-seen state of one managed object.
#[derive(Debug, Clone, Default)]
pub enum Observed {
    Present(Arc<DynamicObject>),
    #[default]
    Absent,
}

static ABSENT: Observed = Observed::Absent;

impl Observed {
    pub fn present(obj: DynamicObject) -> Self { Self::Present(Arc::new(obj)) }
    pub fn is_present(&self) -> bool { matches!(self, Self::Present(_)) }

    pub fn object(&self) -> Option<&DynamicObject> {
        match self {
            Self::Present(o) => Some(o.as_ref()),
            Self::Absent => None,
        }
    }

    /// Field of the observed object body at a JSON pointer, e.g. `/status/readyReplicas`.
    pub fn pointer(&self, pointer: &str) -> Option<&Json> {
        self.object().and_then(|o| o.data.pointer(pointer))
    }
}

impl PartialEq for Observed {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Absent, Self::Absent) => true,
            (Self::Present(a), Self::Present(b)) => {
                a.types == b.types && a.metadata == b.metadata && a.data == b.data
            }
            _ => false,
        }
    }
}

/// Why a node was not attempted this pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Own reconcile precondition evaluated false.
    Precondition,
    /// A hard dependency was skipped.
    DependencySkipped(String),
    /// A dependency was applied but is not ready.
    DependencyNotReady(String),
    /// A dependency failed to apply.
    DependencyFailed(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Precondition => f.write_str("precondition not met"),
            Self::DependencySkipped(n) => write!(f, "dependency {} skipped", n),
            Self::DependencyNotReady(n) => write!(f, "dependency {} not ready", n),
            Self::DependencyFailed(n) => write!(f, "dependency {} failed", n),
        }
    }
}

/// Per-node state within one pass.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeState {
    #[default]
    Pending,
    Skipped(SkipReason),
    AppliedNotReady,
    AppliedReady,
    Failed(String),
}

impl NodeState {
    pub fn is_applied(&self) -> bool { matches!(self, Self::AppliedReady | Self::AppliedNotReady) }
    pub fn is_ready(&self) -> bool { matches!(self, Self::AppliedReady) }
    pub fn is_failed(&self) -> bool { matches!(self, Self::Failed(_)) }
    pub fn is_skipped(&self) -> bool { matches!(self, Self::Skipped(_)) }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Skipped(_) => "skipped",
            Self::AppliedNotReady => "not-ready",
            Self::AppliedReady => "ready",
            Self::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped(r) => write!(f, "skipped ({})", r),
            Self::Failed(e) => write!(f, "failed ({})", e),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeObservation {
    pub state: NodeState,
    pub object: Observed,
}

/// Observations of every node for one pass, keyed by node name.
///
/// Seeded from the shared cache before traversal; nodes applied during the pass replace
/// their entry with the fresh server response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservedSet {
    nodes: BTreeMap<String, NodeObservation>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassCounts {
    pub ready: usize,
    pub not_ready: usize,
    pub skipped: usize,
    pub failed: usize,
    pub pending: usize,
}

impl ObservedSet {
    pub fn new() -> Self { Self::default() }

    pub fn seed(&mut self, node: &str, object: Observed) {
        self.nodes.insert(node.to_string(), NodeObservation { state: NodeState::Pending, object });
    }

    pub fn set_state(&mut self, node: &str, state: NodeState) {
        self.nodes.entry(node.to_string()).or_default().state = state;
    }

    pub fn record(&mut self, node: &str, state: NodeState, object: Observed) {
        self.nodes.insert(node.to_string(), NodeObservation { state, object });
    }

    pub fn get(&self, node: &str) -> Option<&NodeObservation> { self.nodes.get(node) }
    pub fn state(&self, node: &str) -> Option<&NodeState> { self.nodes.get(node).map(|n| &n.state) }

    /// Observed object for a node; `Absent` when the node is unknown.
    pub fn object(&self, node: &str) -> &Observed {
        self.nodes.get(node).map(|n| &n.object).unwrap_or(&ABSENT)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &NodeObservation)> {
        self.nodes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize { self.nodes.len() }
    pub fn is_empty(&self) -> bool { self.nodes.is_empty() }

    pub fn counts(&self) -> PassCounts {
        let mut c = PassCounts::default();
        for n in self.nodes.values() {
            match n.state {
                NodeState::AppliedReady => c.ready += 1,
                NodeState::AppliedNotReady => c.not_ready += 1,
                NodeState::Skipped(_) => c.skipped += 1,
                NodeState::Failed(_) => c.failed += 1,
                NodeState::Pending => c.pending += 1,
            }
        }
        c
    }
}

// ---------------- Composite status ----------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ComponentStatus {
    pub fn not_ready() -> Self { Self { ready: false, detail: None } }
}

/// Aggregated per-component readiness written onto a primary's `status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub components: BTreeMap<String, ComponentStatus>,
}

impl CompositeStatus {
    pub fn get(&self, component: &str) -> Option<&ComponentStatus> { self.components.get(component) }
    pub fn all_ready(&self) -> bool { self.components.values().all(|c| c.ready) }

    pub fn to_json(&self) -> Json {
        serde_json::to_value(self).unwrap_or(Json::Null)
    }
}

// ---------------- Change notifications ----------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChangeKind {
    Applied,
    Deleted,
}

/// "Something changed, re-evaluate". Consumers re-read the cache instead of trusting content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub type_key: TypeKey,
    pub namespace: Option<String>,
    pub name: String,
    pub owner: Option<PrimaryRef>,
    pub kind: ChangeKind,
}

// ---------------- Contracts ----------------

/// Producer of the desired state of one managed object for a primary.
pub trait DependentResource: Send + Sync {
    fn type_key(&self) -> TypeKey;

    /// Name of the managed object for this primary; used to look up observed state.
    fn object_name(&self, primary: &Primary) -> String;

    /// Desired object. Must be deterministic for a given primary spec.
    fn desired(&self, primary: &Primary) -> Result<DynamicObject, ApplyError>;
}

/// Side-effect free predicate used as reconcile precondition or ready postcondition.
pub trait Condition: Send + Sync {
    fn check(&self, primary: &Primary, own: &Observed, observed: &ObservedSet) -> bool;
}

impl<F> Condition for F
where
    F: Fn(&Primary, &Observed, &ObservedSet) -> bool + Send + Sync,
{
    fn check(&self, primary: &Primary, own: &Observed, observed: &ObservedSet) -> bool {
        self(primary, own, observed)
    }
}

/// Cluster API surface the engine needs.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// Idempotent create-or-update; returns the object as stored by the server.
    async fn upsert(&self, type_key: &TypeKey, object: &DynamicObject) -> Result<DynamicObject, ApplyError>;

    async fn get(&self, type_key: &TypeKey, namespace: Option<&str>, name: &str) -> Result<Observed, ApplyError>;
}

/// Full replacement of a primary's status, guarded by the primary's resourceVersion.
#[async_trait::async_trait]
pub trait StatusSink: Send + Sync {
    async fn replace(&self, primary: &Primary, status: &CompositeStatus) -> Result<(), StatusError>;
}

/// Read side of the shared per-type caches.
pub trait ObservedCache: Send + Sync {
    fn lookup(&self, type_key: &TypeKey, namespace: Option<&str>, name: &str) -> Observed;
}

/// Cache that has observed nothing; every lookup is `Absent`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyCache;

impl ObservedCache for EmptyCache {
    fn lookup(&self, _type_key: &TypeKey, _namespace: Option<&str>, _name: &str) -> Observed { Observed::Absent }
}

/// Stamp the primary's controller owner reference onto a managed object (replacing any existing one).
pub fn with_owner(mut obj: DynamicObject, primary: &Primary) -> DynamicObject {
    if let Some(owner) = primary.owner_reference() {
        let refs = obj.metadata.owner_references.get_or_insert_with(Vec::new);
        refs.retain(|o| !o.controller.unwrap_or(false));
        refs.push(owner);
    }
    obj
}

pub mod prelude {
    pub use super::{
        ApplyError, ChangeEvent, ChangeKind, ClusterClient, ComponentStatus, CompositeStatus, Condition, ConfigError,
        DependentResource, Json, NodeState, Observed, ObservedCache, ObservedSet, Primary, PrimaryRef, SkipReason,
        StatusError, StatusSink, TypeKey,
    };
}
