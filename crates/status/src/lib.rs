//! Kiln status: fold one pass's observations into the composite status of a primary.
//!
//! Aggregation is a pure function of an [`ObservedSet`], so every component in a single
//! status write comes from the same pass.

#![forbid(unsafe_code)]

use std::sync::Arc;

use kiln_core::{ComponentStatus, CompositeStatus, NodeState, ObservedSet};
use kube::core::DynamicObject;

/// Maps a ready object to optional detail text (e.g. replica counts).
pub type DetailFn = Arc<dyn Fn(&DynamicObject) -> Option<String> + Send + Sync>;

#[derive(Clone)]
struct Binding {
    component: String,
    node: String,
    detail: Option<DetailFn>,
}

/// Which nodes show up in the primary's status, and under which component name.
#[derive(Clone, Default)]
pub struct StatusAggregator {
    bindings: Vec<Binding>,
}

impl std::fmt::Debug for StatusAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.bindings.iter().map(|b| (&b.component, &b.node))).finish()
    }
}

impl StatusAggregator {
    pub fn new() -> Self { Self::default() }

    pub fn component(mut self, component: &str, node: &str) -> Self {
        self.bindings.push(Binding { component: component.to_string(), node: node.to_string(), detail: None });
        self
    }

    pub fn component_with_detail<F>(mut self, component: &str, node: &str, detail: F) -> Self
    where
        F: Fn(&DynamicObject) -> Option<String> + Send + Sync + 'static,
    {
        self.bindings.push(Binding {
            component: component.to_string(),
            node: node.to_string(),
            detail: Some(Arc::new(detail)),
        });
        self
    }

    /// Node names referenced by this aggregator, in binding order.
    pub fn nodes(&self) -> impl Iterator<Item = &str> { self.bindings.iter().map(|b| b.node.as_str()) }

    pub fn aggregate(&self, observed: &ObservedSet) -> CompositeStatus {
        let mut out = CompositeStatus::default();
        for b in &self.bindings {
            out.components.insert(b.component.clone(), component_status(b.node.as_str(), b.detail.as_ref(), observed));
        }
        out
    }
}

/// Aggregate with component name == node name and no detail extractors.
pub fn aggregate_selected<'a, I>(selected: I, observed: &ObservedSet) -> CompositeStatus
where
    I: IntoIterator<Item = &'a str>,
{
    let mut out = CompositeStatus::default();
    for node in selected {
        out.components.insert(node.to_string(), component_status(node, None, observed));
    }
    out
}

fn component_status(node: &str, detail: Option<&DetailFn>, observed: &ObservedSet) -> ComponentStatus {
    let Some(obs) = observed.get(node) else { return ComponentStatus::not_ready() };
    match &obs.state {
        NodeState::AppliedReady => ComponentStatus {
            ready: true,
            detail: detail.and_then(|f| obs.object.object().and_then(|o| f(o))),
        },
        NodeState::AppliedNotReady => ComponentStatus { ready: false, detail: Some("not ready".to_string()) },
        NodeState::Failed(msg) => ComponentStatus { ready: false, detail: Some(format!("failed: {}", msg)) },
        // Skipped or never reached: not ready, and deliberately without detail.
        NodeState::Skipped(_) | NodeState::Pending => ComponentStatus::not_ready(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{Observed, SkipReason, TypeKey};

    fn deployment(ready: i64) -> Observed {
        Observed::present(TypeKey::new("apps", "v1", "Deployment").object(
            Some("ns"),
            "api",
            serde_json::json!({ "status": { "readyReplicas": ready } }),
        ))
    }

    fn set() -> ObservedSet {
        let mut s = ObservedSet::new();
        s.record("db", NodeState::AppliedReady, deployment(1));
        s.record("cache", NodeState::AppliedNotReady, deployment(0));
        s.record("api", NodeState::Failed("boom".into()), Observed::Absent);
        s.record("backup", NodeState::Skipped(SkipReason::Precondition), deployment(1));
        s
    }

    #[test]
    fn maps_every_state() {
        let st = aggregate_selected(["db", "cache", "api", "backup", "never"], &set());
        assert_eq!(st.get("db"), Some(&ComponentStatus { ready: true, detail: None }));
        assert_eq!(st.get("cache").unwrap().detail.as_deref(), Some("not ready"));
        assert_eq!(st.get("api").unwrap().detail.as_deref(), Some("failed: boom"));
        assert_eq!(st.get("backup"), Some(&ComponentStatus::not_ready()));
        assert_eq!(st.get("never"), Some(&ComponentStatus::not_ready()));
        assert!(!st.all_ready());
    }

    #[test]
    fn skipped_node_is_not_ready_even_if_cached_object_exists() {
        let st = StatusAggregator::new().component("backups", "backup").aggregate(&set());
        assert_eq!(st.get("backups"), Some(&ComponentStatus::not_ready()));
    }

    #[test]
    fn detail_extractor_runs_for_ready_nodes_only() {
        let agg = StatusAggregator::new()
            .component_with_detail("database", "db", |o| {
                o.data.pointer("/status/readyReplicas").map(|v| format!("{} ready", v))
            })
            .component_with_detail("cache", "cache", |_| Some("unused".into()));
        let st = agg.aggregate(&set());
        assert_eq!(st.get("database").unwrap().detail.as_deref(), Some("1 ready"));
        assert_eq!(st.get("cache").unwrap().detail.as_deref(), Some("not ready"));
        assert_eq!(agg.nodes().collect::<Vec<_>>(), vec!["db", "cache"]);
    }

    #[test]
    fn aggregation_is_pure() {
        let agg = StatusAggregator::new().component("db", "db").component("api", "api");
        let s = set();
        assert_eq!(agg.aggregate(&s), agg.aggregate(&s));
    }
}
