#![forbid(unsafe_code)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{cm_type, primary, status_ready};
use kiln_apply::MemoryCluster;
use kiln_core::{ApplyError, DependentResource, EmptyCache, NodeState, Primary, SkipReason, TypeKey};
use kiln_engine::{Engine, Requeue};
use kiln_graph::{DependentNode, ReconcileGraph};
use kube::core::DynamicObject;
use proptest::prelude::*;

struct Named(String);

impl DependentResource for Named {
    fn type_key(&self) -> TypeKey { cm_type() }
    fn object_name(&self, primary: &Primary) -> String { format!("{}-{}", primary.name(), self.0) }
    fn desired(&self, primary: &Primary) -> Result<DynamicObject, ApplyError> {
        Ok(cm_type().object(primary.namespace(), &self.object_name(primary), serde_json::json!({})))
    }
}

#[derive(Debug, Clone)]
struct Case {
    /// (dependency index, hard) per node; dependencies always point at earlier nodes
    deps: Vec<Vec<(usize, bool)>>,
    ready: Vec<bool>,
    failing: Vec<bool>,
}

fn case() -> impl Strategy<Value = Case> {
    (2usize..8).prop_flat_map(|n| {
        let deps = (0..n)
            .map(|i| prop::collection::vec((0..i.max(1), any::<bool>()), 0..=i.min(3)))
            .collect::<Vec<_>>();
        (deps, prop::collection::vec(any::<bool>(), n), prop::collection::vec(prop::bool::weighted(0.2), n))
    })
    .prop_map(|(deps, ready, failing)| {
        // node 0 cannot depend on anything
        let deps = deps
            .into_iter()
            .enumerate()
            .map(|(i, mut d)| {
                d.retain(|(j, _)| *j < i);
                d.sort();
                d.dedup_by_key(|(j, _)| *j);
                d
            })
            .collect();
        Case { deps, ready, failing }
    })
}

fn name(i: usize) -> String { format!("n{}", i) }

fn run(case: &Case) -> (Arc<MemoryCluster>, kiln_engine::PassOutcome) {
    let cluster = Arc::new(MemoryCluster::new());
    let mut b = ReconcileGraph::builder();
    for (i, deps) in case.deps.iter().enumerate() {
        if case.ready[i] {
            cluster.set_server_status(&format!("p-{}", name(i)), serde_json::json!({ "ready": true }));
        }
        if case.failing[i] {
            cluster.fail_apply(&format!("p-{}", name(i)), "boom");
        }
        let hard: Vec<String> = deps.iter().filter(|(_, h)| *h).map(|(j, _)| name(*j)).collect();
        let soft: Vec<String> = deps.iter().filter(|(_, h)| !*h).map(|(j, _)| name(*j)).collect();
        b = b.node(DependentNode::new(&name(i), Named(name(i))).depends_on(hard).after(soft).ready_when(status_ready));
    }
    let g = b.build().expect("acyclic by construction");
    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    let out = rt.block_on(Engine::new(cluster.clone(), Duration::from_secs(5)).reconcile(&primary("p"), &g, &EmptyCache));
    (cluster, out)
}

proptest! {
    #[test]
    fn nothing_is_applied_past_an_unready_dependency(case in case()) {
        let (cluster, out) = run(&case);
        for (i, deps) in case.deps.iter().enumerate() {
            let attempted = cluster.apply_count(&format!("p-{}", name(i))) > 0 || out.observed.state(&name(i)).unwrap().is_failed();
            if !attempted { continue; }
            for (j, hard) in deps {
                let dep = out.observed.state(&name(*j)).unwrap();
                if *hard {
                    prop_assert_eq!(dep, &NodeState::AppliedReady);
                } else {
                    let precondition_rooted = matches!(
                        dep,
                        NodeState::Skipped(SkipReason::Precondition) | NodeState::Skipped(SkipReason::DependencySkipped(_))
                    );
                    prop_assert!(dep.is_ready() || precondition_rooted, "soft dep {} in state {}", name(*j), dep);
                }
            }
        }
    }

    #[test]
    fn every_node_reaches_a_terminal_state(case in case()) {
        let (_, out) = run(&case);
        prop_assert_eq!(out.observed.counts().pending, 0);
        prop_assert_eq!(out.observed.len(), case.deps.len());
        let any_failed = out.observed.iter().any(|(_, n)| n.state.is_failed());
        prop_assert_eq!(out.requeue == Requeue::Failed, any_failed);
    }
}
