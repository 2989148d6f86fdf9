//! Kiln engine: one reconcile pass over a dependent graph for one primary, plus the
//! per-app controller and work queue that drive passes.
//!
//! A pass walks the graph in resolved order. Each node is gated by its own reconcile
//! precondition and by the state of its dependencies, then applied and checked against
//! its ready postcondition. Failures stay local to a node and its dependents.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use kiln_core::{with_owner, ClusterClient, NodeState, Observed, ObservedCache, ObservedSet, Primary, SkipReason};
use kiln_graph::{DependentNode, ReconcileGraph};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

pub mod config;
pub mod controller;
pub mod queue;

pub use config::{EngineConfig, RequeuePolicy};
pub use controller::{AppController, AppDefinition};
pub use queue::{QueueHandle, Reconciler, WorkQueue};

/// What the work queue should do with a primary after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Requeue {
    Done,
    /// Something applied is not ready yet; retry after a short fixed delay.
    NotReady,
    /// Something failed; retry with backoff.
    Failed,
}

impl Requeue {
    pub fn requeue(&self) -> bool { !matches!(self, Self::Done) }

    /// Failed beats NotReady beats Done. Nodes skipped by their own precondition, or
    /// below one, never force a requeue.
    pub fn from_observed(observed: &ObservedSet) -> Self {
        let mut out = Self::Done;
        for (_, n) in observed.iter() {
            match &n.state {
                NodeState::Failed(_) => return Self::Failed,
                NodeState::AppliedNotReady
                | NodeState::Skipped(SkipReason::DependencyNotReady(_))
                | NodeState::Skipped(SkipReason::DependencyFailed(_)) => out = Self::NotReady,
                _ => {}
            }
        }
        out
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::NotReady => "not-ready",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PassOutcome {
    pub observed: ObservedSet,
    pub requeue: Requeue,
}

fn skipped_by_precondition(state: Option<&NodeState>) -> bool {
    matches!(state, Some(NodeState::Skipped(SkipReason::Precondition)) | Some(NodeState::Skipped(SkipReason::DependencySkipped(_))))
}

fn failed_or_blocked_by_failure(state: Option<&NodeState>) -> bool {
    matches!(state, Some(NodeState::Failed(_)) | Some(NodeState::Skipped(SkipReason::DependencyFailed(_))))
}

fn unready_or_blocked_by_readiness(state: Option<&NodeState>) -> bool {
    matches!(state, Some(NodeState::AppliedNotReady) | Some(NodeState::Skipped(SkipReason::DependencyNotReady(_))))
}

/// Why `node` may not be attempted given the states recorded so far, if anything.
///
/// `DependencySkipped` only ever carries a precondition skip down hard edges; soft edges
/// ignore it. A dependency blocked by a failure or an unready node blocks across both
/// edge kinds with the same reason, so a blocked branch never lets a later node through.
fn dependency_gate(node: &DependentNode, observed: &ObservedSet) -> Option<SkipReason> {
    if let Some(dep) = node.hard_deps().iter().find(|d| skipped_by_precondition(observed.state(d))) {
        return Some(SkipReason::DependencySkipped(dep.clone()));
    }
    let deps = || node.hard_deps().iter().chain(node.soft_deps().iter());
    if let Some(dep) = deps().find(|d| failed_or_blocked_by_failure(observed.state(d))) {
        return Some(SkipReason::DependencyFailed(dep.clone()));
    }
    if let Some(dep) = deps().find(|d| unready_or_blocked_by_readiness(observed.state(d))) {
        return Some(SkipReason::DependencyNotReady(dep.clone()));
    }
    None
}

/// Runs reconcile passes against a cluster.
#[derive(Clone)]
pub struct Engine {
    client: Arc<dyn ClusterClient>,
    apply_timeout: Duration,
}

impl Engine {
    pub fn new(client: Arc<dyn ClusterClient>, apply_timeout: Duration) -> Self { Self { client, apply_timeout } }

    pub fn client(&self) -> &Arc<dyn ClusterClient> { &self.client }
    pub fn apply_timeout(&self) -> Duration { self.apply_timeout }

    /// One pass over `graph` for `primary`. Never fails as a whole; per-node failures are
    /// recorded in the returned set and reflected in `requeue`.
    pub async fn reconcile(&self, primary: &Primary, graph: &ReconcileGraph, cache: &dyn ObservedCache) -> PassOutcome {
        let t0 = Instant::now();
        let mut observed = ObservedSet::new();
        for node in graph.nodes() {
            let name = node.dependent().object_name(primary);
            observed.seed(node.name(), cache.lookup(&node.type_key(), primary.namespace(), &name));
        }

        for node in graph.ordered() {
            let state = self.reconcile_node(primary, node, &mut observed).await;
            debug!(node = %node.name(), primary = %primary.reference, state = %state, "node decided");
            if state.is_skipped() {
                counter!("engine_node_skipped", 1u64);
            }
            observed.set_state(node.name(), state);
        }

        let requeue = Requeue::from_observed(&observed);
        let c = observed.counts();
        let elapsed_ms = t0.elapsed().as_secs_f64() * 1000.0;
        counter!("engine_pass_total", 1u64, "result" => requeue.as_str());
        histogram!("engine_pass_ms", elapsed_ms);
        info!(
            primary = %primary.reference,
            ready = c.ready,
            not_ready = c.not_ready,
            skipped = c.skipped,
            failed = c.failed,
            result = requeue.as_str(),
            elapsed_ms = elapsed_ms as u64,
            "pass finished"
        );
        PassOutcome { observed, requeue }
    }

    async fn reconcile_node(&self, primary: &Primary, node: &DependentNode, observed: &mut ObservedSet) -> NodeState {
        if let Some(pre) = node.precondition() {
            if !pre.check(primary, observed.object(node.name()), &*observed) {
                return NodeState::Skipped(SkipReason::Precondition);
            }
        }
        if let Some(reason) = dependency_gate(node, observed) {
            return NodeState::Skipped(reason);
        }

        let type_key = node.type_key();
        let desired = match node.dependent().desired(primary) {
            Ok(d) => with_owner(d, primary),
            Err(e) => {
                counter!("engine_apply_err", 1u64);
                warn!(node = %node.name(), primary = %primary.reference, error = %e, "desired state failed");
                return NodeState::Failed(e.to_string());
            }
        };
        let applied = match tokio::time::timeout(self.apply_timeout, self.client.upsert(&type_key, &desired)).await {
            Ok(Ok(obj)) => obj,
            Ok(Err(e)) => {
                counter!("engine_apply_err", 1u64);
                warn!(node = %node.name(), primary = %primary.reference, gvk = %type_key, error = %e, "apply failed");
                return NodeState::Failed(e.to_string());
            }
            Err(_) => {
                let e = kiln_core::ApplyError::Timeout(self.apply_timeout);
                counter!("engine_apply_err", 1u64);
                warn!(node = %node.name(), primary = %primary.reference, gvk = %type_key, error = %e, "apply timed out");
                return NodeState::Failed(e.to_string());
            }
        };
        counter!("engine_apply_ok", 1u64);

        let own = Observed::present(applied);
        let ready = match node.postcondition() {
            Some(post) => post.check(primary, &own, &*observed),
            None => true,
        };
        let state = if ready { NodeState::AppliedReady } else { NodeState::AppliedNotReady };
        observed.record(node.name(), state.clone(), own);
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(states: &[(&str, NodeState)]) -> ObservedSet {
        let mut s = ObservedSet::new();
        for (n, st) in states {
            s.record(n, st.clone(), Observed::Absent);
        }
        s
    }

    #[test]
    fn requeue_priority() {
        assert_eq!(Requeue::from_observed(&set(&[("a", NodeState::AppliedReady)])), Requeue::Done);
        assert_eq!(
            Requeue::from_observed(&set(&[("a", NodeState::AppliedNotReady), ("b", NodeState::Failed("x".into()))])),
            Requeue::Failed
        );
        assert_eq!(
            Requeue::from_observed(&set(&[("a", NodeState::Skipped(SkipReason::DependencyNotReady("b".into())))])),
            Requeue::NotReady
        );
    }

    #[test]
    fn precondition_skips_do_not_requeue() {
        let s = set(&[
            ("bucket", NodeState::Skipped(SkipReason::Precondition)),
            ("backup", NodeState::Skipped(SkipReason::DependencySkipped("bucket".into()))),
            ("api", NodeState::AppliedReady),
        ]);
        assert_eq!(Requeue::from_observed(&s), Requeue::Done);
        assert!(!Requeue::Done.requeue());
        assert!(Requeue::NotReady.requeue());
    }
}
