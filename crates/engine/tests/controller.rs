#![forbid(unsafe_code)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use kiln_apply::MemoryCluster;
use kiln_core::{ObservedCache, PrimaryRef};
use kiln_engine::{AppController, AppDefinition, Engine, Requeue, RequeuePolicy, WorkQueue};
use kiln_graph::{DependentNode, ReconcileGraph};
use kiln_status::StatusAggregator;
use kiln_store::{Delta, Multiplexer};

fn app() -> Arc<AppDefinition> {
    let graph = ReconcileGraph::builder()
        .node(DependentNode::new("config", Cm("config")))
        .node(DependentNode::new("api", Cm("api")).depends_on(["config"]))
        .build()
        .unwrap();
    let status = StatusAggregator::new().component("config", "config").component("api", "api");
    Arc::new(AppDefinition::new("plane", plane_type(), graph, status))
}

fn controller(cluster: &Arc<MemoryCluster>, mux: &Multiplexer, retries: u32) -> AppController {
    AppController::new(app(), Engine::new(cluster.clone(), Duration::from_secs(5)), mux.clone(), cluster.clone(), retries)
}

fn p1() -> PrimaryRef { PrimaryRef::new("Plane", Some("apps"), "p1") }

#[tokio::test]
async fn pass_writes_status_with_observed_generation() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.insert(&plane_type(), primary_object("p1"));
    let mux = Multiplexer::new(64);
    let (requeue, pass) = controller(&cluster, &mux, 3).run_once(&p1()).await;
    assert_eq!(requeue, Requeue::Done);
    assert_eq!(pass.unwrap().observed.counts().ready, 2);

    let st = cluster.status_of(&p1()).unwrap();
    assert_eq!(st.observed_generation, Some(3));
    assert!(st.all_ready());
    assert_eq!(st.components.len(), 2);
    let stored = cluster.object(&plane_type(), Some("apps"), "p1").unwrap();
    assert_eq!(stored.data["status"]["observedGeneration"], 3);
    assert_eq!(stored.data["status"]["components"]["api"]["ready"], true);
}

#[tokio::test]
async fn status_conflicts_are_retried_with_a_fresh_read() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.insert(&plane_type(), primary_object("p1"));
    cluster.conflict_next_status_writes(2);
    let mux = Multiplexer::new(64);
    let (requeue, _) = controller(&cluster, &mux, 3).run_once(&p1()).await;
    assert_eq!(requeue, Requeue::Done);
    assert_eq!(cluster.status_writes(), 3);
    assert!(cluster.status_of(&p1()).is_some());
}

#[tokio::test]
async fn exhausted_conflict_retries_fail_the_pass() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.insert(&plane_type(), primary_object("p1"));
    cluster.conflict_next_status_writes(5);
    let mux = Multiplexer::new(64);
    let (requeue, _) = controller(&cluster, &mux, 1).run_once(&p1()).await;
    assert_eq!(requeue, Requeue::Failed);
    assert_eq!(cluster.status_writes(), 2);
    assert!(cluster.status_of(&p1()).is_none());
}

#[tokio::test]
async fn missing_primary_evicts_cached_dependents() {
    let cluster = Arc::new(MemoryCluster::new());
    let mux = Multiplexer::new(64);
    let h = mux.register(&cm_type());

    cluster.insert(&plane_type(), primary_object("p1"));
    let c = controller(&cluster, &mux, 3);
    c.run_once(&p1()).await;
    let leftover = cluster.object(&cm_type(), Some("apps"), "p1-config").unwrap();
    h.sender().send(Delta::applied(leftover).unwrap()).await.unwrap();
    let cached = async {
        while !mux.lookup(&cm_type(), Some("apps"), "p1-config").is_present() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), cached).await.unwrap();

    assert!(cluster.remove(&plane_type(), Some("apps"), "p1"));
    let applies = cluster.applied().len();
    let (requeue, pass) = c.run_once(&p1()).await;
    assert_eq!(requeue, Requeue::Done);
    assert!(pass.is_none());
    assert_eq!(cluster.applied().len(), applies);
    let gone = async {
        while mux.lookup(&cm_type(), Some("apps"), "p1-config").is_present() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), gone).await.unwrap();
}

#[tokio::test]
async fn queue_drives_controller_from_triggers() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.insert(&plane_type(), primary_object("p1"));
    cluster.insert(&plane_type(), primary_object("p2"));
    let mux = Multiplexer::new(64);
    let q = WorkQueue::spawn(Arc::new(controller(&cluster, &mux, 3)), RequeuePolicy::default(), 2, 16);
    q.trigger(p1()).await;
    q.trigger(PrimaryRef::new("Plane", Some("apps"), "p2")).await;
    let written = async {
        while cluster.status_of(&p1()).is_none() || cluster.status_of(&PrimaryRef::new("Plane", Some("apps"), "p2")).is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), written).await.unwrap();
    q.shutdown().await;
}
