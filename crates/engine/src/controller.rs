//! Per-app controller: fresh primary read, engine pass, status aggregation and write-back.

use std::sync::Arc;

use kiln_core::{ApplyError, Observed, Primary, PrimaryRef, StatusError, StatusSink, TypeKey};
use kiln_graph::ReconcileGraph;
use kiln_status::StatusAggregator;
use kiln_store::Multiplexer;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::queue::Reconciler;
use crate::{Engine, PassOutcome, Requeue};

/// Everything needed to reconcile one kind of application.
#[derive(Debug, Clone)]
pub struct AppDefinition {
    pub name: String,
    pub primary_type: TypeKey,
    pub graph: Arc<ReconcileGraph>,
    pub status: StatusAggregator,
}

impl AppDefinition {
    pub fn new(name: &str, primary_type: TypeKey, graph: ReconcileGraph, status: StatusAggregator) -> Self {
        Self { name: name.to_string(), primary_type, graph: Arc::new(graph), status }
    }
}

pub struct AppController {
    app: Arc<AppDefinition>,
    engine: Engine,
    cache: Multiplexer,
    status: Arc<dyn StatusSink>,
    conflict_retries: u32,
}

impl AppController {
    pub fn new(
        app: Arc<AppDefinition>,
        engine: Engine,
        cache: Multiplexer,
        status: Arc<dyn StatusSink>,
        conflict_retries: u32,
    ) -> Self {
        Self { app, engine, cache, status, conflict_retries }
    }

    pub fn app(&self) -> &AppDefinition { &self.app }

    async fn read(&self, r: &PrimaryRef) -> Result<Option<Primary>, ApplyError> {
        match self.engine.client().get(&self.app.primary_type, r.namespace.as_deref(), &r.name).await? {
            Observed::Present(o) => Primary::from_dynamic(&self.app.primary_type, &o).map(Some),
            Observed::Absent => Ok(None),
        }
    }

    async fn forget(&self, r: &PrimaryRef) {
        let evicted = self.cache.evict_owner(r).await;
        info!(app = %self.app.name, primary = %r, evicted, "primary gone; cache entries evicted");
    }

    /// Run one pass for `r` and write its status. Returns the pass outcome when a pass ran.
    pub async fn run_once(&self, r: &PrimaryRef) -> (Requeue, Option<PassOutcome>) {
        let mut primary = match self.read(r).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                self.forget(r).await;
                return (Requeue::Done, None);
            }
            Err(e) => {
                warn!(app = %self.app.name, primary = %r, error = %e, "reading primary failed");
                return (Requeue::Failed, None);
            }
        };

        let pass = self.engine.reconcile(&primary, &self.app.graph, &self.cache).await;
        let mut status = self.app.status.aggregate(&pass.observed);
        status.observed_generation = primary.generation;

        let mut conflicts = 0u32;
        let requeue = loop {
            match self.status.replace(&primary, &status).await {
                Ok(()) => break pass.requeue,
                Err(StatusError::Conflict(msg)) if conflicts < self.conflict_retries => {
                    conflicts += 1;
                    counter!("status_conflict_retry", 1u64);
                    debug!(primary = %r, attempt = conflicts, reason = %msg, "status conflict; re-reading primary");
                    match self.read(r).await {
                        Ok(Some(fresh)) => primary.resource_version = fresh.resource_version,
                        Ok(None) => {
                            self.forget(r).await;
                            break Requeue::Done;
                        }
                        Err(e) => {
                            warn!(primary = %r, error = %e, "re-reading primary failed");
                            break Requeue::Failed;
                        }
                    }
                }
                Err(e) => {
                    warn!(app = %self.app.name, primary = %r, error = %e, conflicts, "status write failed");
                    break Requeue::Failed;
                }
            }
        };
        (requeue, Some(pass))
    }
}

#[async_trait::async_trait]
impl Reconciler for AppController {
    async fn reconcile(&self, primary: &PrimaryRef) -> Requeue { self.run_once(primary).await.0 }
}
