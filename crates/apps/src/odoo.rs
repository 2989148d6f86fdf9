//! Odoo: ERP on Postgres with an optional Velero backup schedule.

use kiln_core::{ConfigError, Primary};
use kiln_engine::AppDefinition;
use kiln_graph::{DependentNode, ReconcileGraph};
use kiln_status::StatusAggregator;

use crate::common::*;

pub const KIND: &str = "Odoo";
const APP: &str = "odoo";
const DEFAULT_VERSION: &str = "16.0";

fn generic(p: &Primary) -> String { format!("{}-{}", APP, p.name()) }
fn db(p: &Primary) -> String { format!("{}-db", generic(p)) }

pub fn definition() -> Result<AppDefinition, ConfigError> {
    let graph = ReconcileGraph::builder()
        .node(
            DependentNode::new(
                "postgres-cluster",
                Resource::new(postgres_cluster(), APP, "database", db, |_p: &Primary| Ok(postgres_cluster_body(APP, "10Gi", None))),
            )
            .ready_when(postgres_ready),
        )
        .node(
            DependentNode::new(
                "deployment",
                Resource::new(deployment(), APP, APP, generic, |p: &Primary| {
                    let mut c = Container::new(APP, format!("odoo:{}", version_or(p, DEFAULT_VERSION)));
                    c.port = Some(8069);
                    c.env = env(&[("HOST", format!("{}-rw", db(p))), ("PORT", "5432".into())]);
                    Ok(deployment_body(selector(APP, p.name(), APP), 1, &[c]))
                }),
            )
            .depends_on(["postgres-cluster"])
            .ready_when(deployment_ready),
        )
        .node(DependentNode::new(
            "service",
            Resource::new(service(), APP, APP, generic, |p: &Primary| Ok(service_body(selector(APP, p.name(), APP), 8069, 8069))),
        ))
        .node(
            DependentNode::new(
                "ingress",
                Resource::new(ingress(), APP, APP, generic, |p: &Primary| {
                    Ok(ingress_body(&host(p)?, &generic(p), 8069, &format!("{}-tls", generic(p))))
                }),
            )
            .depends_on(["service"]),
        )
        .node(
            DependentNode::new(
                "backup-schedule",
                Resource::new(velero_schedule(), APP, "backup", generic, |p: &Primary| {
                    let b = backups(p)?;
                    let ns = p.namespace().unwrap_or("default");
                    Ok(velero_schedule_body(ns, &b.schedule, &b.ttl, "default", selector(APP, p.name(), APP)))
                }),
            )
            .reconcile_when(backups_enabled),
        )
        .build()?;

    let status = StatusAggregator::new()
        .component_with_detail("odoo", "deployment", replica_detail)
        .component("database", "postgres-cluster");
    Ok(AppDefinition::new(APP, primary_type(KIND), graph, status))
}
