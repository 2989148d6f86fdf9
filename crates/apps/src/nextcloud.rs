//! Nextcloud: PHP-FPM app on Postgres and Redis, optional Collabora office and Velero backups.

use kiln_core::{ConfigError, Json, Primary};
use kiln_engine::AppDefinition;
use kiln_graph::{DependentNode, ReconcileGraph};
use kiln_status::StatusAggregator;

use crate::common::*;

pub const KIND: &str = "Nextcloud";
const APP: &str = "nextcloud";
const OFFICE: &str = "collabora";
const DEFAULT_VERSION: &str = "27.0.1";

fn generic(p: &Primary) -> String { format!("{}-{}", APP, p.name()) }
fn redis(p: &Primary) -> String { format!("{}-redis", generic(p)) }
fn db(p: &Primary) -> String { format!("{}-db", generic(p)) }
fn config(p: &Primary) -> String { format!("{}-config", generic(p)) }
fn office(p: &Primary) -> String { format!("{}-{}", generic(p), OFFICE) }

fn office_version(p: &Primary) -> String {
    p.spec_field("/apps/office/version").and_then(Json::as_str).unwrap_or("23.05.3.1.1").to_string()
}

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
                "redis-deployment",
                Resource::new(deployment(), APP, "redis", redis, |p: &Primary| {
                    let mut c = Container::new("redis", "redis:7.0-alpine");
                    c.port = Some(6379);
                    Ok(deployment_body(selector(APP, p.name(), "redis"), 1, &[c]))
                }),
            )
            .ready_when(deployment_ready),
        )
        .node(DependentNode::new(
            "redis-service",
            Resource::new(service(), APP, "redis", redis, |p: &Primary| Ok(service_body(selector(APP, p.name(), "redis"), 6379, 6379))),
        ))
        .node(DependentNode::new(
            "config",
            Resource::new(config_map(), APP, APP, config, |p: &Primary| {
                Ok(config_map_body(&[
                    ("REDIS_HOST", redis(p)),
                    ("POSTGRES_HOST", format!("{}-rw", db(p))),
                    ("POSTGRES_DB", APP.to_string()),
                    ("NEXTCLOUD_TRUSTED_DOMAINS", host(p)?),
                ]))
            }),
        ))
        .node(
            DependentNode::new(
                "app-deployment",
                Resource::new(deployment(), APP, APP, generic, |p: &Primary| {
                    let mut c = Container::new(APP, format!("{}:{}-fpm", APP, version_or(p, DEFAULT_VERSION)));
                    c.port = Some(9000);
                    c.env_from = env_from_config_maps(&[config(p)]);
                    Ok(deployment_body(selector(APP, p.name(), APP), 1, &[c]))
                }),
            )
            .depends_on(["postgres-cluster", "redis-deployment", "config"])
            .ready_when(deployment_ready),
        )
        .node(DependentNode::new(
            "service",
            Resource::new(service(), APP, APP, generic, |p: &Primary| Ok(service_body(selector(APP, p.name(), APP), 80, 9000))),
        ))
        .node(
            DependentNode::new(
                "ingress",
                Resource::new(ingress(), APP, APP, generic, |p: &Primary| {
                    Ok(ingress_body(&host(p)?, &generic(p), 80, &format!("{}-tls", generic(p))))
                }),
            )
            .depends_on(["service"]),
        )
        .node(
            DependentNode::new(
                "office-deployment",
                Resource::new(deployment(), APP, OFFICE, office, |p: &Primary| {
                    let mut c = Container::new(OFFICE, format!("{}/code:{}", OFFICE, office_version(p)));
                    c.port = Some(9980);
                    c.env = env(&[("aliasgroup1", format!("https://{}", host(p)?))]);
                    Ok(deployment_body(selector(APP, p.name(), OFFICE), 1, &[c]))
                }),
            )
            .reconcile_when(office_enabled)
            .ready_when(deployment_ready),
        )
        .node(
            DependentNode::new(
                "office-service",
                Resource::new(service(), APP, OFFICE, office, |p: &Primary| {
                    Ok(service_body(selector(APP, p.name(), OFFICE), 9980, 9980))
                }),
            )
            .depends_on(["office-deployment"]),
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
        .component_with_detail("nextcloud", "app-deployment", replica_detail)
        .component("database", "postgres-cluster")
        .component("redis", "redis-deployment")
        .component("office", "office-deployment");
    Ok(AppDefinition::new(APP, primary_type(KIND), graph, status))
}
