//! Vault: HashiCorp Vault with a Postgres storage backend and an optional Velero
//! backup storage location.

use kiln_core::{ConfigError, Primary};
use kiln_engine::AppDefinition;
use kiln_graph::{DependentNode, ReconcileGraph};
use kiln_status::StatusAggregator;

use crate::common::*;

pub const KIND: &str = "Vault";
const APP: &str = "vault";
const DEFAULT_VERSION: &str = "1.14.1";

fn generic(p: &Primary) -> String { format!("{}-{}", APP, p.name()) }
fn db(p: &Primary) -> String { format!("{}-db", generic(p)) }
fn config(p: &Primary) -> String { format!("{}-config", generic(p)) }

fn vault_hcl(p: &Primary) -> String {
    format!(
        "ui = true\nlistener \"tcp\" {{\n  address = \"0.0.0.0:8200\"\n  tls_disable = 1\n}}\nstorage \"postgresql\" {{\n  connection_url = \"postgres://{}-rw:5432/{}\"\n  ha_enabled = true\n}}\n",
        db(p),
        APP
    )
}

pub fn definition() -> Result<AppDefinition, ConfigError> {
    let graph = ReconcileGraph::builder()
        .node(
            DependentNode::new(
                "postgres-cluster",
                Resource::new(postgres_cluster(), APP, "database", db, |_p: &Primary| Ok(postgres_cluster_body(APP, "5Gi", None))),
            )
            .ready_when(postgres_ready),
        )
        .node(DependentNode::new(
            "config",
            Resource::new(config_map(), APP, APP, config, |p: &Primary| Ok(config_map_body(&[("vault.hcl", vault_hcl(p))]))),
        ))
        .node(
            DependentNode::new(
                "deployment",
                Resource::new(deployment(), APP, APP, generic, |p: &Primary| {
                    let mut c = Container::new(APP, format!("hashicorp/vault:{}", version_or(p, DEFAULT_VERSION)));
                    c.port = Some(8200);
                    c.args = vec!["server".into(), "-config=/vault/config/vault.hcl".into()];
                    c.env = env(&[("VAULT_API_ADDR", format!("https://{}", host(p)?))]);
                    Ok(deployment_body(selector(APP, p.name(), APP), 1, &[c]))
                }),
            )
            .depends_on(["postgres-cluster", "config"])
            .ready_when(deployment_ready),
        )
        .node(DependentNode::new(
            "service",
            Resource::new(service(), APP, APP, generic, |p: &Primary| Ok(service_body(selector(APP, p.name(), APP), 8200, 8200))),
        ))
        .node(
            DependentNode::new(
                "ingress",
                Resource::new(ingress(), APP, APP, generic, |p: &Primary| {
                    Ok(ingress_body(&host(p)?, &generic(p), 8200, &format!("{}-tls", generic(p))))
                }),
            )
            .depends_on(["service"]),
        )
        .node(
            DependentNode::new(
                "backup-storage-location",
                Resource::new(velero_location(), APP, "backup", generic, |p: &Primary| {
                    Ok(velero_location_body(&format!("{}-backup", generic(p)), APP))
                }),
            )
            .reconcile_when(backups_enabled),
        )
        .build()?;

    let status = StatusAggregator::new()
        .component_with_detail("vault", "deployment", replica_detail)
        .component("database", "postgres-cluster");
    Ok(AppDefinition::new(APP, primary_type(KIND), graph, status))
}
