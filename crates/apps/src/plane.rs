//! Plane: frontend, space, API and workers on Postgres and Redis, with optional
//! database backups into a MinIO bucket.

use kiln_core::{ApplyError, ConfigError, Primary};
use kiln_engine::AppDefinition;
use kiln_graph::{DependentNode, ReconcileGraph};
use kiln_status::StatusAggregator;

use crate::common::*;

pub const KIND: &str = "Plane";
const APP: &str = "plane";
const DEFAULT_VERSION: &str = "v0.13.2-dev";
const REDIS_IMAGE: &str = "redis:7.0-alpine";

fn generic(p: &Primary) -> String { format!("{}-{}", APP, p.name()) }
fn named(suffix: &'static str) -> impl Fn(&Primary) -> String + Send + Sync + 'static {
    move |p: &Primary| format!("{}-{}", generic(p), suffix)
}
fn db_cluster(p: &Primary) -> String { format!("{}-db", generic(p)) }
fn bucket(p: &Primary) -> String { format!("{}-backup", db_cluster(p)) }
fn image(component: &str, p: &Primary) -> String {
    format!("makeplane/plane-{}:{}", component, version_or(p, DEFAULT_VERSION))
}

type ConfigData = fn(&Primary) -> Result<Vec<(&'static str, String)>, ApplyError>;

fn config_map(component: &'static str, data: ConfigData) -> DependentNode {
    DependentNode::new(
        &format!("{}-configmap", component),
        Resource::new(super::common::config_map(), APP, component, named(component), move |p: &Primary| {
            Ok(config_map_body(&data(p)?))
        }),
    )
}

fn service(component: &'static str, port: u16) -> DependentNode {
    DependentNode::new(
        &format!("{}-service", component),
        Resource::new(super::common::service(), APP, component, named(component), move |p: &Primary| {
            Ok(service_body(selector(APP, p.name(), component), port, port))
        }),
    )
}

/// Deployment running the `plane-<image>` image with config maps (and the backend secret) as env.
fn app_deployment(
    component: &'static str,
    image_name: &'static str,
    port: Option<u16>,
    env_maps: &'static [&'static str],
    with_secret: bool,
    args: &'static [&'static str],
) -> DependentNode {
    DependentNode::new(
        &format!("{}-deployment", component),
        Resource::new(deployment(), APP, component, named(component), move |p: &Primary| {
            let mut c = Container::new(component, image(image_name, p));
            c.port = port;
            c.args = args.iter().map(|a| a.to_string()).collect();
            let maps: Vec<String> = env_maps.iter().map(|m| named(*m)(p)).collect();
            let mut from = env_from_config_maps(&maps);
            if with_secret {
                if let (Some(arr), Some(extra)) = (from.as_array_mut(), env_from_secret(&named("backend")(p)).as_array()) {
                    arr.extend(extra.iter().cloned());
                }
            }
            c.env_from = from;
            Ok(deployment_body(selector(APP, p.name(), component), 1, &[c]))
        }),
    )
    .ready_when(deployment_ready)
}

/// The backend secret is derived from `seed`; without one that node fails to produce.
pub fn definition(seed: Option<SecretSeed>) -> Result<AppDefinition, ConfigError> {
    let graph = ReconcileGraph::builder()
        .node(DependentNode::new(
            "ingress",
            Resource::new(ingress(), APP, "frontend", generic, |p: &Primary| {
                Ok(ingress_body(&host(p)?, &named("frontend")(p), 3000, &format!("{}-tls", generic(p))))
            }),
        ))
        .node(DependentNode::new(
            "backend-secret",
            Resource::new(secret(), APP, "backend", named("backend"), move |p: &Primary| {
                Ok(secret_body(&[("SECRET_KEY", derived_secret(p, seed.as_ref(), "secret-key")?)]))
            }),
        ))
        .node(
            DependentNode::new(
                "postgres-minio-bucket",
                Resource::new(minio_bucket(), APP, "database", bucket, |_p: &Primary| Ok(minio_bucket_body())),
            )
            .reconcile_when(backups_enabled),
        )
        .node(
            DependentNode::new(
                "postgres-cluster",
                Resource::new(postgres_cluster(), APP, "database", db_cluster, |p: &Primary| {
                    let b = p.spec_field("/backups").map(|_| bucket(p));
                    Ok(postgres_cluster_body(APP, "20Gi", b.as_deref()))
                }),
            )
            .ready_when(postgres_ready),
        )
        .node(
            DependentNode::new(
                "postgres-backup",
                Resource::new(postgres_backup(), APP, "database", db_cluster, |p: &Primary| {
                    Ok(postgres_backup_body(&db_cluster(p), &backups(p)?.schedule))
                }),
            )
            .depends_on(["postgres-cluster"])
            .reconcile_when(backups_enabled),
        )
        .node(service("redis", 6379))
        .node(
            DependentNode::new(
                "redis-deployment",
                Resource::new(deployment(), APP, "redis", named("redis"), |p: &Primary| {
                    let mut c = Container::new("redis", REDIS_IMAGE);
                    c.port = Some(6379);
                    Ok(deployment_body(selector(APP, p.name(), "redis"), 1, &[c]))
                }),
            )
            .ready_when(deployment_ready),
        )
        .node(config_map("api", |p| Ok(vec![("WEB_URL", format!("https://{}", host(p)?)), ("GUNICORN_WORKERS", "2".into())])))
        .node(config_map("backend", |p| {
            Ok(vec![
                ("REDIS_URL", format!("redis://{}:6379/", named("redis")(p))),
                ("DATABASE_URL", format!("postgresql://{}-rw:5432/{}", db_cluster(p), APP)),
                ("USE_MINIO", "0".into()),
            ])
        }))
        .node(service("api", 8000))
        .node(
            app_deployment("api", "backend", Some(8000), &["api", "backend"], true, &["./bin/takeoff"]).depends_on([
                "postgres-cluster",
                "redis-deployment",
                "api-configmap",
                "backend-configmap",
                "backend-secret",
            ]),
        )
        .node(config_map("frontend", |p| Ok(vec![("NEXT_PUBLIC_API_BASE_URL", format!("https://{}", host(p)?))])))
        .node(service("frontend", 3000))
        .node(app_deployment("frontend", "frontend", Some(3000), &["frontend"], false, &[]).depends_on(["frontend-configmap"]))
        .node(config_map("space", |p| Ok(vec![("NEXT_PUBLIC_DEPLOY_URL", format!("https://{}/spaces", host(p)?))])))
        .node(service("space", 3000))
        .node(app_deployment("space", "space", Some(3000), &["space"], false, &[]).depends_on(["space-configmap"]))
        .node(
            app_deployment("beat-worker", "backend", None, &["backend"], true, &["./bin/beat"]).depends_on([
                "postgres-cluster",
                "redis-deployment",
                "backend-configmap",
                "backend-secret",
                "api-deployment",
            ]),
        )
        .node(config_map("worker", |_p| Ok(vec![("CELERY_WORKER_CONCURRENCY", "2".into())])))
        .node(
            app_deployment("worker", "backend", None, &["backend", "worker"], true, &["./bin/worker"]).depends_on([
                "postgres-cluster",
                "redis-deployment",
                "backend-configmap",
                "backend-secret",
                "worker-configmap",
                "api-deployment",
            ]),
        )
        .build()?;

    let status = StatusAggregator::new()
        .component_with_detail("frontend", "frontend-deployment", replica_detail)
        .component_with_detail("space", "space-deployment", replica_detail)
        .component_with_detail("api", "api-deployment", replica_detail)
        .component_with_detail("beatWorker", "beat-worker-deployment", replica_detail)
        .component_with_detail("worker", "worker-deployment", replica_detail)
        .component_with_detail("redis", "redis-deployment", replica_detail)
        .component("database", "postgres-cluster");
    Ok(AppDefinition::new(APP, primary_type(KIND), graph, status))
}
