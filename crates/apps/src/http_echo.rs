//! HttpEcho: a single echo server behind a service and ingress.

use kiln_core::{ConfigError, Primary};
use kiln_engine::AppDefinition;
use kiln_graph::{DependentNode, ReconcileGraph};
use kiln_status::StatusAggregator;

use crate::common::*;

pub const KIND: &str = "HttpEcho";
const APP: &str = "http-echo";
const IMAGE: &str = "hashicorp/http-echo:0.2.3";
const PORT: u16 = 5678;

pub fn definition() -> Result<AppDefinition, ConfigError> {
    let name = |p: &Primary| p.name().to_string();
    let graph = ReconcileGraph::builder()
        .node(
            DependentNode::new(
                "deployment",
                Resource::new(deployment(), APP, "echo", name, |p: &Primary| {
                    let text = p.spec_field("/text").and_then(|v| v.as_str()).unwrap_or("hello");
                    let mut c = Container::new("echo", IMAGE);
                    c.port = Some(PORT);
                    c.args = vec![format!("-text={}", text)];
                    Ok(deployment_body(selector(APP, p.name(), "echo"), 1, &[c]))
                }),
            )
            .ready_when(deployment_ready),
        )
        .node(DependentNode::new(
            "service",
            Resource::new(service(), APP, "echo", name, |p: &Primary| Ok(service_body(selector(APP, p.name(), "echo"), 80, PORT))),
        ))
        .node(
            DependentNode::new(
                "ingress",
                Resource::new(ingress(), APP, "echo", name, |p: &Primary| {
                    Ok(ingress_body(&host(p)?, p.name(), 80, &format!("{}-tls", p.name())))
                }),
            )
            .depends_on(["service"]),
        )
        .build()?;
    let status = StatusAggregator::new().component_with_detail("deployment", "deployment", replica_detail);
    Ok(AppDefinition::new("httpecho", primary_type(KIND), graph, status))
}
