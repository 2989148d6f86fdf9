#![allow(dead_code)]

use std::collections::HashMap;

use kiln_core::{ApplyError, DependentResource, Json, Observed, ObservedCache, ObservedSet, Primary, PrimaryRef, TypeKey};
use kiln_graph::DependentNode;
use kube::core::DynamicObject;

pub fn cm_type() -> TypeKey { TypeKey::new("", "v1", "ConfigMap") }
pub fn plane_type() -> TypeKey { TypeKey::new("glasskube.eu", "v1alpha1", "Plane") }

/// ConfigMap named `<primary>-<suffix>` carrying the primary's spec.
pub struct Cm(pub &'static str);

impl DependentResource for Cm {
    fn type_key(&self) -> TypeKey { cm_type() }
    fn object_name(&self, primary: &Primary) -> String { format!("{}-{}", primary.name(), self.0) }
    fn desired(&self, primary: &Primary) -> Result<DynamicObject, ApplyError> {
        Ok(cm_type().object(primary.namespace(), &self.object_name(primary), serde_json::json!({ "data": primary.spec })))
    }
}

pub struct Broken;

impl DependentResource for Broken {
    fn type_key(&self) -> TypeKey { cm_type() }
    fn object_name(&self, primary: &Primary) -> String { format!("{}-broken", primary.name()) }
    fn desired(&self, _primary: &Primary) -> Result<DynamicObject, ApplyError> {
        Err(ApplyError::Produce("missing spec.host".into()))
    }
}

/// Ready once the fake server reports `status.ready == true`.
pub fn status_ready(_p: &Primary, own: &Observed, _o: &ObservedSet) -> bool {
    own.pointer("/status/ready").and_then(Json::as_bool).unwrap_or(false)
}

pub fn node(name: &'static str) -> DependentNode { DependentNode::new(name, Cm(name)).ready_when(status_ready) }

pub fn primary(name: &str) -> Primary {
    Primary {
        reference: PrimaryRef::new("Plane", Some("apps"), name),
        api_version: plane_type().api_version(),
        uid: Some(format!("uid-{}", name)),
        resource_version: Some("1".into()),
        generation: Some(3),
        labels: Default::default(),
        spec: serde_json::json!({ "host": "plane.example.com" }),
        status: Json::Null,
    }
}

pub fn primary_object(name: &str) -> DynamicObject {
    let mut o = plane_type().object(Some("apps"), name, serde_json::json!({ "spec": { "host": "plane.example.com" } }));
    o.metadata.generation = Some(3);
    o
}

#[derive(Default)]
pub struct MapCache(pub HashMap<String, DynamicObject>);

impl ObservedCache for MapCache {
    fn lookup(&self, _type_key: &TypeKey, _namespace: Option<&str>, name: &str) -> Observed {
        match self.0.get(name) {
            Some(o) => Observed::present(o.clone()),
            None => Observed::Absent,
        }
    }
}
