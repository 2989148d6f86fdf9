//! Kiln apply: server-side apply upserts, reads and status replacement against the API server.

#![forbid(unsafe_code)]

use std::time::Instant;

use anyhow::{Context, Result};
use kiln_core::{ApplyError, ClusterClient, CompositeStatus, Json, Observed, Primary, StatusError, StatusSink, TypeKey};
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject},
    discovery::{self, Scope},
    Client,
};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

mod memory;

pub use memory::MemoryCluster;

pub const FIELD_MANAGER: &str = "kiln";

/// Cluster client backed by kube-rs. API resources are discovered once per type and cached.
pub struct KubeCluster {
    client: Client,
    resources: RwLock<FxHashMap<TypeKey, (ApiResource, bool)>>,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client, resources: RwLock::new(FxHashMap::default()) }
    }

    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client from current context")?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> Client { self.client.clone() }

    /// Resolve (and cache) the API resource for a type.
    pub async fn resolve(&self, type_key: &TypeKey) -> Result<(ApiResource, bool), ApplyError> {
        if let Some(hit) = self.resources.read().await.get(type_key) {
            return Ok(hit.clone());
        }
        let (ar, caps) = discovery::pinned_kind(&self.client, &type_key.to_gvk())
            .await
            .map_err(|e| ApplyError::Transport(format!("discovering {}: {}", type_key, e)))?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        debug!(gvk = %type_key, plural = %ar.plural, namespaced, "api resource resolved");
        self.resources.write().await.insert(type_key.clone(), (ar.clone(), namespaced));
        Ok((ar, namespaced))
    }

    async fn api(&self, type_key: &TypeKey, namespace: Option<&str>) -> Result<Api<DynamicObject>, ApplyError> {
        let (ar, namespaced) = self.resolve(type_key).await?;
        if namespaced {
            match namespace {
                Some(ns) => Ok(Api::namespaced_with(self.client.clone(), ns, &ar)),
                None => Err(ApplyError::Rejected(format!("namespace required for namespaced kind {}", type_key))),
            }
        } else {
            Ok(Api::all_with(self.client.clone(), &ar))
        }
    }
}

/// Classify a kube error: 4xx other than 408/429 is a rejection, everything else transport.
pub fn classify(e: kube::Error) -> ApplyError {
    match e {
        kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 408 && ae.code != 429 => {
            ApplyError::Rejected(format!("{} ({})", ae.message, ae.code))
        }
        other => ApplyError::Transport(other.to_string()),
    }
}

/// Drop server-managed metadata that must not be sent with an apply patch.
pub fn strip_server_fields(mut obj: DynamicObject) -> DynamicObject {
    obj.metadata.managed_fields = None;
    obj.metadata.resource_version = None;
    obj.metadata.generation = None;
    obj.metadata.creation_timestamp = None;
    obj.metadata.uid = None;
    if let Some(data) = obj.data.as_object_mut() {
        data.remove("status");
    }
    obj
}

#[async_trait::async_trait]
impl ClusterClient for KubeCluster {
    async fn upsert(&self, type_key: &TypeKey, object: &DynamicObject) -> Result<DynamicObject, ApplyError> {
        let t0 = Instant::now();
        counter!("apply_attempts", 1u64);
        let name = object
            .metadata
            .name
            .clone()
            .ok_or_else(|| ApplyError::Produce(format!("desired {} has no metadata.name", type_key)))?;
        let api = self.api(type_key, object.metadata.namespace.as_deref()).await?;
        let body = strip_server_fields(object.clone());
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        match api.patch(&name, &pp, &Patch::Apply(&body)).await {
            Ok(o) => {
                histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                counter!("apply_ok", 1u64);
                Ok(o)
            }
            Err(e) => {
                counter!("apply_err", 1u64);
                warn!(gvk = %type_key, name = %name, error = %e, "server-side apply failed");
                Err(classify(e))
            }
        }
    }

    async fn get(&self, type_key: &TypeKey, namespace: Option<&str>, name: &str) -> Result<Observed, ApplyError> {
        let api = self.api(type_key, namespace).await?;
        match api.get_opt(name).await {
            Ok(Some(o)) => Ok(Observed::present(o)),
            Ok(None) => Ok(Observed::Absent),
            Err(e) => Err(classify(e)),
        }
    }
}

/// Split a primary's apiVersion back into a type key.
pub fn primary_type(primary: &Primary) -> TypeKey {
    match primary.api_version.split_once('/') {
        Some((g, v)) => TypeKey::new(g, v, &primary.reference.kind),
        None => TypeKey::new("", &primary.api_version, &primary.reference.kind),
    }
}

/// Body for a full status replacement guarded by the primary's resourceVersion.
pub fn status_body(primary: &Primary, status: &CompositeStatus) -> Json {
    let mut meta = serde_json::json!({ "name": primary.name() });
    if let Some(ns) = primary.namespace() { meta["namespace"] = Json::String(ns.to_string()); }
    if let Some(rv) = &primary.resource_version { meta["resourceVersion"] = Json::String(rv.clone()); }
    serde_json::json!({
        "apiVersion": primary.api_version,
        "kind": primary.reference.kind,
        "metadata": meta,
        "status": status.to_json(),
    })
}

#[async_trait::async_trait]
impl StatusSink for KubeCluster {
    async fn replace(&self, primary: &Primary, status: &CompositeStatus) -> Result<(), StatusError> {
        let tk = primary_type(primary);
        let api = self.api(&tk, primary.namespace()).await.map_err(|e| StatusError::Other(e.to_string()))?;
        let body = serde_json::to_vec(&status_body(primary, status)).map_err(|e| StatusError::Other(e.to_string()))?;
        match api.replace_status(primary.name(), &PostParams::default(), body).await {
            Ok(_) => {
                counter!("status_write_ok", 1u64);
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                counter!("status_write_conflict", 1u64);
                Err(StatusError::Conflict(ae.message))
            }
            Err(e) => {
                counter!("status_write_err", 1u64);
                Err(StatusError::Other(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{ComponentStatus, PrimaryRef};

    fn primary() -> Primary {
        Primary {
            reference: PrimaryRef::new("Plane", Some("apps"), "p1"),
            api_version: "glasskube.eu/v1alpha1".into(),
            uid: Some("u".into()),
            resource_version: Some("7".into()),
            generation: Some(1),
            labels: Default::default(),
            spec: serde_json::json!({}),
            status: Json::Null,
        }
    }

    #[test]
    fn strip_server_fields_prunes_metadata_and_status() {
        let mut o = TypeKey::new("", "v1", "ConfigMap").object(
            Some("ns"),
            "x",
            serde_json::json!({ "data": { "k": "v" }, "status": { "obs": true } }),
        );
        o.metadata.resource_version = Some("123".into());
        o.metadata.generation = Some(5);
        o.metadata.uid = Some("abc".into());
        let pruned = strip_server_fields(o);
        assert!(pruned.metadata.resource_version.is_none());
        assert!(pruned.metadata.generation.is_none());
        assert!(pruned.metadata.uid.is_none());
        assert!(pruned.data.get("status").is_none());
        assert_eq!(pruned.data["data"]["k"], "v");
    }

    #[test]
    fn primary_type_splits_api_version() {
        assert_eq!(primary_type(&primary()).gvk_key(), "glasskube.eu/v1alpha1/Plane");
        let mut p = primary();
        p.api_version = "v1".into();
        assert_eq!(primary_type(&p).gvk_key(), "v1/Plane");
    }

    #[test]
    fn status_body_carries_resource_version_guard() {
        let mut st = CompositeStatus::default();
        st.components.insert("api".into(), ComponentStatus { ready: true, detail: None });
        let b = status_body(&primary(), &st);
        assert_eq!(b["metadata"]["resourceVersion"], "7");
        assert_eq!(b["metadata"]["namespace"], "apps");
        assert_eq!(b["status"]["components"]["api"]["ready"], true);
    }
}
