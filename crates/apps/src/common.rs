//! Building blocks shared by the app definitions: managed types, a closure-backed
//! dependent, minimal resource bodies and the common conditions.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use kiln_core::{ApplyError, DependentResource, Json, Observed, ObservedSet, Primary, TypeKey};
use kube::core::DynamicObject;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;

pub const GROUP: &str = "glasskube.eu";
pub const VERSION: &str = "v1alpha1";

pub fn primary_type(kind: &str) -> TypeKey { TypeKey::new(GROUP, VERSION, kind) }

pub fn deployment() -> TypeKey { TypeKey::new("apps", "v1", "Deployment") }
pub fn service() -> TypeKey { TypeKey::new("", "v1", "Service") }
pub fn config_map() -> TypeKey { TypeKey::new("", "v1", "ConfigMap") }
pub fn secret() -> TypeKey { TypeKey::new("", "v1", "Secret") }
pub fn ingress() -> TypeKey { TypeKey::new("networking.k8s.io", "v1", "Ingress") }
pub fn postgres_cluster() -> TypeKey { TypeKey::new("postgresql.cnpg.io", "v1", "Cluster") }
pub fn postgres_backup() -> TypeKey { TypeKey::new("postgresql.cnpg.io", "v1", "ScheduledBackup") }
pub fn minio_bucket() -> TypeKey { TypeKey::new(GROUP, VERSION, "MinioBucket") }
pub fn velero_schedule() -> TypeKey { TypeKey::new("velero.io", "v1", "Schedule") }
pub fn velero_location() -> TypeKey { TypeKey::new("velero.io", "v1", "BackupStorageLocation") }

type NameFn = Arc<dyn Fn(&Primary) -> String + Send + Sync>;
type BodyFn = Arc<dyn Fn(&Primary) -> Result<Json, ApplyError> + Send + Sync>;

/// Dependent whose name and body come from closures. Metadata (name, labels, the primary's
/// namespace) is filled in here; the body carries everything else.
#[derive(Clone)]
pub struct Resource {
    type_key: TypeKey,
    app: &'static str,
    component: &'static str,
    name: NameFn,
    body: BodyFn,
}

impl Resource {
    pub fn new<N, B>(type_key: TypeKey, app: &'static str, component: &'static str, name: N, body: B) -> Self
    where
        N: Fn(&Primary) -> String + Send + Sync + 'static,
        B: Fn(&Primary) -> Result<Json, ApplyError> + Send + Sync + 'static,
    {
        Self { type_key, app, component, name: Arc::new(name), body: Arc::new(body) }
    }
}

impl DependentResource for Resource {
    fn type_key(&self) -> TypeKey { self.type_key.clone() }

    fn object_name(&self, primary: &Primary) -> String { (self.name)(primary) }

    fn desired(&self, primary: &Primary) -> Result<DynamicObject, ApplyError> {
        let mut obj = self.type_key.object(primary.namespace(), &self.object_name(primary), (self.body)(primary)?);
        obj.metadata.labels = Some(labels(self.app, primary.name(), self.component));
        Ok(obj)
    }
}

/// Recommended `app.kubernetes.io` labels.
pub fn labels(app: &str, instance: &str, component: &str) -> BTreeMap<String, String> {
    let mut m = BTreeMap::new();
    m.insert("app.kubernetes.io/name".into(), app.to_string());
    m.insert("app.kubernetes.io/instance".into(), instance.to_string());
    m.insert("app.kubernetes.io/component".into(), component.to_string());
    m.insert("app.kubernetes.io/managed-by".into(), "kiln".into());
    m
}

pub fn selector(app: &str, instance: &str, component: &str) -> Json {
    json!({
        "app.kubernetes.io/name": app,
        "app.kubernetes.io/instance": instance,
        "app.kubernetes.io/component": component,
    })
}

pub fn env(vars: &[(&str, String)]) -> Json {
    Json::Array(vars.iter().map(|(k, v)| json!({ "name": k, "value": v })).collect())
}

pub fn env_from_config_maps(names: &[String]) -> Json {
    Json::Array(names.iter().map(|n| json!({ "configMapRef": { "name": n } })).collect())
}

pub fn env_from_secret(name: &str) -> Json { json!([{ "secretRef": { "name": name } }]) }

pub struct Container<'a> {
    pub name: &'a str,
    pub image: String,
    pub port: Option<u16>,
    pub args: Vec<String>,
    pub env: Json,
    pub env_from: Json,
}

impl<'a> Container<'a> {
    pub fn new(name: &'a str, image: impl Into<String>) -> Self {
        Self { name, image: image.into(), port: None, args: Vec::new(), env: json!([]), env_from: json!([]) }
    }

    pub fn to_json(&self) -> Json {
        let mut c = json!({ "name": self.name, "image": self.image, "env": self.env, "envFrom": self.env_from });
        if let Some(p) = self.port {
            c["ports"] = json!([{ "containerPort": p }]);
        }
        if !self.args.is_empty() {
            c["args"] = json!(self.args);
        }
        c
    }
}

pub fn deployment_body(selector: Json, replicas: u32, containers: &[Container<'_>]) -> Json {
    json!({
        "spec": {
            "replicas": replicas,
            "selector": { "matchLabels": selector },
            "template": {
                "metadata": { "labels": selector },
                "spec": { "containers": containers.iter().map(Container::to_json).collect::<Vec<_>>() },
            },
        }
    })
}

pub fn service_body(selector: Json, port: u16, target_port: u16) -> Json {
    json!({
        "spec": {
            "type": "ClusterIP",
            "selector": selector,
            "ports": [{ "name": "http", "port": port, "targetPort": target_port }],
        }
    })
}

pub fn ingress_body(host: &str, service: &str, port: u16, tls_secret: &str) -> Json {
    json!({
        "spec": {
            "ingressClassName": "nginx",
            "tls": [{ "hosts": [host], "secretName": tls_secret }],
            "rules": [{
                "host": host,
                "http": { "paths": [{
                    "path": "/",
                    "pathType": "Prefix",
                    "backend": { "service": { "name": service, "port": { "number": port } } },
                }] },
            }],
        }
    })
}

pub fn config_map_body(data: &[(&str, String)]) -> Json {
    let data: BTreeMap<&str, &String> = data.iter().map(|(k, v)| (*k, v)).collect();
    json!({ "data": data })
}

pub fn secret_body(string_data: &[(&str, String)]) -> Json {
    let data: BTreeMap<&str, &String> = string_data.iter().map(|(k, v)| (*k, v)).collect();
    json!({ "type": "Opaque", "stringData": data })
}

/// CloudNativePG cluster; when `backup_bucket` is set, WAL archiving goes to that bucket.
pub fn postgres_cluster_body(database: &str, storage: &str, backup_bucket: Option<&str>) -> Json {
    let mut b = json!({
        "spec": {
            "instances": 1,
            "storage": { "size": storage },
            "bootstrap": { "initdb": { "database": database, "owner": database } },
        }
    });
    if let Some(bucket) = backup_bucket {
        b["spec"]["backup"] = json!({
            "barmanObjectStore": {
                "destinationPath": format!("s3://{}", bucket),
                "endpointURL": "http://glasskube-minio.glasskube-system:9000",
            },
            "retentionPolicy": "30d",
        });
    }
    b
}

pub fn postgres_backup_body(cluster: &str, schedule: &str) -> Json {
    json!({ "spec": { "schedule": schedule, "backupOwnerReference": "self", "cluster": { "name": cluster } } })
}

pub fn minio_bucket_body() -> Json { json!({ "spec": {} }) }

pub fn velero_schedule_body(namespace: &str, schedule: &str, ttl: &str, location: &str, selector: Json) -> Json {
    json!({
        "spec": {
            "schedule": schedule,
            "template": {
                "includedNamespaces": [namespace],
                "labelSelector": { "matchLabels": selector },
                "storageLocation": location,
                "ttl": ttl,
                "snapshotVolumes": true,
            },
        }
    })
}

pub fn velero_location_body(bucket: &str, prefix: &str) -> Json {
    json!({
        "spec": {
            "provider": "aws",
            "objectStorage": { "bucket": bucket, "prefix": prefix },
            "config": { "region": "minio", "s3ForcePathStyle": "true", "s3Url": "http://glasskube-minio.glasskube-system:9000" },
        }
    })
}

/// Operator-held key that generated secrets are derived from. Never printed.
#[derive(Clone)]
pub struct SecretSeed(Arc<[u8]>);

impl SecretSeed {
    /// None for an empty key.
    pub fn new(key: impl AsRef<[u8]>) -> Option<Self> {
        let key = key.as_ref();
        (!key.is_empty()).then(|| Self(Arc::from(key)))
    }

    /// Throwaway seed for dry runs; secrets derived from it are not reproducible.
    pub fn ephemeral() -> Self {
        let mut key = Vec::with_capacity(32);
        key.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
        key.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
        Self(Arc::from(key))
    }
}

impl fmt::Debug for SecretSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("SecretSeed(..)") }
}

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 over the primary's uid and `purpose`, keyed by the operator seed. Stable
/// across passes for one primary and not computable from the primary's metadata alone.
pub fn derived_secret(primary: &Primary, seed: Option<&SecretSeed>, purpose: &str) -> Result<String, ApplyError> {
    let seed = seed.ok_or_else(|| ApplyError::Produce("no secret seed configured (set KILN_SECRET_SEED)".into()))?;
    let uid = primary
        .uid
        .as_deref()
        .ok_or_else(|| ApplyError::Produce(format!("{} has no uid yet", primary.reference)))?;
    let mut mac = HmacSha256::new_from_slice(&seed.0).map_err(|e| ApplyError::Produce(format!("secret seed: {}", e)))?;
    mac.update(uid.as_bytes());
    mac.update(b"/");
    mac.update(purpose.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

// ---------------- Spec fragments ----------------

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct BackupsSpec {
    pub schedule: String,
    pub ttl: String,
}

impl Default for BackupsSpec {
    fn default() -> Self { Self { schedule: "0 3 * * *".into(), ttl: "720h".into() } }
}

/// `spec.backups` with defaults filled in. Absent or null gives the defaults; a section
/// that does not parse is an error.
pub fn backups(primary: &Primary) -> Result<BackupsSpec, ApplyError> {
    match primary.spec_field("/backups") {
        None | Some(Json::Null) => Ok(BackupsSpec::default()),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| ApplyError::Produce(format!("{}: spec.backups: {}", primary.reference, e))),
    }
}

pub fn host(primary: &Primary) -> Result<String, ApplyError> {
    primary
        .spec_field("/host")
        .and_then(Json::as_str)
        .map(str::to_string)
        .ok_or_else(|| ApplyError::Produce(format!("{}: spec.host is required", primary.reference)))
}

pub fn version_or(primary: &Primary, default: &str) -> String {
    primary.spec_field("/version").and_then(Json::as_str).unwrap_or(default).to_string()
}

// ---------------- Conditions ----------------

fn int_at(v: Option<&Json>) -> Option<i64> { v.and_then(Json::as_i64) }

/// Deployment has at least as many ready replicas as desired.
pub fn deployment_ready(_p: &Primary, own: &Observed, _o: &ObservedSet) -> bool {
    let Some(obj) = own.object() else { return false };
    let want = int_at(obj.data.pointer("/spec/replicas")).unwrap_or(1);
    let ready = int_at(obj.data.pointer("/status/readyReplicas")).unwrap_or(0);
    ready >= want
}

/// CloudNativePG cluster reports all instances ready.
pub fn postgres_ready(_p: &Primary, own: &Observed, _o: &ObservedSet) -> bool {
    let Some(obj) = own.object() else { return false };
    let want = int_at(obj.data.pointer("/spec/instances")).unwrap_or(1);
    let ready = int_at(obj.data.pointer("/status/readyInstances")).unwrap_or(0);
    ready >= want
}

pub fn backups_enabled(p: &Primary, _own: &Observed, _o: &ObservedSet) -> bool { p.spec_field("/backups").is_some() }

pub fn office_enabled(p: &Primary, _own: &Observed, _o: &ObservedSet) -> bool { p.spec_field("/apps/office").is_some() }

/// "ready/desired replicas" detail for a deployment component.
pub fn replica_detail(obj: &DynamicObject) -> Option<String> {
    let want = int_at(obj.data.pointer("/spec/replicas"))?;
    let ready = int_at(obj.data.pointer("/status/readyReplicas")).unwrap_or(0);
    Some(format!("{}/{} replicas", ready, want))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::PrimaryRef;

    pub(crate) fn primary(kind: &str, spec: Json) -> Primary {
        Primary {
            reference: PrimaryRef::new(kind, Some("apps"), "demo"),
            api_version: primary_type(kind).api_version(),
            uid: Some("4a1b5c9e-0000-4000-8000-000000000001".into()),
            resource_version: Some("1".into()),
            generation: Some(1),
            labels: Default::default(),
            spec,
            status: Json::Null,
        }
    }

    fn with_status(tk: TypeKey, spec: Json, status: Json) -> Observed {
        Observed::present(tk.object(Some("apps"), "x", json!({ "spec": spec, "status": status })))
    }

    #[test]
    fn deployment_ready_compares_replicas() {
        let p = primary("Plane", json!({}));
        let o = ObservedSet::new();
        assert!(!deployment_ready(&p, &Observed::Absent, &o));
        assert!(!deployment_ready(&p, &with_status(deployment(), json!({ "replicas": 2 }), json!({ "readyReplicas": 1 })), &o));
        assert!(deployment_ready(&p, &with_status(deployment(), json!({ "replicas": 2 }), json!({ "readyReplicas": 2 })), &o));
        assert!(deployment_ready(&p, &with_status(deployment(), json!({ "replicas": 0 }), json!({})), &o));
    }

    #[test]
    fn postgres_ready_needs_all_instances() {
        let p = primary("Plane", json!({}));
        let o = ObservedSet::new();
        assert!(!postgres_ready(&p, &with_status(postgres_cluster(), json!({ "instances": 1 }), json!({})), &o));
        assert!(postgres_ready(&p, &with_status(postgres_cluster(), json!({ "instances": 1 }), json!({ "readyInstances": 1 })), &o));
    }

    #[test]
    fn spec_gates() {
        let o = ObservedSet::new();
        assert!(!backups_enabled(&primary("Odoo", json!({ "backups": null })), &Observed::Absent, &o));
        assert!(backups_enabled(&primary("Odoo", json!({ "backups": {} })), &Observed::Absent, &o));
        assert!(office_enabled(&primary("Nextcloud", json!({ "apps": { "office": { "version": "23.05" } } })), &Observed::Absent, &o));
        assert!(!office_enabled(&primary("Nextcloud", json!({ "apps": {} })), &Observed::Absent, &o));
    }

    #[test]
    fn backups_defaults_fill_missing_fields() {
        let b = backups(&primary("Odoo", json!({ "backups": { "ttl": "24h" } }))).unwrap();
        assert_eq!(b.schedule, "0 3 * * *");
        assert_eq!(b.ttl, "24h");
        assert_eq!(backups(&primary("Odoo", json!({}))).unwrap(), BackupsSpec::default());
        assert_eq!(BackupsSpec::default().schedule, "0 3 * * *");
    }

    #[test]
    fn malformed_backups_section_is_an_error() {
        let err = backups(&primary("Odoo", json!({ "backups": { "schedule": 3 } }))).unwrap_err();
        assert!(matches!(err, ApplyError::Produce(ref m) if m.contains("spec.backups")), "{:?}", err);
        assert!(backups(&primary("Odoo", json!({ "backups": "nightly" }))).is_err());
    }

    #[test]
    fn derived_secrets_are_stable_and_keyed() {
        let p = primary("Plane", json!({}));
        let seed = SecretSeed::new("operator-key").unwrap();
        let other = SecretSeed::new("another-key").unwrap();
        let key = derived_secret(&p, Some(&seed), "secret-key").unwrap();
        assert_eq!(key.len(), 64);
        assert_eq!(key, derived_secret(&p, Some(&seed), "secret-key").unwrap());
        assert_ne!(key, derived_secret(&p, Some(&seed), "db").unwrap());
        assert_ne!(key, derived_secret(&p, Some(&other), "secret-key").unwrap());

        assert!(derived_secret(&p, None, "secret-key").is_err());
        let mut no_uid = p.clone();
        no_uid.uid = None;
        assert!(derived_secret(&no_uid, Some(&seed), "secret-key").is_err());
    }

    #[test]
    fn seed_rejects_empty_and_hides_its_key() {
        assert!(SecretSeed::new("").is_none());
        assert_eq!(format!("{:?}", SecretSeed::new("operator-key").unwrap()), "SecretSeed(..)");
        let p = primary("Plane", json!({}));
        let (a, b) = (SecretSeed::ephemeral(), SecretSeed::ephemeral());
        assert_ne!(derived_secret(&p, Some(&a), "k").unwrap(), derived_secret(&p, Some(&b), "k").unwrap());
    }

    #[test]
    fn resource_fills_metadata() {
        let r = Resource::new(config_map(), "plane", "api", |p: &Primary| format!("plane-{}-api", p.name()), |_p: &Primary| {
            Ok(config_map_body(&[("A", "1".into())]))
        });
        let obj = r.desired(&primary("Plane", json!({}))).unwrap();
        assert_eq!(obj.metadata.name.as_deref(), Some("plane-demo-api"));
        assert_eq!(obj.metadata.namespace.as_deref(), Some("apps"));
        assert_eq!(obj.metadata.labels.unwrap()["app.kubernetes.io/component"], "api");
        assert_eq!(obj.data["data"]["A"], "1");
    }
}
