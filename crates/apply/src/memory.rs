//! In-memory cluster: a `ClusterClient` + `StatusSink` used by tests and `kilnctl plan`.
//!
//! Upserts behave like server-side apply for our purposes: the stored body is replaced,
//! `status` is owned by the "server" and survives, and the resourceVersion only moves
//! when something actually changed.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use kiln_core::{
    ApplyError, ClusterClient, CompositeStatus, Json, Observed, Primary, PrimaryRef, StatusError, StatusSink, TypeKey,
};
use kube::core::DynamicObject;

type Key = (TypeKey, Option<String>, String);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, DynamicObject>,
    next_rv: u64,
    /// object name -> status the fake server reports after apply
    server_status: BTreeMap<String, Json>,
    /// object name -> rejection message
    failures: BTreeMap<String, String>,
    /// object name -> artificial latency
    delays: BTreeMap<String, Duration>,
    conflicts_left: u32,
    applied: Vec<String>,
    statuses: BTreeMap<PrimaryRef, CompositeStatus>,
    status_writes: u32,
}

impl Inner {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }
}

#[derive(Default)]
pub struct MemoryCluster {
    inner: Mutex<Inner>,
}

impl MemoryCluster {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Store an object as-is (e.g. a primary), assigning uid and resourceVersion if missing.
    pub fn insert(&self, type_key: &TypeKey, mut obj: DynamicObject) {
        let mut g = self.lock();
        let rv = g.bump();
        let name = obj.metadata.name.clone().unwrap_or_default();
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(format!("00000000-0000-4000-8000-{:012}", rv.parse::<u64>().unwrap_or(0)));
        }
        obj.metadata.resource_version = Some(rv);
        g.objects.insert((type_key.clone(), obj.metadata.namespace.clone(), name), obj);
    }

    pub fn remove(&self, type_key: &TypeKey, namespace: Option<&str>, name: &str) -> bool {
        self.lock().objects.remove(&(type_key.clone(), namespace.map(|s| s.to_string()), name.to_string())).is_some()
    }

    /// Status the fake server attaches to the object named `name` from now on.
    pub fn set_server_status(&self, name: &str, status: Json) {
        let mut g = self.lock();
        g.server_status.insert(name.to_string(), status.clone());
        for ((_, _, n), obj) in g.objects.iter_mut() {
            if n == name {
                if let Some(map) = obj.data.as_object_mut() { map.insert("status".into(), status.clone()); }
            }
        }
    }

    /// Reject every apply of the object named `name`.
    pub fn fail_apply(&self, name: &str, message: &str) {
        self.lock().failures.insert(name.to_string(), message.to_string());
    }

    pub fn clear_failure(&self, name: &str) { self.lock().failures.remove(name); }

    /// Delay applies of `name`; combine with an engine apply timeout to simulate hangs.
    pub fn delay_apply(&self, name: &str, delay: Duration) {
        self.lock().delays.insert(name.to_string(), delay);
    }

    /// Answer the next `n` status writes with a conflict.
    pub fn conflict_next_status_writes(&self, n: u32) { self.lock().conflicts_left = n; }

    /// Bump a stored object's resourceVersion, as a concurrent writer would.
    pub fn touch(&self, type_key: &TypeKey, namespace: Option<&str>, name: &str) {
        let mut g = self.lock();
        let rv = g.bump();
        if let Some(o) = g.objects.get_mut(&(type_key.clone(), namespace.map(|s| s.to_string()), name.to_string())) {
            o.metadata.resource_version = Some(rv);
        }
    }

    /// Names of successfully applied objects, in apply order (repeats included).
    pub fn applied(&self) -> Vec<String> { self.lock().applied.clone() }

    pub fn apply_count(&self, name: &str) -> usize { self.lock().applied.iter().filter(|n| *n == name).count() }

    pub fn object(&self, type_key: &TypeKey, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
        self.lock().objects.get(&(type_key.clone(), namespace.map(|s| s.to_string()), name.to_string())).cloned()
    }

    pub fn objects(&self) -> Vec<DynamicObject> { self.lock().objects.values().cloned().collect() }

    pub fn status_of(&self, primary: &PrimaryRef) -> Option<CompositeStatus> { self.lock().statuses.get(primary).cloned() }

    pub fn status_writes(&self) -> u32 { self.lock().status_writes }
}

#[async_trait::async_trait]
impl ClusterClient for MemoryCluster {
    async fn upsert(&self, type_key: &TypeKey, object: &DynamicObject) -> Result<DynamicObject, ApplyError> {
        let name = object
            .metadata
            .name
            .clone()
            .ok_or_else(|| ApplyError::Produce(format!("desired {} has no metadata.name", type_key)))?;
        let delay = self.lock().delays.get(&name).copied();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }

        let mut g = self.lock();
        if let Some(msg) = g.failures.get(&name) {
            return Err(ApplyError::Rejected(msg.clone()));
        }
        let key = (type_key.clone(), object.metadata.namespace.clone(), name.clone());
        let mut next = super::strip_server_fields(object.clone());
        let status = g
            .server_status
            .get(&name)
            .cloned()
            .or_else(|| g.objects.get(&key).and_then(|o| o.data.get("status").cloned()));
        if let (Some(st), Some(map)) = (status, next.data.as_object_mut()) {
            map.insert("status".into(), st);
        }
        let prev = g.objects.get(&key).map(|prev| {
            let unchanged = prev.data == next.data
                && prev.metadata.labels == next.metadata.labels
                && prev.metadata.owner_references == next.metadata.owner_references;
            (prev.metadata.uid.clone(), prev.metadata.resource_version.clone(), unchanged)
        });
        match prev {
            Some((uid, rv, unchanged)) => {
                next.metadata.uid = uid;
                next.metadata.resource_version = if unchanged { rv } else { Some(g.bump()) };
            }
            None => {
                let rv = g.bump();
                next.metadata.uid = Some(format!("00000000-0000-4000-8000-{:012}", rv.parse::<u64>().unwrap_or(0)));
                next.metadata.resource_version = Some(rv);
            }
        }
        g.objects.insert(key, next.clone());
        g.applied.push(name);
        Ok(next)
    }

    async fn get(&self, type_key: &TypeKey, namespace: Option<&str>, name: &str) -> Result<Observed, ApplyError> {
        Ok(match self.object(type_key, namespace, name) {
            Some(o) => Observed::present(o),
            None => Observed::Absent,
        })
    }
}

#[async_trait::async_trait]
impl StatusSink for MemoryCluster {
    async fn replace(&self, primary: &Primary, status: &CompositeStatus) -> Result<(), StatusError> {
        let mut g = self.lock();
        g.status_writes += 1;
        if g.conflicts_left > 0 {
            g.conflicts_left -= 1;
            let rv = g.bump();
            let key = (super::primary_type(primary), primary.reference.namespace.clone(), primary.reference.name.clone());
            if let Some(o) = g.objects.get_mut(&key) { o.metadata.resource_version = Some(rv); }
            return Err(StatusError::Conflict(format!("{} was modified", primary.reference)));
        }
        let key = (super::primary_type(primary), primary.reference.namespace.clone(), primary.reference.name.clone());
        let current_rv = g.objects.get(&key).and_then(|o| o.metadata.resource_version.clone());
        if current_rv.is_some() && current_rv != primary.resource_version {
            return Err(StatusError::Conflict(format!(
                "{}: resourceVersion {:?} is stale (now {:?})",
                primary.reference, primary.resource_version, current_rv
            )));
        }
        let rv = g.bump();
        if let Some(o) = g.objects.get_mut(&key) {
            o.metadata.resource_version = Some(rv);
            if let Some(map) = o.data.as_object_mut() { map.insert("status".into(), status.to_json()); }
        }
        g.statuses.insert(primary.reference.clone(), status.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm(name: &str, value: &str) -> DynamicObject {
        TypeKey::new("", "v1", "ConfigMap").object(Some("ns"), name, serde_json::json!({ "data": { "k": value } }))
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let c = MemoryCluster::new();
        let tk = TypeKey::new("", "v1", "ConfigMap");
        let a = c.upsert(&tk, &cm("x", "1")).await.unwrap();
        let b = c.upsert(&tk, &cm("x", "1")).await.unwrap();
        assert_eq!(a.metadata.resource_version, b.metadata.resource_version);
        assert_eq!(a.metadata.uid, b.metadata.uid);
        let d = c.upsert(&tk, &cm("x", "2")).await.unwrap();
        assert_ne!(a.metadata.resource_version, d.metadata.resource_version);
        assert_eq!(c.apply_count("x"), 3);
    }

    #[tokio::test]
    async fn server_status_survives_apply() {
        let c = MemoryCluster::new();
        let tk = TypeKey::new("", "v1", "ConfigMap");
        c.set_server_status("x", serde_json::json!({ "ok": true }));
        let a = c.upsert(&tk, &cm("x", "1")).await.unwrap();
        assert_eq!(a.data["status"]["ok"], true);
    }

    #[tokio::test]
    async fn injected_failure_rejects() {
        let c = MemoryCluster::new();
        c.fail_apply("x", "quota exceeded");
        let err = c.upsert(&TypeKey::new("", "v1", "ConfigMap"), &cm("x", "1")).await.unwrap_err();
        assert!(matches!(err, ApplyError::Rejected(m) if m == "quota exceeded"));
        assert!(c.applied().is_empty());

        c.clear_failure("x");
        c.upsert(&TypeKey::new("", "v1", "ConfigMap"), &cm("x", "1")).await.unwrap();
        assert_eq!(c.applied(), vec!["x".to_string()]);
    }

    #[tokio::test]
    async fn status_write_after_a_concurrent_touch_conflicts() {
        let c = MemoryCluster::new();
        let tk = TypeKey::new("glasskube.eu", "v1alpha1", "Plane");
        c.insert(&tk, tk.object(Some("apps"), "p1", serde_json::json!({ "spec": {} })));
        let read = Primary::from_dynamic(&tk, &c.object(&tk, Some("apps"), "p1").unwrap()).unwrap();

        c.touch(&tk, Some("apps"), "p1");
        let err = c.replace(&read, &CompositeStatus::default()).await.unwrap_err();
        assert!(matches!(err, StatusError::Conflict(_)));
        assert!(c.status_of(&read.reference).is_none());

        let fresh = Primary::from_dynamic(&tk, &c.object(&tk, Some("apps"), "p1").unwrap()).unwrap();
        assert_ne!(fresh.resource_version, read.resource_version);
        c.replace(&fresh, &CompositeStatus::default()).await.unwrap();
        assert_eq!(c.status_of(&read.reference), Some(CompositeStatus::default()));
    }
}
