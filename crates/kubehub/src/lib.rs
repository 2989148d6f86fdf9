//! Kiln kubehub: list+watch wiring that feeds the shared type caches and primary triggers.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use kiln_core::{PrimaryRef, TypeKey};
use kiln_store::{Delta, Multiplexer, ObjectKey, TypeHandle};
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject},
    discovery::{self, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const RESTART_BASE: Duration = Duration::from_millis(500);
const RESTART_MAX: Duration = Duration::from_secs(30);

async fn find_api_resource(client: &Client, type_key: &TypeKey) -> Result<(ApiResource, bool)> {
    let (ar, caps) = discovery::pinned_kind(client, &type_key.to_gvk())
        .await
        .with_context(|| format!("resolving {}", type_key))?;
    Ok((ar, matches!(caps.scope, Scope::Namespaced)))
}

async fn api_for(client: &Client, type_key: &TypeKey, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
    let (ar, namespaced) = find_api_resource(client, type_key).await?;
    Ok(match (namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(client.clone(), ns, &ar),
        _ => Api::all_with(client.clone(), &ar),
    })
}

fn prune(mut obj: DynamicObject) -> DynamicObject {
    obj.metadata.managed_fields = None;
    obj
}

/// Restart delay after `failures` consecutive stream errors.
pub fn restart_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    RESTART_BASE.saturating_mul(1u32 << exp).min(RESTART_MAX)
}

/// Deltas that bring a cache in line with a full relist: upsert every listed object and
/// evict cached keys the relist no longer contains.
pub fn resync_deltas(handle: &TypeHandle, list: Vec<DynamicObject>) -> Vec<Delta> {
    let listed: BTreeSet<ObjectKey> = list.iter().filter_map(ObjectKey::of).collect();
    let mut out: Vec<Delta> = list.into_iter().map(prune).filter_map(Delta::applied).collect();
    let snap = handle.current();
    let mut stale: Vec<_> = snap.objects.keys().filter(|k| !listed.contains(*k)).cloned().collect();
    stale.sort();
    out.extend(stale.into_iter().map(Delta::evict));
    out
}

/// List+watch one managed type into its shared cache. Runs until the cache's ingest loop goes away;
/// stream errors restart the watch with exponential backoff.
pub async fn start_type_watcher(client: Client, handle: TypeHandle, namespace: Option<String>) -> Result<()> {
    let type_key = handle.type_key().clone();
    let api = api_for(&client, &type_key, namespace.as_deref()).await?;
    let tx = handle.sender();
    let mut failures = 0u32;
    info!(gvk = %type_key, ns = ?namespace, "type watcher started");
    loop {
        let stream = watcher::watcher(api.clone(), watcher::Config::default());
        futures::pin_mut!(stream);
        while let Some(ev) = stream.next().await {
            let deltas = match ev {
                Ok(Event::Applied(o)) => Delta::applied(prune(o)).into_iter().collect(),
                Ok(Event::Deleted(o)) => Delta::deleted(&o).into_iter().collect(),
                Ok(Event::Restarted(list)) => {
                    debug!(gvk = %type_key, count = list.len(), "watch relist");
                    resync_deltas(&handle, list)
                }
                Err(e) => {
                    failures += 1;
                    counter!("watch_errors", 1u64);
                    warn!(gvk = %type_key, error = %e, failures, "watch error; restarting");
                    break;
                }
            };
            failures = 0;
            for d in deltas {
                if tx.send(d).await.is_err() {
                    info!(gvk = %type_key, "cache gone; stopping type watcher");
                    return Ok(());
                }
            }
        }
        tokio::time::sleep(restart_delay(failures.max(1))).await;
    }
}

/// Watch primaries of one kind and forward every change as a reconcile trigger.
/// Deletions are forwarded too so the controller can evict cached dependents.
pub async fn watch_primaries(
    client: Client,
    type_key: TypeKey,
    namespace: Option<String>,
    tx: mpsc::Sender<PrimaryRef>,
) -> Result<()> {
    let api = api_for(&client, &type_key, namespace.as_deref()).await?;
    let to_ref = |o: &DynamicObject| {
        o.metadata.name.as_deref().map(|n| PrimaryRef::new(&type_key.kind, o.metadata.namespace.as_deref(), n))
    };
    let mut failures = 0u32;
    info!(gvk = %type_key, ns = ?namespace, "primary watcher started");
    loop {
        let stream = watcher::watcher(api.clone(), watcher::Config::default());
        futures::pin_mut!(stream);
        while let Some(ev) = stream.next().await {
            let refs: Vec<PrimaryRef> = match ev {
                Ok(Event::Applied(o)) | Ok(Event::Deleted(o)) => to_ref(&o).into_iter().collect(),
                Ok(Event::Restarted(list)) => list.iter().filter_map(to_ref).collect(),
                Err(e) => {
                    failures += 1;
                    counter!("watch_errors", 1u64);
                    warn!(gvk = %type_key, error = %e, failures, "primary watch error; restarting");
                    break;
                }
            };
            failures = 0;
            for r in refs {
                if tx.send(r).await.is_err() {
                    info!(gvk = %type_key, "trigger queue closed; stopping primary watcher");
                    return Ok(());
                }
            }
        }
        tokio::time::sleep(restart_delay(failures.max(1))).await;
    }
}

/// Register `type_key` with the multiplexer and spawn its watcher unless one is already running.
pub fn ensure_type_watcher(
    client: &Client,
    mux: &Multiplexer,
    type_key: &TypeKey,
    namespace: Option<String>,
) -> TypeHandle {
    let fresh = mux.handle(type_key).is_none();
    let handle = mux.register(type_key);
    if fresh {
        let (client, h) = (client.clone(), handle.clone());
        let tk = type_key.clone();
        tokio::spawn(async move {
            if let Err(e) = start_type_watcher(client, h, namespace).await {
                warn!(gvk = %tk, error = %e, "type watcher exited");
            }
        });
    }
    handle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_delay_doubles_and_caps() {
        assert_eq!(restart_delay(1), Duration::from_millis(500));
        assert_eq!(restart_delay(2), Duration::from_secs(1));
        assert_eq!(restart_delay(4), Duration::from_secs(4));
        assert_eq!(restart_delay(40), RESTART_MAX);
    }

    #[tokio::test]
    async fn resync_evicts_objects_missing_from_relist() {
        let tk = TypeKey::new("", "v1", "Secret");
        let mux = Multiplexer::new(16);
        let h = mux.register(&tk);
        for n in ["a", "b"] {
            h.sender().send(Delta::applied(tk.object(Some("ns"), n, serde_json::json!({}))).unwrap()).await.unwrap();
        }
        let loaded = async {
            while h.current().objects.len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), loaded).await.unwrap();

        let mut relist = tk.object(Some("ns"), "a", serde_json::json!({}));
        relist.metadata.managed_fields = Some(vec![Default::default()]);
        let deltas = resync_deltas(&h, vec![relist]);
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].key.name, "a");
        assert!(deltas[0].object.as_ref().unwrap().metadata.managed_fields.is_none());
        assert_eq!(deltas[1].key.name, "b");
        assert_eq!(deltas[1].kind, kiln_core::ChangeKind::Deleted);
    }
}
