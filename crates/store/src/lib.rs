//! Kiln store: shared per-type caches and the event source multiplexer.
//!
//! One cache per managed type, fed by one watcher, shared by every app and primary that
//! manages objects of that type. Each cache is written by a single ingest task that
//! coalesces deltas and swaps in immutable snapshots; readers never block.

#![forbid(unsafe_code)]

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use kiln_core::{controller_owner, ChangeEvent, ChangeKind, Observed, ObservedCache, PrimaryRef, TypeKey};
use kube::core::DynamicObject;
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    pub fn of(obj: &DynamicObject) -> Option<Self> {
        Some(Self { namespace: obj.metadata.namespace.clone(), name: obj.metadata.name.clone()? })
    }
}

/// One change for a type cache. `Applied` carries the new object.
#[derive(Debug, Clone)]
pub struct Delta {
    pub key: ObjectKey,
    pub kind: ChangeKind,
    pub object: Option<Arc<DynamicObject>>,
}

impl Delta {
    pub fn applied(obj: DynamicObject) -> Option<Self> {
        let key = ObjectKey::of(&obj)?;
        Some(Self { key, kind: ChangeKind::Applied, object: Some(Arc::new(obj)) })
    }

    pub fn deleted(obj: &DynamicObject) -> Option<Self> {
        Some(Self { key: ObjectKey::of(obj)?, kind: ChangeKind::Deleted, object: None })
    }

    pub fn evict(key: ObjectKey) -> Self { Self { key, kind: ChangeKind::Deleted, object: None } }
}

/// Coalescing queue keyed by object with FIFO order. Later deltas for a key replace earlier ones.
pub struct Coalescer {
    map: FxHashMap<ObjectKey, Delta>,
    order: VecDeque<ObjectKey>,
    cap: usize,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1) }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }

    /// Queue a delta; returns true once the queue is at capacity and should be drained.
    pub fn push(&mut self, d: Delta) -> bool {
        if !self.map.contains_key(&d.key) {
            self.order.push_back(d.key.clone());
        }
        self.map.insert(d.key.clone(), d);
        self.order.len() >= self.cap
    }

    pub fn drain_ready(&mut self) -> Vec<Delta> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&key) {
                out.push(d);
            }
        }
        out
    }
}

/// Immutable view of one type's cache.
#[derive(Debug, Default)]
pub struct TypeSnapshot {
    pub epoch: u64,
    pub objects: FxHashMap<ObjectKey, Arc<DynamicObject>>,
}

impl TypeSnapshot {
    pub fn get(&self, key: &ObjectKey) -> Observed {
        match self.objects.get(key) {
            Some(o) => Observed::Present(Arc::clone(o)),
            None => Observed::Absent,
        }
    }

    /// Keys of objects whose controller owner is `primary`.
    pub fn owned_by(&self, primary: &PrimaryRef) -> Vec<ObjectKey> {
        let mut keys: Vec<_> = self
            .objects
            .iter()
            .filter(|(_, o)| controller_owner(&o.metadata).as_ref() == Some(primary))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

/// Applies delta batches for one type and produces snapshots plus change events.
pub struct TypeWorld {
    type_key: TypeKey,
    epoch: u64,
    objects: FxHashMap<ObjectKey, Arc<DynamicObject>>,
}

impl TypeWorld {
    pub fn new(type_key: TypeKey) -> Self { Self { type_key, epoch: 0, objects: FxHashMap::default() } }

    /// Apply a batch; returns one change event per delta, owner resolved from old or new object.
    pub fn apply(&mut self, batch: Vec<Delta>) -> Vec<ChangeEvent> {
        let mut events = Vec::with_capacity(batch.len());
        for d in batch {
            let owner = match (&d.kind, &d.object) {
                (ChangeKind::Applied, Some(o)) => {
                    let owner = controller_owner(&o.metadata);
                    self.objects.insert(d.key.clone(), Arc::clone(o));
                    owner
                }
                (ChangeKind::Applied, None) => continue,
                (ChangeKind::Deleted, _) => match self.objects.remove(&d.key) {
                    Some(prev) => controller_owner(&prev.metadata),
                    None => d.object.as_ref().and_then(|o| controller_owner(&o.metadata)),
                },
            };
            events.push(ChangeEvent {
                type_key: self.type_key.clone(),
                namespace: d.key.namespace.clone(),
                name: d.key.name.clone(),
                owner,
                kind: d.kind,
            });
        }
        self.epoch = self.epoch.saturating_add(1);
        events
    }

    pub fn freeze(&self) -> Arc<TypeSnapshot> {
        Arc::new(TypeSnapshot { epoch: self.epoch, objects: self.objects.clone() })
    }
}

#[derive(Clone)]
struct Subscriber {
    type_key: TypeKey,
    primary_kind: String,
    tx: mpsc::Sender<PrimaryRef>,
}

type Subscribers = Arc<RwLock<Vec<Subscriber>>>;

/// Shared handle to one type's cache and its ingest channel.
#[derive(Clone)]
pub struct TypeHandle {
    type_key: TypeKey,
    tx: mpsc::Sender<Delta>,
    snap: Arc<ArcSwap<TypeSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl TypeHandle {
    pub fn type_key(&self) -> &TypeKey { &self.type_key }
    pub fn sender(&self) -> mpsc::Sender<Delta> { self.tx.clone() }
    pub fn current(&self) -> Arc<TypeSnapshot> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    pub fn get(&self, namespace: Option<&str>, name: &str) -> Observed {
        self.snap.load().get(&ObjectKey::new(namespace, name))
    }

    /// Wait until the cache has reached `epoch`; false on timeout or closed ingest.
    pub async fn wait_for_epoch(&self, epoch: u64, timeout: Duration) -> bool {
        let mut rx = self.subscribe_epoch();
        let wait = async {
            while *rx.borrow_and_update() < epoch {
                if rx.changed().await.is_err() { return false; }
            }
            true
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }
}

/// Spawn the single-writer ingest loop for one type.
fn spawn_ingest(type_key: TypeKey, cap: usize, subscribers: Subscribers) -> TypeHandle {
    let (tx, mut rx) = mpsc::channel::<Delta>(cap);
    let snap = Arc::new(ArcSwap::from_pointee(TypeSnapshot::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let snap_clone = Arc::clone(&snap);
    let tk = type_key.clone();

    tokio::spawn(async move {
        let mut coalescer = Coalescer::with_capacity(cap);
        let mut world = TypeWorld::new(tk.clone());
        let mut ticker = tokio::time::interval(Duration::from_millis(8));
        let gvk = tk.gvk_key();
        loop {
            let flush = tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(d) => coalescer.push(d),
                    None => {
                        debug!(gvk = %gvk, "delta channel closed; draining and exiting ingest loop");
                        flush_batch(&mut coalescer, &mut world, &snap_clone, &epoch_tx, &subscribers).await;
                        break;
                    }
                },
                _ = ticker.tick() => true,
            };
            if flush {
                flush_batch(&mut coalescer, &mut world, &snap_clone, &epoch_tx, &subscribers).await;
            }
        }
        info!(gvk = %gvk, "ingest loop stopped");
    });

    TypeHandle { type_key, tx, snap, epoch_rx }
}

async fn flush_batch(
    coalescer: &mut Coalescer,
    world: &mut TypeWorld,
    snap: &ArcSwap<TypeSnapshot>,
    epoch_tx: &watch::Sender<u64>,
    subscribers: &Subscribers,
) {
    let batch = coalescer.drain_ready();
    if batch.is_empty() { return; }
    counter!("ingest_deltas", batch.len() as u64);
    let events = world.apply(batch);
    let next = world.freeze();
    let epoch = next.epoch;
    gauge!("cache_objects", next.objects.len() as f64, "gvk" => world.type_key.gvk_key());
    snap.store(next);
    let _ = epoch_tx.send(epoch);
    notify(&world.type_key, &events, subscribers).await;
}

/// Route one batch's events to subscribers of the owner's kind, once per owner per batch.
async fn notify(type_key: &TypeKey, events: &[ChangeEvent], subscribers: &Subscribers) {
    let owners: BTreeSet<&PrimaryRef> = events.iter().filter_map(|e| e.owner.as_ref()).collect();
    if owners.is_empty() { return; }
    let targets: Vec<Subscriber> = match subscribers.read() {
        Ok(subs) => subs.iter().filter(|s| &s.type_key == type_key).cloned().collect(),
        Err(poisoned) => poisoned.into_inner().iter().filter(|s| &s.type_key == type_key).cloned().collect(),
    };
    for owner in owners {
        for s in targets.iter().filter(|s| s.primary_kind == owner.kind) {
            if s.tx.send(owner.clone()).await.is_err() {
                warn!(gvk = %type_key, primary = %owner, "subscriber gone; dropping notification");
            } else {
                counter!("mux_notifications", 1u64);
            }
        }
    }
}

/// Registry of per-type caches plus subscriber routing.
#[derive(Clone)]
pub struct Multiplexer {
    types: Arc<RwLock<FxHashMap<TypeKey, TypeHandle>>>,
    subscribers: Subscribers,
    cap: usize,
}

impl Multiplexer {
    pub fn new(cap: usize) -> Self {
        Self { types: Arc::new(RwLock::new(FxHashMap::default())), subscribers: Arc::new(RwLock::new(Vec::new())), cap }
    }

    /// Register interest in a type. The first call spawns its ingest loop; later calls share it.
    /// Must be called within a tokio runtime.
    pub fn register(&self, type_key: &TypeKey) -> TypeHandle {
        let mut types = self.types.write().unwrap_or_else(|e| e.into_inner());
        if let Some(h) = types.get(type_key) {
            return h.clone();
        }
        let h = spawn_ingest(type_key.clone(), self.cap, Arc::clone(&self.subscribers));
        info!(gvk = %type_key, "type cache registered");
        types.insert(type_key.clone(), h.clone());
        h
    }

    pub fn handle(&self, type_key: &TypeKey) -> Option<TypeHandle> {
        self.types.read().unwrap_or_else(|e| e.into_inner()).get(type_key).cloned()
    }

    pub fn registered(&self) -> Vec<TypeKey> {
        let mut v: Vec<_> = self.types.read().unwrap_or_else(|e| e.into_inner()).keys().cloned().collect();
        v.sort();
        v
    }

    /// Deliver the owning primary of every change to `type_key` objects whose controller
    /// owner has kind `primary_kind`.
    pub fn subscribe(&self, type_key: &TypeKey, primary_kind: &str, tx: mpsc::Sender<PrimaryRef>) {
        self.register(type_key);
        self.subscribers.write().unwrap_or_else(|e| e.into_inner()).push(Subscriber {
            type_key: type_key.clone(),
            primary_kind: primary_kind.to_string(),
            tx,
        });
    }

    /// Drop every cached object owned by `primary` (the primary was deleted).
    pub async fn evict_owner(&self, primary: &PrimaryRef) -> usize {
        let handles: Vec<TypeHandle> = self.types.read().unwrap_or_else(|e| e.into_inner()).values().cloned().collect();
        let mut evicted = 0;
        for h in handles {
            for key in h.current().owned_by(primary) {
                if h.tx.send(Delta::evict(key)).await.is_ok() {
                    evicted += 1;
                }
            }
        }
        if evicted > 0 {
            debug!(primary = %primary, evicted, "evicted cached objects of deleted primary");
        }
        evicted
    }
}

impl ObservedCache for Multiplexer {
    fn lookup(&self, type_key: &TypeKey, namespace: Option<&str>, name: &str) -> Observed {
        match self.handle(type_key) {
            Some(h) => h.get(namespace, name),
            None => Observed::Absent,
        }
    }
}
