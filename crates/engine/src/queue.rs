//! Per-primary work queue: coalesces triggers, bounds parallelism and schedules requeues.
//!
//! At most one pass runs per primary. A trigger that arrives while a pass is running
//! marks the primary pending and it runs once more as soon as the pass finishes.
//! After shutdown, passes still waiting for a worker slot are dropped unrun.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kiln_core::PrimaryRef;
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::{Requeue, RequeuePolicy};

/// Something that can run one pass for a primary.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, primary: &PrimaryRef) -> Requeue;
}

enum Msg {
    Trigger(PrimaryRef),
    Timer(PrimaryRef, u64),
    Finished(PrimaryRef, Requeue),
    Shutdown,
}

#[derive(Default)]
struct Entry {
    running: bool,
    pending: bool,
    attempts: u32,
    /// Bumped whenever scheduled timers become obsolete.
    timer_gen: u64,
}

/// Handle for feeding triggers into a running queue.
#[derive(Clone)]
pub struct QueueHandle {
    triggers: mpsc::Sender<PrimaryRef>,
    control: mpsc::Sender<Msg>,
    permits: Arc<Semaphore>,
    closed: Arc<AtomicBool>,
    workers: u32,
}

impl QueueHandle {
    /// Enqueue a pass for `primary`. Returns false once the queue is shut down.
    pub async fn trigger(&self, primary: PrimaryRef) -> bool { self.triggers.send(primary).await.is_ok() }

    /// Sender usable as a multiplexer subscription target.
    pub fn sender(&self) -> mpsc::Sender<PrimaryRef> { self.triggers.clone() }

    /// Stop dispatching; waits for in-flight passes to finish. Passes not yet started never run.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.control.send(Msg::Shutdown).await;
        if let Ok(all) = self.permits.acquire_many(self.workers).await {
            drop(all);
        }
    }
}

pub struct WorkQueue;

impl WorkQueue {
    /// Start the dispatcher. Must be called within a tokio runtime.
    pub fn spawn<R: Reconciler>(reconciler: Arc<R>, policy: RequeuePolicy, workers: usize, cap: usize) -> QueueHandle {
        let workers = workers.clamp(1, Semaphore::MAX_PERMITS.min(u32::MAX as usize)) as u32;
        let cap = cap.max(1);
        let (trig_tx, mut trig_rx) = mpsc::channel::<PrimaryRef>(cap);
        let (tx, rx) = mpsc::channel::<Msg>(cap);
        let permits = Arc::new(Semaphore::new(workers as usize));
        let closed = Arc::new(AtomicBool::new(false));

        let fwd = tx.clone();
        tokio::spawn(async move {
            while let Some(p) = trig_rx.recv().await {
                if fwd.send(Msg::Trigger(p)).await.is_err() {
                    break;
                }
            }
        });

        let d = Dispatcher {
            reconciler,
            policy,
            permits: Arc::clone(&permits),
            closed: Arc::clone(&closed),
            tx: tx.clone(),
            entries: FxHashMap::default(),
        };
        tokio::spawn(d.run(rx));
        QueueHandle { triggers: trig_tx, control: tx, permits, closed, workers }
    }
}

struct Dispatcher<R> {
    reconciler: Arc<R>,
    policy: RequeuePolicy,
    permits: Arc<Semaphore>,
    closed: Arc<AtomicBool>,
    tx: mpsc::Sender<Msg>,
    entries: FxHashMap<PrimaryRef, Entry>,
}

impl<R: Reconciler> Dispatcher<R> {
    async fn run(mut self, mut rx: mpsc::Receiver<Msg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                Msg::Trigger(p) => {
                    counter!("queue_triggers", 1u64);
                    self.request(p);
                }
                Msg::Timer(p, gen) => {
                    if self.entries.get(&p).is_some_and(|e| e.timer_gen == gen) {
                        self.request(p);
                    }
                }
                Msg::Finished(p, r) => self.finished(p, r),
                Msg::Shutdown => {
                    info!(tracked = self.entries.len(), "work queue shutting down");
                    break;
                }
            }
            gauge!("queue_tracked", self.entries.len() as f64);
        }
    }

    fn request(&mut self, p: PrimaryRef) {
        let e = self.entries.entry(p.clone()).or_default();
        if e.running {
            if !e.pending {
                counter!("queue_coalesced", 1u64);
            }
            e.pending = true;
            return;
        }
        e.running = true;
        e.timer_gen += 1;
        self.start(p);
    }

    fn start(&self, p: PrimaryRef) {
        let reconciler = Arc::clone(&self.reconciler);
        let permits = Arc::clone(&self.permits);
        let closed = Arc::clone(&self.closed);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else { return };
            if closed.load(Ordering::SeqCst) {
                debug!(primary = %p, "queue closed; dropping pass");
                return;
            }
            let r = reconciler.reconcile(&p).await;
            let _ = tx.send(Msg::Finished(p, r)).await;
        });
    }

    fn finished(&mut self, p: PrimaryRef, r: Requeue) {
        let Some(e) = self.entries.get_mut(&p) else { return };
        e.running = false;
        e.attempts = if r == Requeue::Failed { e.attempts.saturating_add(1) } else { 0 };
        if e.pending {
            e.pending = false;
            e.running = true;
            e.timer_gen += 1;
            debug!(primary = %p, "re-running pending trigger");
            self.start(p);
            return;
        }
        match self.policy.delay(r, e.attempts) {
            Some(delay) => {
                e.timer_gen += 1;
                let gen = e.timer_gen;
                debug!(primary = %p, result = r.as_str(), attempt = e.attempts, delay_ms = delay.as_millis() as u64, "requeue scheduled");
                self.schedule(p, gen, delay);
            }
            None => {
                if r == Requeue::Failed {
                    warn!(primary = %p, attempts = e.attempts, "giving up until next trigger");
                } else {
                    self.entries.remove(&p);
                }
            }
        }
    }

    fn schedule(&self, p: PrimaryRef, gen: u64, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Msg::Timer(p, gen)).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct Scripted {
        results: Mutex<Vec<Requeue>>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        gate: Semaphore,
    }

    impl Scripted {
        fn new(results: Vec<Requeue>, open: bool) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                gate: Semaphore::new(if open { Semaphore::MAX_PERMITS } else { 0 }),
            })
        }
        fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
    }

    #[async_trait::async_trait]
    impl Reconciler for Scripted {
        async fn reconcile(&self, _primary: &PrimaryRef) -> Requeue {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let permit = self.gate.acquire().await.unwrap();
            permit.forget();
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let mut r = self.results.lock().unwrap();
            if r.is_empty() { Requeue::Done } else { r.remove(0) }
        }
    }

    fn p(name: &str) -> PrimaryRef { PrimaryRef::new("Plane", Some("apps"), name) }

    async fn settle() { tokio::time::sleep(Duration::from_millis(50)).await; }

    #[tokio::test(start_paused = true)]
    async fn trigger_during_pass_runs_exactly_once_more() {
        let rec = Scripted::new(vec![], false);
        let q = WorkQueue::spawn(Arc::clone(&rec), RequeuePolicy::default(), 4, 16);
        q.trigger(p("a")).await;
        settle().await;
        assert_eq!(rec.calls(), 1);
        for _ in 0..5 {
            q.trigger(p("a")).await;
        }
        settle().await;
        assert_eq!(rec.calls(), 1);
        rec.gate.add_permits(100);
        settle().await;
        assert_eq!(rec.calls(), 2);
        assert_eq!(rec.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_primaries_run_in_parallel_up_to_workers() {
        let rec = Scripted::new(vec![], false);
        let q = WorkQueue::spawn(Arc::clone(&rec), RequeuePolicy::default(), 2, 16);
        for n in ["a", "b", "c"] {
            q.trigger(p(n)).await;
        }
        settle().await;
        assert_eq!(rec.calls(), 2);
        rec.gate.add_permits(100);
        settle().await;
        assert_eq!(rec.calls(), 3);
        assert_eq!(rec.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn not_ready_requeues_after_fixed_delay() {
        let rec = Scripted::new(vec![Requeue::NotReady, Requeue::NotReady], true);
        let policy = RequeuePolicy { not_ready_after: Duration::from_secs(10), ..Default::default() };
        let q = WorkQueue::spawn(Arc::clone(&rec), policy, 1, 16);
        q.trigger(p("a")).await;
        settle().await;
        assert_eq!(rec.calls(), 1);
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(rec.calls(), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rec.calls(), 2);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(rec.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_back_off_and_stop_at_max_retries() {
        let rec = Scripted::new(vec![Requeue::Failed; 10], true);
        let policy = RequeuePolicy {
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            max_retries: Some(2),
            ..Default::default()
        };
        let q = WorkQueue::spawn(Arc::clone(&rec), policy, 1, 16);
        q.trigger(p("a")).await;
        settle().await;
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(rec.calls(), 2);
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(rec.calls(), 3);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(rec.calls(), 3);

        // an external trigger gets one more attempt
        q.trigger(p("a")).await;
        settle().await;
        assert_eq!(rec.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn external_trigger_supersedes_scheduled_requeue() {
        let rec = Scripted::new(vec![Requeue::NotReady], true);
        let policy = RequeuePolicy { not_ready_after: Duration::from_secs(10), ..Default::default() };
        let q = WorkQueue::spawn(Arc::clone(&rec), policy, 1, 16);
        q.trigger(p("a")).await;
        settle().await;
        q.trigger(p("a")).await;
        settle().await;
        assert_eq!(rec.calls(), 2);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(rec.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_dispatch() {
        let rec = Scripted::new(vec![], true);
        let q = WorkQueue::spawn(Arc::clone(&rec), RequeuePolicy::default(), 2, 16);
        q.trigger(p("a")).await;
        settle().await;
        q.shutdown().await;
        q.trigger(p("b")).await;
        settle().await;
        assert_eq!(rec.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drops_passes_waiting_for_a_worker() {
        let rec = Scripted::new(vec![], false);
        let q = WorkQueue::spawn(Arc::clone(&rec), RequeuePolicy::default(), 1, 16);
        for n in ["a", "b", "c"] {
            q.trigger(p(n)).await;
        }
        settle().await;
        assert_eq!(rec.calls(), 1);

        let stopping = tokio::spawn({
            let q = q.clone();
            async move { q.shutdown().await }
        });
        settle().await;
        assert!(!stopping.is_finished(), "shutdown waits for the running pass");
        rec.gate.add_permits(100);
        stopping.await.unwrap();
        settle().await;
        assert_eq!(rec.calls(), 1);
    }
}
