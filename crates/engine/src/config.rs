//! Engine configuration from environment variables.

use std::time::Duration;

use crate::Requeue;

/// How long to wait before re-running a primary after a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequeuePolicy {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub not_ready_after: Duration,
    /// Stop failure requeues after this many consecutive failed passes. None = unlimited.
    pub max_retries: Option<u32>,
}

impl Default for RequeuePolicy {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(300),
            not_ready_after: Duration::from_secs(10),
            max_retries: None,
        }
    }
}

impl RequeuePolicy {
    /// Delay before the next pass; `attempt` is the number of consecutive failures including this one.
    pub fn delay(&self, requeue: Requeue, attempt: u32) -> Option<Duration> {
        match requeue {
            Requeue::Done => None,
            Requeue::NotReady => Some(self.not_ready_after),
            Requeue::Failed => {
                if self.max_retries.is_some_and(|max| attempt > max) {
                    return None;
                }
                let exp = attempt.saturating_sub(1).min(20);
                Some(self.backoff_base.saturating_mul(1u32 << exp).min(self.backoff_max))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub apply_timeout: Duration,
    pub policy: RequeuePolicy,
    pub workers: usize,
    pub queue_cap: usize,
    pub status_conflict_retries: u32,
    /// Restrict watches to one namespace. None = all namespaces.
    pub namespace: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            apply_timeout: Duration::from_secs(10),
            policy: RequeuePolicy::default(),
            workers: 4,
            queue_cap: 2048,
            status_conflict_retries: 3,
            namespace: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    /// Build from any key lookup; unparsable values fall back to defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let num = |k: &str| get(k).and_then(|s| s.trim().parse::<u64>().ok());
        Self {
            apply_timeout: num("KILN_APPLY_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.apply_timeout),
            policy: RequeuePolicy {
                backoff_base: num("KILN_BACKOFF_BASE_MS").map(Duration::from_millis).unwrap_or(d.policy.backoff_base),
                backoff_max: num("KILN_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.policy.backoff_max),
                not_ready_after: num("KILN_NOT_READY_REQUEUE_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(d.policy.not_ready_after),
                max_retries: num("KILN_MAX_RETRIES").map(|n| n.min(u32::MAX as u64) as u32),
            },
            workers: num("KILN_WORKERS").map(|n| (n as usize).max(1)).unwrap_or(d.workers),
            queue_cap: num("KILN_QUEUE_CAP").map(|n| (n as usize).max(1)).unwrap_or(d.queue_cap),
            status_conflict_retries: num("KILN_STATUS_CONFLICT_RETRIES")
                .map(|n| n.min(u32::MAX as u64) as u32)
                .unwrap_or(d.status_conflict_retries),
            namespace: get("KILN_NAMESPACE").filter(|s| !s.trim().is_empty()),
        }
    }
}
