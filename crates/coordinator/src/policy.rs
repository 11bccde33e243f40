//! Policy Coordinator
//!
//! A pluggable strategy invoked per owned policy, plus the per-policy
//! worker task that feeds it.
//!
//! The policies collection is an append log: every revision is a new
//! document. The monitor loop routes *uncoordinated* input revisions
//! (`coordinator_idx == 0`) to the worker of the policy's current leader;
//! the worker asks its strategy for a revised document and republishes it
//! as a new entry. Coordinated outputs (`coordinator_idx ≥ 1`) are never
//! routed back, which is what keeps the write loop from feeding itself.
//!
//! Emitted revisions always satisfy `coordinator_idx ≥ 1`, and
//! `(policy_id, revision_idx, coordinator_idx)` stays unique because the
//! strategy only ever moves `coordinator_idx` forward for a given input.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fleet_common::model::Policy;
use fleet_common::store::DocStore;

// ════════════════════════════════════════════════════════════════════════════
// COORDINATOR STRATEGY
// ════════════════════════════════════════════════════════════════════════════

/// Derives an output policy revision from an input revision.
///
/// `None` means the input needs no republication. Strategies may keep
/// per-policy state; each worker owns exactly one strategy instance for
/// exactly one policy id.
pub trait CoordinatorStrategy: Send {
    /// Strategy name, for logs.
    fn name(&self) -> &'static str;

    /// Derive the output revision for one input revision.
    fn revise(&mut self, policy: Policy) -> Option<Policy>;
}

/// Factory invoked once per owned policy.
pub type StrategyFactory = Arc<dyn Fn() -> Box<dyn CoordinatorStrategy> + Send + Sync>;

/// Forwards the input unchanged, stamping `coordinator_idx = 1`.
///
/// The minimal strategy: it marks revisions as coordinated without
/// transforming them.
#[derive(Debug, Default)]
pub struct CoordinatorZero;

impl CoordinatorStrategy for CoordinatorZero {
    fn name(&self) -> &'static str {
        "zero"
    }

    fn revise(&mut self, mut policy: Policy) -> Option<Policy> {
        if policy.coordinator_idx != 0 {
            return None;
        }
        policy.coordinator_idx = 1;
        Some(policy)
    }
}

/// Reference strategy: each new input revision is republished with the
/// next coordinator index.
#[derive(Debug, Default)]
pub struct CoordinatorMonotonic {
    last_coordinator_idx: i64,
}

impl CoordinatorStrategy for CoordinatorMonotonic {
    fn name(&self) -> &'static str {
        "monotonic"
    }

    fn revise(&mut self, mut policy: Policy) -> Option<Policy> {
        if policy.coordinator_idx != 0 {
            return None;
        }
        self.last_coordinator_idx += 1;
        policy.coordinator_idx = self.last_coordinator_idx;
        Some(policy)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// POLICY COORDINATOR WORKER
// ════════════════════════════════════════════════════════════════════════════

/// Handle to a spawned per-policy coordinator task.
pub struct PolicyCoordinatorHandle {
    tx: mpsc::Sender<Policy>,
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

impl PolicyCoordinatorHandle {
    /// Queue an input revision for coordination.
    pub fn deliver(&self, policy: Policy) -> bool {
        self.tx.try_send(policy).is_ok()
    }

    /// Stop the worker: in-flight emissions are flushed before exit.
    pub async fn stop(self) {
        self.shutdown.notify_one();
        drop(self.tx);
        let _ = self.join.await;
    }
}

/// Spawn the coordinator worker for one policy.
///
/// The worker consumes input revisions from its channel, applies the
/// strategy, and appends each emission to the policies index under a
/// fresh document id. A failed write is logged and dropped; the next
/// input revision supersedes it.
pub fn spawn_policy_coordinator(
    policy_id: String,
    policies_index: String,
    store: Arc<dyn DocStore>,
    mut strategy: Box<dyn CoordinatorStrategy>,
) -> PolicyCoordinatorHandle {
    let (tx, mut rx) = mpsc::channel::<Policy>(16);
    let shutdown = Arc::new(Notify::new());
    let shutdown_rx = Arc::clone(&shutdown);

    let join = tokio::spawn(async move {
        info!(policy_id = %policy_id, strategy = strategy.name(), "policy coordinator started");
        loop {
            tokio::select! {
                _ = shutdown_rx.notified() => {
                    // flush whatever is already queued, then exit
                    while let Ok(policy) = rx.try_recv() {
                        coordinate(&policies_index, &store, strategy.as_mut(), policy).await;
                    }
                    break;
                }
                received = rx.recv() => {
                    match received {
                        Some(policy) => {
                            coordinate(&policies_index, &store, strategy.as_mut(), policy).await;
                        }
                        None => break,
                    }
                }
            }
        }
        debug!(policy_id = %policy_id, "policy coordinator stopped");
    });

    PolicyCoordinatorHandle { tx, shutdown, join }
}

async fn coordinate(
    policies_index: &str,
    store: &Arc<dyn DocStore>,
    strategy: &mut dyn CoordinatorStrategy,
    policy: Policy,
) {
    let policy_id = policy.policy_id.clone();
    let revision_idx = policy.revision_idx;
    let Some(output) = strategy.revise(policy) else {
        return;
    };

    debug!(
        policy_id = %policy_id,
        revision_idx,
        coordinator_idx = output.coordinator_idx,
        "republishing coordinated policy"
    );

    let doc_id = Uuid::new_v4().to_string();
    let body = match serde_json::to_value(&output) {
        Ok(body) => body,
        Err(err) => {
            warn!(policy_id = %policy_id, error = %err, "cannot serialize policy emission");
            return;
        }
    };
    if let Err(err) = store.create(policies_index, &doc_id, body).await {
        warn!(policy_id = %policy_id, error = %err, "policy emission write failed");
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::store::Query;
    use fleet_common::MemStore;
    use std::time::Duration;

    const POLICIES: &str = ".fleet-policies";

    fn policy(id: &str, revision_idx: i64, coordinator_idx: i64) -> Policy {
        Policy {
            policy_id: id.to_string(),
            revision_idx,
            coordinator_idx,
            data: serde_json::json!({}),
            unenroll_timeout: 0,
            checkin_timeout: 0,
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // A. STRATEGIES
    // ────────────────────────────────────────────────────────────────────

    #[test]
    fn test_zero_stamps_coordinator_idx_one() {
        let mut zero = CoordinatorZero;
        let out = zero.revise(policy("p1", 1, 0)).expect("emission");
        assert_eq!(out.coordinator_idx, 1);
        assert_eq!(out.revision_idx, 1);
    }

    #[test]
    fn test_zero_ignores_coordinated_input() {
        let mut zero = CoordinatorZero;
        assert!(zero.revise(policy("p1", 1, 1)).is_none());
    }

    #[test]
    fn test_monotonic_increments_per_revision() {
        let mut strategy = CoordinatorMonotonic::default();
        let first = strategy.revise(policy("p1", 1, 0)).expect("emission");
        let second = strategy.revise(policy("p1", 2, 0)).expect("emission");
        assert_eq!(first.coordinator_idx, 1);
        assert_eq!(second.coordinator_idx, 2);
        // every emission satisfies the >= 1 floor
        assert!(first.coordinator_idx >= 1 && second.coordinator_idx >= 1);
    }

    #[test]
    fn test_monotonic_triples_unique() {
        let mut strategy = CoordinatorMonotonic::default();
        let a = strategy.revise(policy("p1", 1, 0)).unwrap();
        let b = strategy.revise(policy("p1", 2, 0)).unwrap();
        assert_ne!(
            (a.revision_idx, a.coordinator_idx),
            (b.revision_idx, b.coordinator_idx)
        );
    }

    // ────────────────────────────────────────────────────────────────────
    // B. WORKER TASK
    // ────────────────────────────────────────────────────────────────────

    async fn latest_emission(store: &MemStore, policy_id: &str) -> Option<Policy> {
        let hits = store
            .search(POLICIES, &Query::LatestN { size: 100 })
            .await
            .unwrap();
        hits.into_iter()
            .filter_map(|h| serde_json::from_value::<Policy>(h.body).ok())
            .filter(|p| p.policy_id == policy_id && p.coordinator_idx >= 1)
            .next_back()
    }

    #[tokio::test]
    async fn test_worker_republishes_coordinated_revision() {
        let store = Arc::new(MemStore::new());
        let handle = spawn_policy_coordinator(
            "p1".to_string(),
            POLICIES.to_string(),
            Arc::clone(&store) as _,
            Box::new(CoordinatorZero),
        );

        assert!(handle.deliver(policy("p1", 1, 0)));

        let mut out = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            out = latest_emission(&store, "p1").await;
            if out.is_some() {
                break;
            }
        }
        let out = out.expect("coordinated emission appears in the index");
        assert_eq!(out.revision_idx, 1);
        assert_eq!(out.coordinator_idx, 1);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_worker_flushes_queued_input_on_stop() {
        let store = Arc::new(MemStore::new());
        let handle = spawn_policy_coordinator(
            "p1".to_string(),
            POLICIES.to_string(),
            Arc::clone(&store) as _,
            Box::new(CoordinatorMonotonic::default()),
        );

        handle.deliver(policy("p1", 1, 0));
        handle.deliver(policy("p1", 2, 0));
        handle.stop().await;

        let out = latest_emission(&store, "p1").await.expect("flushed");
        assert_eq!(out.revision_idx, 2);
        assert_eq!(out.coordinator_idx, 2);
    }

    #[tokio::test]
    async fn test_worker_write_failure_is_non_fatal() {
        let store = Arc::new(MemStore::new());
        store.inject_failure(fleet_common::StoreError::Transient("down".to_string()));

        let handle = spawn_policy_coordinator(
            "p1".to_string(),
            POLICIES.to_string(),
            Arc::clone(&store) as _,
            Box::new(CoordinatorZero),
        );
        handle.deliver(policy("p1", 1, 0));
        tokio::time::sleep(Duration::from_millis(50)).await;
        // worker survived the failed write and keeps processing
        handle.deliver(policy("p1", 2, 0));
        handle.stop().await;

        let out = latest_emission(&store, "p1").await.expect("second emission landed");
        assert_eq!(out.revision_idx, 2);
    }
}
