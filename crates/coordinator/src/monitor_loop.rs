//! Monitor Loop
//!
//! Owns the per-process lifecycle of the coordination plane.
//!
//! ## Role
//!
//! On `run`:
//!
//! 1. Register this server's record.
//! 2. Subscribe to the policies index monitor.
//! 3. On each tick, run the leader elector across all known policies.
//! 4. For every policy this server newly leads, spawn a policy
//!    coordinator and (when the policy sets an unenroll timeout) an
//!    unenroller; for every policy no longer led, stop them.
//! 5. On shutdown, stop all per-policy workers and release all leases.
//!
//! ## Event handling
//!
//! | Event | Action |
//! |---|---|
//! | New policy id seen | Add to the known set |
//! | Policy revision bumped | Deliver to the owning coordinator |
//! | Election won P | Spawn workers for P, start heartbeating |
//! | Election lost P | Stop workers for P |
//! | Policy timeout cleared | Cancel the unenroller for P only |
//! | Shutdown | Stop all workers, release all leases |
//!
//! Per-policy cancellation is tracked in a map from policy id to the
//! unenroller handle; `active_policies_canceller_count` is the live size
//! of that map and is what tests observe to prove that clearing a
//! timeout actually releases the tick resources.
//!
//! A failed election tick is logged and retried on the next tick; only a
//! fatal store error ends the loop early.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use fleet_common::config::Config;
use fleet_common::current_time_ms;
use fleet_common::model::{Policy, Server, ServerIdentity};
use fleet_common::store::{Credentials, DocStore, StoreError};

use crate::elector::{ElectionOutcome, LeaderElector};
use crate::monitor::{Change, IndexMonitor};
use crate::policy::{spawn_policy_coordinator, PolicyCoordinatorHandle, StrategyFactory};
use crate::unenroller::{Unenroller, UnenrollerHandle};

// ════════════════════════════════════════════════════════════════════════════
// CONFIG
// ════════════════════════════════════════════════════════════════════════════

/// Intervals and index names the loop operates with.
#[derive(Debug, Clone)]
pub struct MonitorLoopConfig {
    /// Election tick interval.
    pub check_interval: Duration,
    /// Unenroll scan interval handed to spawned unenrollers.
    pub unenroll_check_interval: Duration,
    /// Leadership lease TTL.
    pub lease_ttl: Duration,
    pub policies_index: String,
    pub leaders_index: String,
    pub agents_index: String,
    pub servers_index: String,
}

impl MonitorLoopConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            check_interval: cfg.coordinator.check_interval(),
            unenroll_check_interval: cfg.coordinator.unenroll_check_interval(),
            lease_ttl: cfg.coordinator.lease_ttl(),
            policies_index: cfg.store.policies(),
            leaders_index: cfg.store.leaders(),
            agents_index: cfg.store.agents(),
            servers_index: cfg.store.servers(),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// MONITOR LOOP
// ════════════════════════════════════════════════════════════════════════════

/// Per-policy worker handles owned by the loop.
struct PolicyWorkers {
    coordinator: PolicyCoordinatorHandle,
}

/// The process-lifetime owner of the coordination plane.
pub struct MonitorLoop {
    cfg: MonitorLoopConfig,
    identity: ServerIdentity,
    store: Arc<dyn DocStore>,
    credentials: Arc<dyn Credentials>,
    monitor: Arc<IndexMonitor>,
    elector: LeaderElector,
    strategy_factory: StrategyFactory,
    /// Latest revision seen per policy id (the known set).
    policies: RwLock<HashMap<String, Policy>>,
    /// Coordinator workers for policies this server leads.
    workers: Mutex<HashMap<String, PolicyWorkers>>,
    /// Unenroller cancellers, keyed by policy id. Only policies that are
    /// led *and* carry a timeout appear here.
    unenrollers: Mutex<HashMap<String, UnenrollerHandle>>,
}

impl MonitorLoop {
    pub fn new(
        cfg: MonitorLoopConfig,
        identity: ServerIdentity,
        store: Arc<dyn DocStore>,
        credentials: Arc<dyn Credentials>,
        monitor: Arc<IndexMonitor>,
        strategy_factory: StrategyFactory,
    ) -> Self {
        let elector = LeaderElector::new(
            identity.agent_id.clone(),
            cfg.leaders_index.clone(),
            Arc::clone(&store),
            cfg.lease_ttl,
        );
        Self {
            cfg,
            identity,
            store,
            credentials,
            monitor,
            elector,
            strategy_factory,
            policies: RwLock::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            unenrollers: Mutex::new(HashMap::new()),
        }
    }

    /// Number of policies currently known to this server.
    pub fn known_policy_count(&self) -> usize {
        self.policies.read().len()
    }

    /// Live unenroller cancellers. Reaches zero for a policy once its
    /// timeout is cleared or its leadership is lost.
    pub fn active_policies_canceller_count(&self) -> usize {
        self.unenrollers.lock().len()
    }

    /// Policies this server currently leads.
    pub fn led_policies(&self) -> Vec<String> {
        self.elector.held()
    }

    // ────────────────────────────────────────────────────────────────────
    // RUN LOOP
    // ────────────────────────────────────────────────────────────────────

    /// Run until `shutdown` fires or the store fails fatally.
    pub async fn run(&self, shutdown: Arc<Notify>) -> Result<(), StoreError> {
        info!(server_id = %self.identity.agent_id, "monitor loop starting");

        if let Err(err) = self.register_server().await {
            // Registration is advisory; leadership does not depend on it.
            warn!(error = %err, "server registration failed");
        }

        let mut subscription = self.monitor.subscribe();
        let mut tick = tokio::time::interval(self.cfg.check_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                _ = shutdown.notified() => break Ok(()),
                _ = tick.tick() => {
                    if let Err(err) = self.election_tick().await {
                        if matches!(err, StoreError::Fatal(_)) {
                            break Err(err);
                        }
                        warn!(error = %err, "election tick failed, retrying next tick");
                    }
                }
                change = subscription.next() => {
                    match change {
                        Some(change) => self.handle_change(change).await,
                        None => {
                            // monitor stopped (or dropped us as a slow
                            // consumer); elections continue on known state
                            warn!("policy subscription closed");
                            subscription = self.monitor.subscribe();
                        }
                    }
                }
            }
        };

        self.stop_all_workers().await;
        self.elector.release_all().await;
        info!(server_id = %self.identity.agent_id, "monitor loop stopped");
        result
    }

    async fn register_server(&self) -> Result<(), StoreError> {
        let server = Server {
            identity: self.identity.clone(),
            updated_at: current_time_ms(),
        };
        let body = serde_json::to_value(&server)
            .map_err(|e| StoreError::Fatal(format!("cannot serialize server record: {e}")))?;
        self.store
            .index(&self.cfg.servers_index, &self.identity.agent_id, body)
            .await?;
        debug!(server_id = %self.identity.agent_id, "server record registered");
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────
    // CHANGE HANDLING
    // ────────────────────────────────────────────────────────────────────

    async fn handle_change(&self, change: Change) {
        let policy: Policy = match serde_json::from_value(change.body) {
            Ok(policy) => policy,
            Err(err) => {
                warn!(doc_id = %change.id, error = %err, "ignoring malformed policy document");
                return;
            }
        };
        let policy_id = policy.policy_id.clone();

        let is_new = {
            let mut policies = self.policies.write();
            match policies.get(&policy_id) {
                Some(known)
                    if (known.revision_idx, known.coordinator_idx)
                        >= (policy.revision_idx, policy.coordinator_idx) =>
                {
                    // stale or duplicate delivery
                    return;
                }
                Some(_) => {
                    policies.insert(policy_id.clone(), policy.clone());
                    false
                }
                None => {
                    policies.insert(policy_id.clone(), policy.clone());
                    true
                }
            }
        };
        if is_new {
            debug!(policy_id = %policy_id, "new policy id seen");
        }

        if !self.elector.is_leader(&policy_id) {
            return;
        }

        // Route uncoordinated input revisions to the owning coordinator.
        if policy.coordinator_idx == 0 {
            let workers = self.workers.lock();
            if let Some(w) = workers.get(&policy_id) {
                if !w.coordinator.deliver(policy.clone()) {
                    warn!(policy_id = %policy_id, "coordinator queue full, dropping revision");
                }
            }
        }

        // A revision may set or clear the unenroll timeout.
        self.reconcile_unenroller(&policy_id, policy.unenroll_timeout);
    }

    // ────────────────────────────────────────────────────────────────────
    // ELECTIONS & WORKER LIFECYCLE
    // ────────────────────────────────────────────────────────────────────

    async fn election_tick(&self) -> Result<(), StoreError> {
        let policy_ids: Vec<String> = self.policies.read().keys().cloned().collect();
        let mut last_err = None;

        for policy_id in policy_ids {
            match self.elector.elect(&policy_id).await {
                Ok(ElectionOutcome::Acquired) => self.start_workers(&policy_id),
                Ok(ElectionOutcome::Retained) => {
                    // idempotent: repair workers lost to a panic
                    self.start_workers(&policy_id);
                }
                Ok(ElectionOutcome::Follower) | Ok(ElectionOutcome::Lost) => {
                    self.stop_workers(&policy_id).await;
                }
                Err(err) => {
                    warn!(policy_id = %policy_id, error = %err, "election attempt failed");
                    last_err = Some(err);
                }
            }
        }

        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Idempotently ensure workers exist for a policy this server leads.
    fn start_workers(&self, policy_id: &str) {
        let latest = self.policies.read().get(policy_id).cloned();
        let Some(latest) = latest else { return };

        {
            let mut workers = self.workers.lock();
            if !workers.contains_key(policy_id) {
                let coordinator = spawn_policy_coordinator(
                    policy_id.to_string(),
                    self.cfg.policies_index.clone(),
                    Arc::clone(&self.store),
                    (self.strategy_factory)(),
                );
                // hand the newest uncoordinated revision to the fresh
                // worker; its change event may have predated leadership
                if latest.coordinator_idx == 0 {
                    coordinator.deliver(latest.clone());
                }
                workers.insert(policy_id.to_string(), PolicyWorkers { coordinator });
                info!(policy_id = %policy_id, "policy workers started");
            }
        }

        self.reconcile_unenroller(policy_id, latest.unenroll_timeout);
    }

    /// Stop the coordinator and unenroller for one policy, if running.
    async fn stop_workers(&self, policy_id: &str) {
        let workers = self.workers.lock().remove(policy_id);
        if let Some(w) = workers {
            w.coordinator.stop().await;
            info!(policy_id = %policy_id, "policy workers stopped");
        }
        let unenroller = self.unenrollers.lock().remove(policy_id);
        if let Some(u) = unenroller {
            u.stop().await;
        }
    }

    /// Bring the unenroller for a led policy in line with its timeout:
    /// spawn when a timeout is set, cancel when it is cleared.
    fn reconcile_unenroller(&self, policy_id: &str, timeout_secs: u64) {
        let mut unenrollers = self.unenrollers.lock();
        match (timeout_secs, unenrollers.contains_key(policy_id)) {
            (0, true) => {
                if let Some(handle) = unenrollers.remove(policy_id) {
                    // cancellation must not wait on the scan loop
                    tokio::spawn(async move { handle.stop().await });
                    info!(policy_id = %policy_id, "unenroll timeout cleared, canceller released");
                }
            }
            (t, false) if t > 0 => {
                let handle = Unenroller::new(
                    policy_id,
                    self.cfg.agents_index.clone(),
                    Arc::clone(&self.store),
                    Arc::clone(&self.credentials),
                    t,
                    self.cfg.unenroll_check_interval,
                )
                .spawn();
                unenrollers.insert(policy_id.to_string(), handle);
            }
            _ => {}
        }
    }

    async fn stop_all_workers(&self) {
        let workers: Vec<_> = {
            let mut map = self.workers.lock();
            map.drain().collect()
        };
        for (policy_id, w) in workers {
            w.coordinator.stop().await;
            debug!(policy_id = %policy_id, "coordinator stopped on shutdown");
        }
        let unenrollers: Vec<_> = {
            let mut map = self.unenrollers.lock();
            map.drain().collect()
        };
        for (policy_id, u) in unenrollers {
            u.stop().await;
            debug!(policy_id = %policy_id, "unenroller stopped on shutdown");
        }
    }
}
