//! Unenroller
//!
//! Per-policy periodic scan that retires agents idle past their policy's
//! `unenroll_timeout`.
//!
//! ## Scan
//!
//! 1. Query agents with `policy_id == P && active == true`.
//! 2. For each candidate compute `idle = now - last_activity`, where
//!    `last_activity = max(last_checkin, updated_at, enrolled_at)`.
//! 3. Past the timeout: flip the document to inactive with a versioned
//!    update (`active = false`, `unenrolled_at = now`,
//!    `unenrolled_reason = "timeout"`), then invalidate the agent's
//!    access credential and every per-output credential.
//!
//! The read and update are not transactional; the update is predicated on
//! the document version observed by the scan, and a conflict simply
//! leaves the agent for the next tick. Credential invalidation is
//! fire-and-forget: a failure is logged and never rolls back the
//! document update. The agent document is the source of truth.
//!
//! A policy whose timeout is cleared (`>0 → 0`) gets its unenroller task
//! cancelled by the monitor loop; this module only runs while a timeout
//! is set.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fleet_common::current_time_ms;
use fleet_common::model::{Agent, UNENROLLED_REASON_TIMEOUT};
use fleet_common::store::{Credentials, DocStore, Query, StoreError};

// ════════════════════════════════════════════════════════════════════════════
// UNENROLLER
// ════════════════════════════════════════════════════════════════════════════

/// Periodic inactivity scanner for one policy.
pub struct Unenroller {
    policy_id: String,
    agents_index: String,
    store: Arc<dyn DocStore>,
    credentials: Arc<dyn Credentials>,
    /// Inactivity window in seconds; always > 0 while this task exists.
    timeout_secs: u64,
    interval: Duration,
}

/// Handle to a spawned unenroller task.
pub struct UnenrollerHandle {
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

impl UnenrollerHandle {
    /// Stop the scanner and release its tick resources.
    pub async fn stop(self) {
        self.shutdown.notify_one();
        let _ = self.join.await;
    }
}

impl Unenroller {
    pub fn new(
        policy_id: impl Into<String>,
        agents_index: impl Into<String>,
        store: Arc<dyn DocStore>,
        credentials: Arc<dyn Credentials>,
        timeout_secs: u64,
        interval: Duration,
    ) -> Self {
        Self {
            policy_id: policy_id.into(),
            agents_index: agents_index.into(),
            store,
            credentials,
            timeout_secs,
            interval,
        }
    }

    /// Spawn the periodic scan loop.
    pub fn spawn(self) -> UnenrollerHandle {
        let shutdown = Arc::new(Notify::new());
        let shutdown_rx = Arc::clone(&shutdown);

        let join = tokio::spawn(async move {
            info!(
                policy_id = %self.policy_id,
                timeout_secs = self.timeout_secs,
                "unenroller started"
            );
            loop {
                tokio::select! {
                    _ = shutdown_rx.notified() => break,
                    _ = tokio::time::sleep(self.interval) => {
                        if let Err(err) = self.run_once().await {
                            warn!(policy_id = %self.policy_id, error = %err, "unenroll scan failed");
                        }
                    }
                }
            }
            debug!(policy_id = %self.policy_id, "unenroller stopped");
        });

        UnenrollerHandle { shutdown, join }
    }

    /// One scan pass. Visible for tests.
    pub async fn run_once(&self) -> Result<usize, StoreError> {
        let hits = self
            .store
            .search(
                &self.agents_index,
                &Query::ActiveAgentsByPolicy {
                    policy_id: self.policy_id.clone(),
                },
            )
            .await?;

        let now = current_time_ms();
        let threshold_ms = self.timeout_secs.saturating_mul(1_000);
        let mut retired = 0;

        for hit in hits {
            let mut agent: Agent = match serde_json::from_value(hit.body) {
                Ok(agent) => agent,
                Err(err) => {
                    warn!(doc_id = %hit.id, error = %err, "skipping malformed agent document");
                    continue;
                }
            };

            let idle_ms = now.saturating_sub(agent.last_activity());
            if idle_ms < threshold_ms {
                continue;
            }

            agent.active = false;
            agent.unenrolled_at = Some(now);
            agent.unenrolled_reason = Some(UNENROLLED_REASON_TIMEOUT.to_string());

            let body = match serde_json::to_value(&agent) {
                Ok(body) => body,
                Err(err) => {
                    warn!(agent_id = %agent.id, error = %err, "cannot serialize agent update");
                    continue;
                }
            };

            match self
                .store
                .update(&self.agents_index, &hit.id, body, Some(hit.version))
                .await
            {
                Ok(_) => {
                    info!(
                        agent_id = %agent.id,
                        policy_id = %self.policy_id,
                        idle_secs = idle_ms / 1_000,
                        "agent unenrolled on inactivity"
                    );
                    retired += 1;
                }
                Err(StoreError::VersionConflict { .. }) => {
                    // the agent checked in (or another server raced us);
                    // next tick re-evaluates
                    debug!(agent_id = %agent.id, "unenroll update conflicted, retrying next tick");
                    continue;
                }
                Err(err) => {
                    warn!(agent_id = %agent.id, error = %err, "unenroll update failed");
                    continue;
                }
            }

            // Fire-and-forget with respect to the document update.
            let ids = agent.credential_ids();
            if let Err(err) = self.credentials.invalidate_credentials(&ids).await {
                warn!(
                    agent_id = %agent.id,
                    error = %err,
                    "credential invalidation failed (agent document already inactive)"
                );
            }
        }

        Ok(retired)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════
