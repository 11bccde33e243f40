//! # Leader Elector
//!
//! Best-effort, lease-based leadership over policy ids, serialized
//! entirely through the store's optimistic-concurrency semantics.
//!
//! ## Design
//!
//! Each server runs one election attempt per policy per tick. The
//! algorithm for policy `P` on server `S`:
//!
//! 1. Read `PolicyLeader[P]` with its document version.
//! 2. Holder is `S` → heartbeat: rewrite with a fresh timestamp,
//!    predicated on the observed version.
//! 3. Holder is foreign and the lease expired (`now - t ≥ lease_ttl`) →
//!    takeover: rewrite `(S, now)` predicated on the observed version.
//! 4. Otherwise → remain a follower.
//!
//! The compare-and-set on the document version is the sole correctness
//! anchor: two servers that both observed an expired lease race on the
//! same predicate and exactly one write wins. Under adversarial clock
//! skew or store-replication lag, transient dual-leadership is possible;
//! downstream consumers must be idempotent.
//!
//! ## Release
//!
//! On shutdown every held lease is rewritten with the holder retained and
//! the timestamp set back by the release horizon, so peers observe the
//! lease as already expired instead of waiting a full TTL.
//!
//! ## Invariants
//!
//! - Every transition is an explicit [`ElectionOutcome`]; no silent
//!   state mutation.
//! - The `held` set changes only on a successful store write (or an
//!   observed loss).
//! - No `panic!`, `unwrap()`, `expect()`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use fleet_common::current_time_ms;
use fleet_common::model::PolicyLeader;
use fleet_common::store::{DocStore, StoreError};

// ════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ════════════════════════════════════════════════════════════════════════════

/// How far back a released lease's timestamp is set. Peers must observe
/// `now - t ≥ 30 s` immediately after a clean shutdown.
pub const RELEASE_HORIZON_MS: u64 = 30_000;

// ════════════════════════════════════════════════════════════════════════════
// ELECTION OUTCOME
// ════════════════════════════════════════════════════════════════════════════

/// Result of one election attempt for one policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// This server took the lease this tick.
    Acquired,
    /// This server already held the lease and heartbeated it.
    Retained,
    /// Another server's lease is fresh (or won the race); this server
    /// follows.
    Follower,
    /// This server held the lease but lost it to a concurrent writer.
    Lost,
}

// ════════════════════════════════════════════════════════════════════════════
// LEADER ELECTOR
// ════════════════════════════════════════════════════════════════════════════

/// Per-policy election against the leaders collection.
///
/// ## Thread Safety
///
/// The held set sits behind a `parking_lot::RwLock`; store calls are
/// never made while it is locked.
pub struct LeaderElector {
    server_id: String,
    leaders_index: String,
    store: Arc<dyn DocStore>,
    lease_ttl: Duration,
    held: RwLock<HashSet<String>>,
}

impl LeaderElector {
    pub fn new(
        server_id: impl Into<String>,
        leaders_index: impl Into<String>,
        store: Arc<dyn DocStore>,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            leaders_index: leaders_index.into(),
            store,
            lease_ttl,
            held: RwLock::new(HashSet::new()),
        }
    }

    /// Policies this server currently believes it leads.
    pub fn held(&self) -> Vec<String> {
        self.held.read().iter().cloned().collect()
    }

    /// Whether this server currently believes it leads `policy_id`.
    pub fn is_leader(&self, policy_id: &str) -> bool {
        self.held.read().contains(policy_id)
    }

    /// One election attempt for one policy.
    ///
    /// A store error leaves the held set untouched; the caller logs and
    /// retries on the next tick.
    pub async fn elect(&self, policy_id: &str) -> Result<ElectionOutcome, StoreError> {
        let now = current_time_ms();

        let hit = match self.store.read(&self.leaders_index, policy_id).await {
            Ok(hit) => hit,
            Err(StoreError::NotFound) => {
                // No leader record yet: first writer wins the create.
                let lease = PolicyLeader {
                    server_id: self.server_id.clone(),
                    timestamp: now,
                };
                return match self
                    .store
                    .create(&self.leaders_index, policy_id, to_body(&lease))
                    .await
                {
                    Ok(_) => {
                        info!(policy_id, server_id = %self.server_id, "lease acquired (new)");
                        self.held.write().insert(policy_id.to_string());
                        Ok(ElectionOutcome::Acquired)
                    }
                    Err(StoreError::Conflict) => {
                        debug!(policy_id, "lost create race for lease");
                        Ok(ElectionOutcome::Follower)
                    }
                    Err(err) => Err(err),
                };
            }
            Err(err) => return Err(err),
        };

        let lease: PolicyLeader = match serde_json::from_value(hit.body) {
            Ok(lease) => lease,
            Err(err) => {
                // A garbled lease record blocks nobody: treat it as expired
                // and let the CAS arbitrate.
                warn!(policy_id, error = %err, "malformed lease record, attempting takeover");
                PolicyLeader {
                    server_id: String::new(),
                    timestamp: 0,
                }
            }
        };

        if lease.server_id == self.server_id {
            // Heartbeat our own lease.
            let fresh = PolicyLeader {
                server_id: self.server_id.clone(),
                timestamp: now,
            };
            return match self
                .store
                .update(&self.leaders_index, policy_id, to_body(&fresh), Some(hit.version))
                .await
            {
                Ok(_) => {
                    self.held.write().insert(policy_id.to_string());
                    Ok(ElectionOutcome::Retained)
                }
                Err(StoreError::VersionConflict { .. }) => {
                    warn!(policy_id, server_id = %self.server_id, "lease lost to concurrent writer");
                    self.held.write().remove(policy_id);
                    Ok(ElectionOutcome::Lost)
                }
                Err(err) => Err(err),
            };
        }

        if lease.is_fresh(now, self.lease_ttl.as_millis() as u64) {
            // Foreign and fresh: follow. If we thought we led, we were wrong.
            let was_held = self.held.write().remove(policy_id);
            if was_held {
                warn!(policy_id, holder = %lease.server_id, "observed foreign fresh lease");
                return Ok(ElectionOutcome::Lost);
            }
            return Ok(ElectionOutcome::Follower);
        }

        // Foreign and expired: attempt takeover, predicated on the version
        // we observed.
        let claim = PolicyLeader {
            server_id: self.server_id.clone(),
            timestamp: now,
        };
        match self
            .store
            .update(&self.leaders_index, policy_id, to_body(&claim), Some(hit.version))
            .await
        {
            Ok(_) => {
                info!(policy_id, server_id = %self.server_id,
                    previous = %lease.server_id, "lease taken over");
                self.held.write().insert(policy_id.to_string());
                Ok(ElectionOutcome::Acquired)
            }
            Err(StoreError::VersionConflict { .. }) => {
                debug!(policy_id, "takeover lost the compare-and-set");
                Ok(ElectionOutcome::Follower)
            }
            Err(err) => Err(err),
        }
    }

    /// Release one held lease: rewrite with the timestamp set back past
    /// the release horizon so peers observe immediate expiry.
    pub async fn release(&self, policy_id: &str) -> Result<(), StoreError> {
        let hit = self.store.read(&self.leaders_index, policy_id).await?;
        let lease: PolicyLeader = serde_json::from_value(hit.body)
            .map_err(|e| StoreError::Fatal(format!("malformed lease record: {e}")))?;
        if lease.server_id != self.server_id {
            // Someone else took it already; nothing to release.
            self.held.write().remove(policy_id);
            return Ok(());
        }

        let released = PolicyLeader {
            server_id: self.server_id.clone(),
            timestamp: current_time_ms().saturating_sub(RELEASE_HORIZON_MS),
        };
        match self
            .store
            .update(&self.leaders_index, policy_id, to_body(&released), Some(hit.version))
            .await
        {
            Ok(_) => {
                debug!(policy_id, "lease released");
                self.held.write().remove(policy_id);
                Ok(())
            }
            Err(StoreError::VersionConflict { .. }) => {
                // Lost to a concurrent writer mid-shutdown; their lease
                // stands and there is nothing of ours left to release.
                self.held.write().remove(policy_id);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Release every held lease. Individual failures are logged; the
    /// remaining leases are still released.
    pub async fn release_all(&self) {
        let held = self.held();
        for policy_id in held {
            if let Err(err) = self.release(&policy_id).await {
                warn!(policy_id = %policy_id, error = %err, "lease release failed");
            }
        }
    }
}

fn to_body(lease: &PolicyLeader) -> serde_json::Value {
    // PolicyLeader serialization cannot fail: plain string + integer.
    serde_json::to_value(lease).unwrap_or(serde_json::Value::Null)
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════
