//! Persisted Document Model
//!
//! This module defines the document shapes the control plane reads and
//! writes against the backing store. Each struct maps 1:1 to a collection:
//!
//! | Struct | Collection (default name) |
//! |--------------|---------------------------|
//! | [`Agent`] | `.fleet-agents` |
//! | [`Policy`] | `.fleet-policies` |
//! | [`Artifact`] | `.fleet-artifacts` |
//! | [`PolicyLeader`] | `.fleet-policies-leader` |
//! | [`Server`] | `.fleet-servers` |
//!
//! ## Timestamps
//!
//! All timestamps are unix epoch milliseconds (`u64`, `0` = unset). The
//! leader timestamp serializes as `@timestamp` to keep the on-disk layout
//! compatible with the fleet document conventions.
//!
//! ## Mutation rules
//!
//! Agents and policies are created by external producers. The control
//! plane mutates an Agent only on unenroll, and writes a Policy only via
//! coordinator emissions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ════════════════════════════════════════════════════════════════════════════
// AGENT
// ════════════════════════════════════════════════════════════════════════════

/// A managed agent enrolled against a policy.
///
/// The unenroller flips `active` to `false` and stamps
/// `unenrolled_at`/`unenrolled_reason` when the agent exceeds its policy's
/// inactivity window. The agent document, not the credential store, is the
/// source of truth for enrollment state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    /// Agent identity (document id).
    pub id: String,
    /// Credential id the agent presents on check-in.
    pub access_credential_id: String,
    /// Per-output credential ids, keyed by output name.
    #[serde(default)]
    pub output_credential_ids: BTreeMap<String, String>,
    /// Whether the agent is enrolled and active.
    pub active: bool,
    /// When the agent enrolled (ms).
    #[serde(default)]
    pub enrolled_at: u64,
    /// Last successful check-in (ms).
    #[serde(default)]
    pub last_checkin: u64,
    /// Last document update (ms).
    #[serde(default)]
    pub updated_at: u64,
    /// Policy currently assigned to the agent.
    pub policy_id: String,
    /// Set when the agent is retired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unenrolled_at: Option<u64>,
    /// Reason tag for retirement (`"timeout"` for inactivity).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unenrolled_reason: Option<String>,
}

/// Reason tag written by the unenroller on inactivity retirement.
pub const UNENROLLED_REASON_TIMEOUT: &str = "timeout";

impl Agent {
    /// Most recent sign of life: `max(last_checkin, updated_at, enrolled_at)`.
    #[must_use]
    pub fn last_activity(&self) -> u64 {
        self.last_checkin.max(self.updated_at).max(self.enrolled_at)
    }

    /// Every credential id attached to this agent (access + per-output).
    #[must_use]
    pub fn credential_ids(&self) -> Vec<String> {
        let mut ids = Vec::with_capacity(1 + self.output_credential_ids.len());
        ids.push(self.access_credential_id.clone());
        ids.extend(self.output_credential_ids.values().cloned());
        ids
    }
}

// ════════════════════════════════════════════════════════════════════════════
// POLICY
// ════════════════════════════════════════════════════════════════════════════

/// One revision of a policy document.
///
/// The policies collection is an append log: every revision is a new
/// document. `revision_idx` advances when an external producer updates the
/// policy; `coordinator_idx` advances when a coordinator republishes it.
/// `(policy_id, revision_idx, coordinator_idx)` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Stable policy identity shared by all revisions.
    pub policy_id: String,
    /// Monotonic revision index, bumped by producers.
    pub revision_idx: i64,
    /// Monotonic coordinator index; `0` marks an uncoordinated input.
    pub coordinator_idx: i64,
    /// Opaque policy payload.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Inactivity window in seconds after which agents are unenrolled.
    /// `0` disables unenrollment for this policy.
    #[serde(default)]
    pub unenroll_timeout: u64,
    /// Check-in timeout in seconds (`0` = unset).
    #[serde(default)]
    pub checkin_timeout: u64,
}

// ════════════════════════════════════════════════════════════════════════════
// ARTIFACT
// ════════════════════════════════════════════════════════════════════════════

/// A signed artifact served to agents.
///
/// The store holds the payload base64-encoded in `encoded_body` (the
/// `body` field of the document). The fetch path decodes it once, checks
/// `encoded_sha256` over the decoded bytes, and caches the result in
/// `body` so cache hits skip all decode and hash work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Artifact identifier (first half of the retrieval key).
    pub identifier: String,
    /// 64-hex SHA-256 of the fully decoded content (retrieval key).
    pub decoded_sha256: String,
    /// 64-hex SHA-256 of the stored (encoded) payload bytes.
    pub encoded_sha256: String,
    /// Size of the decoded content in bytes.
    #[serde(default)]
    pub decoded_size: i64,
    /// Size of the stored payload in bytes.
    #[serde(default)]
    pub encoded_size: i64,
    /// Compression applied to the stored payload (`"none"`, `"zlib"`, ...).
    #[serde(default)]
    pub compression_algorithm: String,
    /// Encryption applied to the stored payload (`"none"`, ...).
    #[serde(default)]
    pub encryption_algorithm: String,
    /// Creation timestamp (ms).
    #[serde(default)]
    pub created: u64,
    /// Base64 payload as persisted in the store. Cleared once decoded.
    #[serde(rename = "body", default)]
    pub encoded_body: String,
    /// Decoded payload bytes. Never persisted; populated by the fetch
    /// path before the artifact enters the cache.
    #[serde(skip)]
    pub body: Vec<u8>,
}

// ════════════════════════════════════════════════════════════════════════════
// POLICY LEADER
// ════════════════════════════════════════════════════════════════════════════

/// Lease record for per-policy leadership.
///
/// Document key is the policy id. The lease is *fresh* while
/// `now - timestamp < lease_ttl`; a released lease has its timestamp set
/// back past the release horizon so peers observe immediate expiry.
/// All write serialization is delegated to the store's optimistic
/// concurrency; there is no local locking across servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyLeader {
    /// Server currently holding (or last holding) the lease.
    pub server_id: String,
    /// Heartbeat timestamp (ms).
    #[serde(rename = "@timestamp")]
    pub timestamp: u64,
}

impl PolicyLeader {
    /// Whether this lease is still fresh at `now_ms`.
    #[must_use]
    pub fn is_fresh(&self, now_ms: u64, lease_ttl_ms: u64) -> bool {
        now_ms.saturating_sub(self.timestamp) < lease_ttl_ms
    }
}

// ════════════════════════════════════════════════════════════════════════════
// SERVER
// ════════════════════════════════════════════════════════════════════════════

/// Identity of one control-plane server in a horizontally scaled deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdentity {
    /// Unique id of this server instance (also its leases' holder id).
    pub agent_id: String,
    /// Host the server runs on.
    pub host_id: String,
    /// Server version string.
    pub version: String,
}

/// Server registration document, upserted at startup and refreshed by the
/// monitor loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    #[serde(flatten)]
    pub identity: ServerIdentity,
    /// Last registration write (ms).
    #[serde(rename = "@timestamp")]
    pub updated_at: u64,
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════
