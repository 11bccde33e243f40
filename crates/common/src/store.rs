//! Document Store Abstraction
//!
//! Defines the capability traits the control plane consumes from the
//! backing document store. The real search/bulk client and its query DSL
//! live outside this workspace; the traits here name exactly the
//! operations the core issues, so any client that satisfies them plugs in
//! structurally.
//!
//! ## Contract for implementors
//!
//! - Thread-safe (`Send + Sync`), consumed as `Arc<dyn DocStore>`.
//! - Writes support optimistic concurrency via a per-document version;
//!   `update` with `expect: Some(v)` must fail with
//!   [`StoreError::VersionConflict`] when the stored version moved. This
//!   compare-and-set is the sole serialization primitive of leader
//!   election; implementors must not weaken it.
//! - Every successful write assigns the document a fresh, globally
//!   monotonic sequence number (`_seq_no`) observable through
//!   [`Query::SeqAbove`].
//! - No blocking inside async methods.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ════════════════════════════════════════════════════════════════════════════
// STORE ERROR
// ════════════════════════════════════════════════════════════════════════════

/// Errors produced by store operations.
///
/// `Transient` is the only kind eligible for local retry; everything else
/// propagates. `Fatal` terminates the owning task.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Document not found.
    #[error("document not found")]
    NotFound,

    /// Create refused: the document id already exists.
    #[error("document already exists")]
    Conflict,

    /// Optimistic-concurrency update lost: the stored version moved.
    #[error("version conflict: expected {expected}, actual {actual}")]
    VersionConflict {
        /// Version the caller predicated on.
        expected: u64,
        /// Version actually stored.
        actual: u64,
    },

    /// Credential rejected during authentication.
    #[error("credential rejected: {0}")]
    CredentialRejected(String),

    /// Malformed or unsupported query.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Retryable failure (network, overload, shard relocation).
    #[error("transient store failure: {0}")]
    Transient(String),

    /// Unrecoverable failure; the owning task exits.
    #[error("fatal store failure: {0}")]
    Fatal(String),
}

impl StoreError {
    /// Whether a retry with backoff is warranted.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

// ════════════════════════════════════════════════════════════════════════════
// QUERY & HIT
// ════════════════════════════════════════════════════════════════════════════

/// The typed queries the control plane issues.
///
/// The store's full query DSL is an external concern; each variant here
/// corresponds to one query the core actually needs, and implementors
/// translate it to their native DSL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Documents with `_seq_no > seq`, ascending, at most `size`.
    /// The index monitor's tailing query.
    SeqAbove { seq: u64, size: usize },

    /// The `size` most recent documents by `_seq_no`, returned ascending.
    /// The index monitor's priming scan.
    LatestN { size: usize },

    /// Agents with `policy_id == policy_id && active == true`.
    /// The unenroller's candidate scan.
    ActiveAgentsByPolicy { policy_id: String },

    /// Artifact records matching both halves of the retrieval key.
    ArtifactByKey {
        identifier: String,
        decoded_sha256: String,
    },
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hit {
    /// Document id.
    pub id: String,
    /// Sequence number assigned at the last write.
    pub seq: u64,
    /// Current document version (CAS anchor).
    pub version: u64,
    /// Document body.
    pub body: serde_json::Value,
}

/// One document in a bulk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkOp {
    pub id: String,
    pub body: serde_json::Value,
}

impl BulkOp {
    pub fn new(id: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            body,
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// DOC STORE TRAIT
// ════════════════════════════════════════════════════════════════════════════

/// Document operations against a named index.
///
/// All methods may suspend; callers hold no locks across calls.
#[async_trait]
pub trait DocStore: Send + Sync {
    /// Create a document. Fails with [`StoreError::Conflict`] if `id`
    /// already exists in `index`.
    async fn create(
        &self,
        index: &str,
        id: &str,
        body: serde_json::Value,
    ) -> Result<u64, StoreError>;

    /// Create or replace a document unconditionally. Returns the new
    /// version.
    async fn index(
        &self,
        index: &str,
        id: &str,
        body: serde_json::Value,
    ) -> Result<u64, StoreError>;

    /// Replace a document body.
    ///
    /// With `expect: Some(v)` the write succeeds only if the stored
    /// version is still `v`; otherwise [`StoreError::VersionConflict`].
    /// With `expect: None` the write is unconditional.
    async fn update(
        &self,
        index: &str,
        id: &str,
        body: serde_json::Value,
        expect: Option<u64>,
    ) -> Result<u64, StoreError>;

    /// Read a document with its version and sequence number.
    async fn read(&self, index: &str, id: &str) -> Result<Hit, StoreError>;

    /// Delete a document. Missing documents yield [`StoreError::NotFound`].
    async fn delete(&self, index: &str, id: &str) -> Result<(), StoreError>;

    /// Run one of the typed queries, returning hits in the order the
    /// query defines.
    async fn search(&self, index: &str, query: &Query) -> Result<Vec<Hit>, StoreError>;

    /// Bulk create. One result per op, in order; a failed item does not
    /// abort the batch.
    async fn mcreate(
        &self,
        index: &str,
        ops: Vec<BulkOp>,
    ) -> Result<Vec<Result<u64, StoreError>>, StoreError> {
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            results.push(self.create(index, &op.id, op.body).await);
        }
        Ok(results)
    }

    /// Bulk upsert. Same per-item semantics as [`DocStore::mcreate`].
    async fn mindex(
        &self,
        index: &str,
        ops: Vec<BulkOp>,
    ) -> Result<Vec<Result<u64, StoreError>>, StoreError> {
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            results.push(self.index(index, &op.id, op.body).await);
        }
        Ok(results)
    }

    /// Bulk unconditional update.
    async fn mupdate(
        &self,
        index: &str,
        ops: Vec<BulkOp>,
    ) -> Result<Vec<Result<u64, StoreError>>, StoreError> {
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            results.push(self.update(index, &op.id, op.body, None).await);
        }
        Ok(results)
    }

    /// Bulk delete.
    async fn mdelete(
        &self,
        index: &str,
        ids: &[String],
    ) -> Result<Vec<Result<(), StoreError>>, StoreError> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(self.delete(index, id).await);
        }
        Ok(results)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// CREDENTIALS TRAIT
// ════════════════════════════════════════════════════════════════════════════

/// A freshly minted credential. The secret is returned exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSecret {
    pub id: String,
    pub secret: String,
}

/// Metadata of an existing credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialMetadata {
    /// Agent the credential was minted for.
    pub agent_id: String,
    /// Human-readable credential name (e.g. output name).
    pub name: String,
    /// Whether the credential has been invalidated.
    pub invalidated: bool,
    /// Creation time (ms).
    pub created_at: u64,
}

/// The credential subsystem of the store.
///
/// Invalidation is fire-and-forget with respect to agent-document
/// updates: the agent document is the source of truth for enrollment
/// state, and a failed invalidation is logged, not retried inline.
#[async_trait]
pub trait Credentials: Send + Sync {
    /// Mint a credential bound to `agent_id`.
    async fn create_credential(
        &self,
        agent_id: &str,
        name: &str,
    ) -> Result<CredentialSecret, StoreError>;

    /// Validate an `(id, secret)` pair; returns the bound agent id.
    ///
    /// Unknown ids yield [`StoreError::NotFound`]; invalidated or
    /// mismatched credentials yield [`StoreError::CredentialRejected`].
    async fn auth_credential(&self, id: &str, secret: &str) -> Result<String, StoreError>;

    /// Invalidate every credential in `ids`. Unknown ids are ignored.
    async fn invalidate_credentials(&self, ids: &[String]) -> Result<(), StoreError>;

    /// Read metadata for a credential id.
    async fn read_credential_metadata(&self, id: &str)
        -> Result<CredentialMetadata, StoreError>;
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        assert_eq!(StoreError::NotFound.to_string(), "document not found");
        assert_eq!(
            StoreError::VersionConflict {
                expected: 3,
                actual: 5
            }
            .to_string(),
            "version conflict: expected 3, actual 5"
        );
    }

    #[test]
    fn test_only_transient_is_transient() {
        assert!(StoreError::Transient("x".to_string()).is_transient());
        for err in [
            StoreError::NotFound,
            StoreError::Conflict,
            StoreError::Fatal("x".to_string()),
            StoreError::InvalidQuery("x".to_string()),
        ] {
            assert!(!err.is_transient(), "{err} must not be transient");
        }
    }
}
