//! In-Memory Store Backend
//!
//! This module provides [`MemStore`], a fully in-memory implementation of
//! [`DocStore`] and [`Credentials`]. It backs the server's
//! `store.backend = "memory"` mode and every test in the workspace, so no
//! external document store is required to run either.
//!
//! # Features
//!
//! - Deterministic behavior for reproducible tests
//! - Global monotonic `_seq_no` assignment on every write
//! - Per-document versions with compare-and-set semantics
//! - Configurable latency simulation (async, non-blocking)
//! - One-shot failure injection for error-path tests
//! - Per-operation call counters so tests can assert "store untouched"
//!
//! # Example
//!
//! ```ignore
//! use fleet_common::{MemStore, DocStore};
//!
//! let store = MemStore::new();
//! let v = store.create(".fleet-agents", "a1", body).await?;
//! let hit = store.read(".fleet-agents", "a1").await?;
//! assert_eq!(hit.version, v);
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::current_time_ms;
use crate::store::{
    CredentialMetadata, CredentialSecret, Credentials, DocStore, Hit, Query, StoreError,
};

// ════════════════════════════════════════════════════════════════════════════
// STORED DOCUMENT
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct StoredDoc {
    body: serde_json::Value,
    version: u64,
    seq: u64,
}

#[derive(Debug, Clone)]
struct CredentialRecord {
    secret: String,
    agent_id: String,
    name: String,
    invalidated: bool,
    created_at: u64,
}

// ════════════════════════════════════════════════════════════════════════════
// OPERATION COUNTERS
// ════════════════════════════════════════════════════════════════════════════

/// Per-operation call counters.
///
/// Incremented on entry to every store method, including calls that fail.
#[derive(Debug, Default)]
pub struct OpCounters {
    pub creates: AtomicU64,
    pub indexes: AtomicU64,
    pub updates: AtomicU64,
    pub reads: AtomicU64,
    pub deletes: AtomicU64,
    pub searches: AtomicU64,
}

// ════════════════════════════════════════════════════════════════════════════
// MEM STORE
// ════════════════════════════════════════════════════════════════════════════

/// In-memory document store with version and sequence semantics.
///
/// # Thread Safety
///
/// Index maps are guarded by `parking_lot::RwLock`; sequence assignment is
/// an atomic counter. Locks are never held across an await point: the
/// simulated latency sleeps before any lock is taken.
pub struct MemStore {
    /// index name -> (doc id -> stored document)
    indices: RwLock<HashMap<String, BTreeMap<String, StoredDoc>>>,
    /// Credential registry: credential id -> record.
    credentials: RwLock<HashMap<String, CredentialRecord>>,
    /// Global monotonic sequence counter shared by all indices.
    next_seq: AtomicU64,
    /// Simulated latency applied to every operation.
    latency: Duration,
    /// Errors to inject, one per subsequent document operation.
    injected: Mutex<VecDeque<StoreError>>,
    /// Call counters.
    counters: OpCounters,
}

impl std::fmt::Debug for MemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemStore")
            .field("indices", &self.indices.read().len())
            .field("next_seq", &self.next_seq.load(Ordering::SeqCst))
            .field("latency", &self.latency)
            .finish()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    /// Create an empty store with no simulated latency.
    pub fn new() -> Self {
        Self {
            indices: RwLock::new(HashMap::new()),
            credentials: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            latency: Duration::ZERO,
            injected: Mutex::new(VecDeque::new()),
            counters: OpCounters::default(),
        }
    }

    /// Create a store that sleeps `latency` inside every operation.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::new()
        }
    }

    /// Queue an error to be returned by the next document operation.
    /// Multiple queued errors are consumed in FIFO order.
    pub fn inject_failure(&self, err: StoreError) {
        self.injected.lock().push_back(err);
    }

    /// Call counters for assertions.
    pub fn counters(&self) -> &OpCounters {
        &self.counters
    }

    /// Number of documents currently stored in `index`.
    pub fn doc_count(&self, index: &str) -> usize {
        self.indices.read().get(index).map_or(0, BTreeMap::len)
    }

    async fn simulate(&self) -> Result<(), StoreError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(err) = self.injected.lock().pop_front() {
            debug!(error = %err, "returning injected failure");
            return Err(err);
        }
        Ok(())
    }

    fn bump_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst) + 1
    }
}

// ════════════════════════════════════════════════════════════════════════════
// DOC STORE IMPLEMENTATION
// ════════════════════════════════════════════════════════════════════════════

#[async_trait]
impl DocStore for MemStore {
    async fn create(
        &self,
        index: &str,
        id: &str,
        body: serde_json::Value,
    ) -> Result<u64, StoreError> {
        self.counters.creates.fetch_add(1, Ordering::Relaxed);
        self.simulate().await?;

        let seq = self.bump_seq();
        let mut indices = self.indices.write();
        let docs = indices.entry(index.to_string()).or_default();
        if docs.contains_key(id) {
            return Err(StoreError::Conflict);
        }
        docs.insert(
            id.to_string(),
            StoredDoc {
                body,
                version: 1,
                seq,
            },
        );
        Ok(1)
    }

    async fn index(
        &self,
        index: &str,
        id: &str,
        body: serde_json::Value,
    ) -> Result<u64, StoreError> {
        self.counters.indexes.fetch_add(1, Ordering::Relaxed);
        self.simulate().await?;

        let seq = self.bump_seq();
        let mut indices = self.indices.write();
        let docs = indices.entry(index.to_string()).or_default();
        let version = docs.get(id).map_or(1, |d| d.version + 1);
        docs.insert(id.to_string(), StoredDoc { body, version, seq });
        Ok(version)
    }

    async fn update(
        &self,
        index: &str,
        id: &str,
        body: serde_json::Value,
        expect: Option<u64>,
    ) -> Result<u64, StoreError> {
        self.counters.updates.fetch_add(1, Ordering::Relaxed);
        self.simulate().await?;

        let seq = self.bump_seq();
        let mut indices = self.indices.write();
        let docs = indices.get_mut(index).ok_or(StoreError::NotFound)?;
        let doc = docs.get_mut(id).ok_or(StoreError::NotFound)?;
        if let Some(expected) = expect {
            if doc.version != expected {
                return Err(StoreError::VersionConflict {
                    expected,
                    actual: doc.version,
                });
            }
        }
        doc.body = body;
        doc.version += 1;
        doc.seq = seq;
        Ok(doc.version)
    }

    async fn read(&self, index: &str, id: &str) -> Result<Hit, StoreError> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        self.simulate().await?;

        let indices = self.indices.read();
        let doc = indices
            .get(index)
            .and_then(|docs| docs.get(id))
            .ok_or(StoreError::NotFound)?;
        Ok(Hit {
            id: id.to_string(),
            seq: doc.seq,
            version: doc.version,
            body: doc.body.clone(),
        })
    }

    async fn delete(&self, index: &str, id: &str) -> Result<(), StoreError> {
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.simulate().await?;

        let mut indices = self.indices.write();
        let docs = indices.get_mut(index).ok_or(StoreError::NotFound)?;
        docs.remove(id).map(|_| ()).ok_or(StoreError::NotFound)
    }

    async fn search(&self, index: &str, query: &Query) -> Result<Vec<Hit>, StoreError> {
        self.counters.searches.fetch_add(1, Ordering::Relaxed);
        self.simulate().await?;

        let indices = self.indices.read();
        let Some(docs) = indices.get(index) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<Hit> = docs
            .iter()
            .map(|(id, doc)| Hit {
                id: id.clone(),
                seq: doc.seq,
                version: doc.version,
                body: doc.body.clone(),
            })
            .collect();
        hits.sort_by_key(|h| h.seq);

        let hits = match query {
            Query::SeqAbove { seq, size } => hits
                .into_iter()
                .filter(|h| h.seq > *seq)
                .take(*size)
                .collect(),
            Query::LatestN { size } => {
                let skip = hits.len().saturating_sub(*size);
                hits.split_off(skip)
            }
            Query::ActiveAgentsByPolicy { policy_id } => hits
                .into_iter()
                .filter(|h| {
                    h.body.get("policy_id").and_then(|v| v.as_str()) == Some(policy_id.as_str())
                        && h.body.get("active").and_then(|v| v.as_bool()) == Some(true)
                })
                .collect(),
            Query::ArtifactByKey {
                identifier,
                decoded_sha256,
            } => hits
                .into_iter()
                .filter(|h| {
                    h.body.get("identifier").and_then(|v| v.as_str())
                        == Some(identifier.as_str())
                        && h.body.get("decoded_sha256").and_then(|v| v.as_str())
                            == Some(decoded_sha256.as_str())
                })
                .collect(),
        };
        Ok(hits)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// CREDENTIALS IMPLEMENTATION
// ════════════════════════════════════════════════════════════════════════════

#[async_trait]
impl Credentials for MemStore {
    async fn create_credential(
        &self,
        agent_id: &str,
        name: &str,
    ) -> Result<CredentialSecret, StoreError> {
        self.simulate().await?;

        let id = Uuid::new_v4().to_string();
        let secret = Uuid::new_v4().simple().to_string();
        self.credentials.write().insert(
            id.clone(),
            CredentialRecord {
                secret: secret.clone(),
                agent_id: agent_id.to_string(),
                name: name.to_string(),
                invalidated: false,
                created_at: current_time_ms(),
            },
        );
        Ok(CredentialSecret { id, secret })
    }

    async fn auth_credential(&self, id: &str, secret: &str) -> Result<String, StoreError> {
        self.simulate().await?;

        let credentials = self.credentials.read();
        let record = credentials.get(id).ok_or(StoreError::NotFound)?;
        if record.invalidated {
            return Err(StoreError::CredentialRejected("invalidated".to_string()));
        }
        if record.secret != secret {
            return Err(StoreError::CredentialRejected("secret mismatch".to_string()));
        }
        Ok(record.agent_id.clone())
    }

    async fn invalidate_credentials(&self, ids: &[String]) -> Result<(), StoreError> {
        self.simulate().await?;

        let mut credentials = self.credentials.write();
        for id in ids {
            if let Some(record) = credentials.get_mut(id) {
                record.invalidated = true;
            }
        }
        Ok(())
    }

    async fn read_credential_metadata(
        &self,
        id: &str,
    ) -> Result<CredentialMetadata, StoreError> {
        self.simulate().await?;

        let credentials = self.credentials.read();
        let record = credentials.get(id).ok_or(StoreError::NotFound)?;
        Ok(CredentialMetadata {
            agent_id: record.agent_id.clone(),
            name: record.name.clone(),
            invalidated: record.invalidated,
            created_at: record.created_at,
        })
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════
