//! # Artifact Fetcher
//!
//! Orchestrates the artifact read path: input validation, authorization,
//! cache lookup, throttle-gated store fetch, decode, and integrity
//! verification.
//!
//! ## Read path for `(id, sha2)`
//!
//! 1. Validate `sha2`: 64 hex characters, rejected before any store
//!    access.
//! 2. Ask the authorize predicate whether this agent may read the
//!    artifact.
//! 3. Cache lookup; a hit returns the decoded body with no store, hash,
//!    or decode work.
//! 4. On a miss, acquire a throttle token keyed by `sha2`. No token
//!    means the store is already saturated for this content and the
//!    caller retries later.
//! 5. Fetch the record; its identifier and sha must agree with the
//!    request, or the record is treated as absent.
//! 6. The stored body is a base64 payload; decode it.
//! 7. Hash the decoded bytes and require equality with the record's
//!    encoded sha256.
//! 8. Cache the decoded body so subsequent hits skip steps 4-7.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use fleet_common::error::FleetError;
use fleet_common::model::{Agent, Artifact};
use fleet_common::store::{DocStore, Query, StoreError};

use crate::cache::ArtifactCache;
use crate::throttle::Throttle;

// ════════════════════════════════════════════════════════════════════════════
// AUTHORIZE PREDICATE
// ════════════════════════════════════════════════════════════════════════════

/// Decides whether an agent may read an artifact.
///
/// The seam exists so policy-binding can be added without touching the
/// handler; today's reference implementation allows everything, and
/// unguessable identifiers carry the burden.
pub trait ArtifactAuthorizer: Send + Sync {
    fn authorize(&self, agent: &Agent, identifier: &str, sha2: &str) -> Result<(), FleetError>;
}

/// Reference authorizer: always allows.
#[derive(Debug, Default)]
pub struct AllowAll;

impl ArtifactAuthorizer for AllowAll {
    fn authorize(&self, _agent: &Agent, _identifier: &str, _sha2: &str) -> Result<(), FleetError> {
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// VALIDATION HELPERS
// ════════════════════════════════════════════════════════════════════════════

/// Require a 64-character hex string.
pub fn validate_sha2_string(sha2: &str) -> Result<(), FleetError> {
    if sha2.len() != 64 {
        return Err(FleetError::BadSha2);
    }
    if hex::decode(sha2).is_err() {
        return Err(FleetError::BadSha2);
    }
    Ok(())
}

/// Require `SHA256(data)` to equal the hex digest `sha2`.
fn validate_sha2_data(data: &[u8], sha2: &str) -> Result<(), FleetError> {
    let sum = hex::encode(Sha256::digest(data));
    if !sum.eq_ignore_ascii_case(sha2) {
        return Err(FleetError::IntegrityFail {
            expected: sha2.to_string(),
            actual: sum,
        });
    }
    Ok(())
}

// ════════════════════════════════════════════════════════════════════════════
// ARTIFACT FETCHER
// ════════════════════════════════════════════════════════════════════════════

/// Cache-through artifact fetch with integrity validation and
/// throttle-gated store access.
pub struct ArtifactFetcher {
    store: Arc<dyn DocStore>,
    cache: Arc<ArtifactCache>,
    throttle: Throttle,
    authorizer: Arc<dyn ArtifactAuthorizer>,
    artifacts_index: String,
    throttle_ttl: Duration,
}

impl ArtifactFetcher {
    pub fn new(
        store: Arc<dyn DocStore>,
        cache: Arc<ArtifactCache>,
        throttle: Throttle,
        authorizer: Arc<dyn ArtifactAuthorizer>,
        artifacts_index: impl Into<String>,
        throttle_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            throttle,
            authorizer,
            artifacts_index: artifacts_index.into(),
            throttle_ttl,
        }
    }

    /// Serve the decoded body for `(id, sha2)` to `agent`.
    pub async fn fetch(
        &self,
        agent: &Agent,
        id: &str,
        sha2: &str,
    ) -> Result<Vec<u8>, FleetError> {
        validate_sha2_string(sha2)?;

        if let Err(err) = self.authorizer.authorize(agent, id, sha2) {
            warn!(agent_id = %agent.id, identifier = id, "unauthorized artifact read");
            return Err(err);
        }

        let artifact = self.get_artifact(id, sha2).await?;

        // Sanity check in case something underneath is misbehaving.
        if artifact.identifier != id || artifact.decoded_sha256 != sha2 {
            info!(
                artifact_id = %artifact.identifier,
                artifact_sha2 = %artifact.decoded_sha256,
                "identifier mismatch on url"
            );
            return Err(FleetError::RecordMismatch {
                identifier: artifact.identifier,
                decoded_sha256: artifact.decoded_sha256,
            });
        }

        debug!(
            identifier = id,
            size = artifact.body.len(),
            decoded_size = artifact.decoded_size,
            compression = %artifact.compression_algorithm,
            encryption = %artifact.encryption_algorithm,
            "artifact served"
        );
        Ok(artifact.body)
    }

    /// Return the artifact from cache, or fetch, decode, verify, and
    /// cache it.
    async fn get_artifact(&self, id: &str, sha2: &str) -> Result<Artifact, FleetError> {
        if let Some(artifact) = self.cache.get_artifact(id, sha2) {
            return Ok(artifact);
        }

        let mut artifact = self.fetch_from_store(id, sha2).await?;

        // The stored body is base64; decode once, before caching, so
        // cache hits never pay the decode.
        use base64::Engine as _;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(artifact.encoded_body.as_bytes())
            .map_err(|err| {
                warn!(identifier = id, error = %err, "artifact base64 decode failed");
                FleetError::IntegrityFail {
                    expected: artifact.encoded_sha256.clone(),
                    actual: "undecodable payload".to_string(),
                }
            })?;

        if let Err(err) = validate_sha2_data(&decoded, &artifact.encoded_sha256) {
            warn!(identifier = id, error = %err, "artifact integrity check failed");
            return Err(err);
        }

        artifact.body = decoded;
        artifact.encoded_body.clear();
        self.cache.set_artifact(artifact.clone());
        Ok(artifact)
    }

    /// Throttle-gated store lookup.
    async fn fetch_from_store(&self, id: &str, sha2: &str) -> Result<Artifact, FleetError> {
        // At most one outstanding store fetch per sha2, and a global cap
        // across all keys. The token's TTL covers a crashed holder.
        let _token = self
            .throttle
            .acquire(sha2, self.throttle_ttl)
            .ok_or(FleetError::Throttled)?;

        let hits = self
            .store
            .search(
                &self.artifacts_index,
                &Query::ArtifactByKey {
                    identifier: id.to_string(),
                    decoded_sha256: sha2.to_string(),
                },
            )
            .await?;

        let hit = hits.into_iter().next().ok_or_else(|| {
            info!(identifier = id, sha2, "artifact not found");
            FleetError::Store(StoreError::NotFound)
        })?;

        serde_json::from_value(hit.body).map_err(|err| {
            warn!(identifier = id, error = %err, "malformed artifact record");
            FleetError::Store(StoreError::Fatal(format!("malformed artifact record: {err}")))
        })
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════
