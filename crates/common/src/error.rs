//! # Fleet Error Taxonomy
//!
//! Defines [`FleetError`], the public error contract for the artifact
//! fetch path and the request boundary.
//!
//! ## Overview
//!
//! Every failure a request can surface maps to exactly one variant. The
//! variants are non-overlapping:
//!
//! | Category | Variants |
//! |-----------------|---------------------------------------------|
//! | Client input | `BadSha2` |
//! | Capacity | `Throttled` |
//! | Data integrity | `RecordMismatch`, `IntegrityFail` |
//! | Authentication | `Unauthorized`, `Forbidden` |
//! | Store | `Store(StoreError)` |
//!
//! ## Propagation
//!
//! Only transient store failures are retried locally (with backoff, by
//! whichever component hit them). Every other kind propagates to the
//! request boundary unchanged. Coordination tasks log and retry on the
//! next tick rather than exiting, except on a fatal store failure.
//!
//! ## Display Messages
//!
//! All `Display` messages are deterministic and operator-friendly; no
//! internal debug formatting.

use std::fmt;

use crate::store::StoreError;

// ════════════════════════════════════════════════════════════════════════════
// FLEET ERROR
// ════════════════════════════════════════════════════════════════════════════

/// Error taxonomy surfaced at the request boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetError {
    /// The requested sha256 is not 64 lowercase hex characters.
    /// Rejected before any store access.
    BadSha2,

    /// A throttle token could not be acquired; the caller should retry
    /// later.
    Throttled,

    /// The stored artifact record disagrees with the request parameters.
    /// Surfaced opaquely (not found) to clients.
    RecordMismatch {
        /// Identifier found in the record.
        identifier: String,
        /// Decoded sha256 found in the record.
        decoded_sha256: String,
    },

    /// The decoded payload failed its integrity hash check. Server-side
    /// corruption; logged at error level.
    IntegrityFail {
        /// Digest the record claims.
        expected: String,
        /// Digest computed over the decoded bytes.
        actual: String,
    },

    /// The authorize predicate denied access to the artifact.
    Forbidden(String),

    /// Request authentication failed (credential or agent lookup).
    Unauthorized(String),

    /// A store operation failed.
    Store(StoreError),
}

impl fmt::Display for FleetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FleetError::BadSha2 => write!(f, "malformed sha256"),
            FleetError::Throttled => write!(f, "cannot acquire throttle token"),
            FleetError::RecordMismatch {
                identifier,
                decoded_sha256,
            } => write!(
                f,
                "artifact record mismatch: record has identifier {} sha2 {}",
                identifier, decoded_sha256
            ),
            FleetError::IntegrityFail { expected, actual } => write!(
                f,
                "mismatched sha256: expected {}, computed {}",
                expected, actual
            ),
            FleetError::Forbidden(msg) => write!(f, "forbidden: {}", msg),
            FleetError::Unauthorized(msg) => write!(f, "unauthorized: {}", msg),
            FleetError::Store(err) => write!(f, "store failure: {}", err),
        }
    }
}

impl std::error::Error for FleetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FleetError::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for FleetError {
    fn from(err: StoreError) -> Self {
        FleetError::Store(err)
    }
}

impl FleetError {
    /// Whether a retry of the same request may succeed without operator
    /// intervention.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, FleetError::Throttled)
            || matches!(self, FleetError::Store(e) if e.is_transient())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════
