//! Agent authentication for the artifact path.
//!
//! Validates the request credential against the credential subsystem and
//! loads the Agent document it is bound to. Any failure (malformed
//! header, unknown or invalidated credential, missing or inactive agent)
//! collapses to `Unauthorized` at the boundary; the distinctions stay in
//! the logs.
//!
//! Note that the agent record is always re-read: an agent whose document
//! went inactive is rejected even while its credential metadata lags.

use std::sync::Arc;

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use tracing::{debug, warn};

use fleet_common::error::FleetError;
use fleet_common::model::Agent;
use fleet_common::store::{Credentials, DocStore};

/// Bearer credentials are presented as `Bearer <credential_id>:<secret>`.
fn parse_bearer(headers: &HeaderMap) -> Result<(String, String), FleetError> {
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| FleetError::Unauthorized("missing authorization header".to_string()))?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| FleetError::Unauthorized("not a bearer credential".to_string()))?;

    match token.split_once(':') {
        Some((id, secret)) if !id.is_empty() && !secret.is_empty() => {
            Ok((id.to_string(), secret.to_string()))
        }
        _ => Err(FleetError::Unauthorized(
            "malformed bearer credential".to_string(),
        )),
    }
}

/// Authenticate the request and return the agent it belongs to.
///
/// `expected_policy_id`, when set, additionally pins the agent to a
/// policy (used by policy-scoped endpoints; the artifact path passes
/// `None`).
pub async fn auth_agent(
    headers: &HeaderMap,
    expected_policy_id: Option<&str>,
    store: &Arc<dyn DocStore>,
    credentials: &Arc<dyn Credentials>,
    agents_index: &str,
) -> Result<Agent, FleetError> {
    let (credential_id, secret) = parse_bearer(headers)?;

    let agent_id = credentials
        .auth_credential(&credential_id, &secret)
        .await
        .map_err(|err| {
            debug!(credential_id = %credential_id, error = %err, "credential rejected");
            FleetError::Unauthorized("invalid credential".to_string())
        })?;

    let hit = store.read(agents_index, &agent_id).await.map_err(|err| {
        warn!(agent_id = %agent_id, error = %err, "agent record missing for valid credential");
        FleetError::Unauthorized("unknown agent".to_string())
    })?;

    let agent: Agent = serde_json::from_value(hit.body)
        .map_err(|_| FleetError::Unauthorized("malformed agent record".to_string()))?;

    if !agent.active {
        return Err(FleetError::Unauthorized("agent unenrolled".to_string()));
    }
    if agent.access_credential_id != credential_id {
        // the credential authenticated but is no longer the agent's
        // current access credential
        return Err(FleetError::Unauthorized("superseded credential".to_string()));
    }
    if let Some(policy_id) = expected_policy_id {
        if agent.policy_id != policy_id {
            return Err(FleetError::Unauthorized("policy mismatch".to_string()));
        }
    }
    Ok(agent)
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════
