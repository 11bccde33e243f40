//! # Fleet Ingress Crate
//!
//! The artifact fetch path of the fleet control plane, and the server
//! binary that fronts it.
//!
//! ## Modules
//! - `throttle`: global + per-key concurrency limiter with TTL tokens
//! - `cache`: admission-controlled, cost-bounded artifact cache
//! - `artifact`: cache-through fetch with integrity validation
//! - `auth`: bearer-credential agent authentication
//! - `handlers`: axum routes and error mapping
//!
//! The artifact path is orthogonal to the coordination plane:
//!
//! ```text
//! HTTP handler ──▶ ArtifactFetcher ──▶ ArtifactCache
//!                        │                (hit: done)
//!                        ▼ miss
//!                   Throttle ──▶ store ──▶ decode ──▶ sha256 check
//! ```

pub mod artifact;
pub mod auth;
pub mod cache;
pub mod handlers;
pub mod throttle;

pub use artifact::{validate_sha2_string, AllowAll, ArtifactAuthorizer, ArtifactFetcher};
pub use auth::auth_agent;
pub use cache::{ArtifactCache, CacheConfig};
pub use handlers::{build_router, http_status, AppState};
pub use throttle::{Throttle, ThrottleToken, DEFAULT_MAX_PARALLEL, DEFAULT_MAX_PER_KEY};
