//! # Fleet Coordinator Crate
//!
//! The coordination plane of the fleet control plane: a per-server leader
//! election over policies, per-policy coordinators that derive revised
//! policy documents, and the unenroll timer that retires stale agents,
//! all fed by a tailing change-monitor over the policies index.
//!
//! ## Data Flow
//!
//! ```text
//! ┌──────────────┐   changes    ┌─────────────┐
//! │ IndexMonitor │─────────────▶│ MonitorLoop │
//! └──────┬───────┘              └──────┬──────┘
//!        │ seq > cursor                │ per tick
//!        ▼                            ▼
//!   ┌─────────┐               ┌───────────────┐  CAS on version
//!   │  store  │◀──────────────│ LeaderElector │─────────▶ leases
//!   └─────────┘               └───────┬───────┘
//!                   per owned policy  │
//!              ┌──────────────────────┴────────────┐
//!              ▼                                   ▼
//!    ┌───────────────────┐               ┌──────────────┐
//!    │ PolicyCoordinator │               │  Unenroller  │
//!    └───────────────────┘               └──────────────┘
//! ```
//!
//! Leadership is best-effort and lease-based: absent partitions it
//! converges to one server per policy, and released leases are observable
//! immediately. It is not consensus, so downstream writers stay idempotent.

pub mod elector;
pub mod monitor;
pub mod monitor_loop;
pub mod policy;
pub mod unenroller;

pub use elector::{ElectionOutcome, LeaderElector, RELEASE_HORIZON_MS};
pub use monitor::{
    Change, IndexMonitor, MonitorConfig, MonitorMetrics, MonitorState, Subscription,
    SubscriptionHandle,
};
pub use monitor_loop::{MonitorLoop, MonitorLoopConfig};
pub use policy::{
    spawn_policy_coordinator, CoordinatorMonotonic, CoordinatorStrategy, CoordinatorZero,
    PolicyCoordinatorHandle, StrategyFactory,
};
pub use unenroller::{Unenroller, UnenrollerHandle};
