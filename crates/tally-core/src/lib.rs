//! # tally-core: Pure Domain Logic for Tally
//!
//! This crate is the **heart** of Tally. It contains the canonical data
//! shapes and every state machine as pure functions with zero I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Tally Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              Scheduler (cron / HTTP trigger, external)          │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │          tally-sync (Orchestrator, Adapters, Gate service)      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tally-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │ aggregate │  │   gate    │  │  breaker  │  │   │
//! │  │   │ Canonical │  │ Snapshot  │  │ SyncStatus│  │ Rotation  │  │   │
//! │  │   │   Sale    │  │  sums     │  │ backoff   │  │ breaker   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐                 │   │
//! │  │   │   money   │  │   vault   │  │validation │                 │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘                 │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    tally-db (Database Layer)                    │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Canonical sale, consumption record, sync run, credential types
//! - [`money`] - Money type with integer arithmetic (no floating point!)
//! - [`aggregate`] - Folding canonical sales into a consumption snapshot
//! - [`gate`] - Scheduling gate state transitions
//! - [`breaker`] - Credential rotation circuit breaker
//! - [`vault`] - AES-256-GCM sealing of provider credentials
//! - [`error`] - Domain error types
//! - [`validation`] - Input validation
//!
//! ## Design Principles
//!
//! 1. **Pure Functions**: every transition takes `now` explicitly
//! 2. **No I/O**: database and network access is FORBIDDEN here
//! 3. **Integer Money**: all monetary values are minor units (i64)
//! 4. **Explicit Errors**: all errors are typed, never strings or panics
//!
//! ## Example Usage
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use tally_core::gate::{GateDecision, PausePolicy};
//! use tally_core::SyncStatus;
//!
//! let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
//! let status = SyncStatus::new("loc-1", "square");
//! assert_eq!(status.evaluate(now), GateDecision::Allowed);
//!
//! let policy = PausePolicy::default();
//! let failed = status.after_failure(now, std::time::Duration::from_secs(30), &policy, "timeout");
//! assert_eq!(failed.failures, 1);
//! assert!(!failed.evaluate(now).is_allowed());
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod aggregate;
pub mod breaker;
pub mod error;
pub mod gate;
pub mod money;
pub mod types;
pub mod validation;
pub mod vault;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use aggregate::ConsumptionSnapshot;
pub use breaker::{Admission, BreakerPolicy, BreakerState, RotationBreakerState};
pub use error::{CoreError, ValidationError, VaultError};
pub use gate::{BlockReason, GateDecision, PausePolicy};
pub use money::Money;
pub use types::*;
pub use vault::{CipherBundle, VaultKey};

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Consecutive gate failures after which a (location, provider) pair is
/// paused instead of merely backed off.
pub const PAUSE_THRESHOLD: u32 = 5;

/// Consecutive failed rotations that open the rotation circuit breaker.
pub const ROTATION_FAILURE_THRESHOLD: u32 = 10;

/// Maximum serialized size of a consumption record's `meta` object.
///
/// ## Business Reason
/// `meta` is free-form provider context for the dashboard; it is not a place
/// to park raw sale payloads.
pub const MAX_META_BYTES: usize = 16 * 1024;

/// Maximum number of days a single sync window may span.
pub const MAX_RANGE_DAYS: i64 = 31;
