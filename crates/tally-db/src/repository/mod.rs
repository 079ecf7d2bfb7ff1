//! # Repository Module
//!
//! Database repository implementations for Tally.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Pattern Explained                         │
//! │                                                                         │
//! │  Orchestrator / Gate / Rotation job                                    │
//! │       │                                                                 │
//! │       │  db.consumption().upsert(&input)                               │
//! │       ▼                                                                 │
//! │  ConsumptionRepository                                                 │
//! │  ├── upsert(&self, input)          → UpsertReceipt | Forbidden         │
//! │  ├── get(&self, loc, prov, date)                                       │
//! │  └── list_for_location(&self, ...)                                     │
//! │       │                                                                 │
//! │       │  SQL Query                                                      │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! │                                                                         │
//! │  Every read-modify-write of shared state (gate row, credential,        │
//! │  breaker) is a single statement or a single transaction here.          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`ConsumptionRepository`] - Idempotent consumption snapshots
//! - [`SyncLogRepository`] - Sync runs and gate status rows
//! - [`CredentialRepository`] - Sealed credentials with compare-and-swap
//! - [`BreakerRepository`] - Rotation breaker state

pub mod breaker;
pub mod consumption;
pub mod credential;
pub mod sync_log;

pub use breaker::BreakerRepository;
pub use consumption::ConsumptionRepository;
pub use credential::CredentialRepository;
pub use sync_log::{RunClose, SyncLogRepository};
