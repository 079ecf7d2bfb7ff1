//! # tally-sync: Ingestion Engine for Tally
//!
//! Pulls sales from POS providers, folds them into one daily consumption
//! snapshot per (location, provider, date), and keeps provider credentials
//! fresh.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally Sync Architecture                          │
//! │                                                                         │
//! │   external scheduler (cron / HTTP trigger)                              │
//! │          │                                                              │
//! │          ▼                                                              │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                     SyncEngine (engine.rs)                       │  │
//! │  └──────────┬──────────────────────┬──────────────────────┬─────────┘  │
//! │             ▼                      ▼                      ▼            │
//! │  ┌────────────────────┐  ┌──────────────────┐  ┌────────────────────┐  │
//! │  │ SyncOrchestrator   │  │ CredentialService│  │ RotationJob        │  │
//! │  │                    │  │                  │  │                    │  │
//! │  │ gate → fetch →     │─►│ seal / open      │◄─│ breaker → refresh  │  │
//! │  │ aggregate → upsert │  │ enroll           │  │ → validate → swap  │  │
//! │  └───┬──────────┬─────┘  └──────────────────┘  └────────────────────┘  │
//! │      ▼          ▼                                                       │
//! │  ┌────────┐ ┌──────────────────────────────────────┐                    │
//! │  │SyncGate│ │ ProviderRegistry                     │                    │
//! │  │backoff │ │  square (cursor) toast (page number) │                    │
//! │  │ pause  │ │  clover (offset)                     │                    │
//! │  └────────┘ └──────────────────────────────────────┘                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`config`] - Configuration (TOML + `TALLY_*` env)
//! - [`error`] - Sync error types
//! - [`gate`] - Scheduling gate: backoff and pause per pair
//! - [`retry`] - Immediate retry wrapper for provider calls
//! - [`provider`] - Adapter traits, registry and vendor adapters
//! - [`orchestrator`] - One sync run end to end
//! - [`credentials`] - Credential enrollment and decryption
//! - [`rotation`] - Token rotation behind a circuit breaker
//! - [`engine`] - Wiring for the CLI
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_sync::{SyncEngine, SyncRequest, TallyConfig};
//!
//! let config = TallyConfig::load(None)?;
//! let engine = SyncEngine::open(&config).await?;
//!
//! let outcome = engine.sync(&SyncRequest {
//!     client_id: "client-1".into(),
//!     location_id: "loc-1".into(),
//!     provider: "square".into(),
//!     range: DateRange::day(today),
//!     dry_run: false,
//! }).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod gate;
pub mod orchestrator;
pub mod provider;
pub mod retry;
pub mod rotation;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::TallyConfig;
pub use credentials::CredentialService;
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
pub use gate::{BackoffPolicy, SyncGate};
pub use orchestrator::{FetchLimits, SyncOrchestrator, SyncOutcome, SyncRequest};
pub use provider::{AdapterContext, AdapterFactory, Page, PosAdapter, ProviderRegistry, SalesSource};
pub use retry::BaseSync;
pub use rotation::{RotationJob, RotationReport, ROTATION_BREAKER};
