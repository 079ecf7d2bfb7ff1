//! # Credential Rotation Job
//!
//! Refreshes provider tokens before they expire, behind a circuit breaker
//! that stops hammering providers when refreshes keep failing.
//!
//! ## Breaker
//! ```text
//!            10 consecutive failures
//!   ┌────────┐ ─────────────────────► ┌────────┐
//!   │ closed │                        │  open  │ resume_at = now + 6h
//!   └────────┘ ◄──────┐               └───┬────┘
//!        ▲            │ trial ok          │ resume_at passed
//!        │            │                   ▼
//!        │        ┌───┴───────┐       (next run)
//!        └────────│ half_open │ ◄─────────┘
//!     trial ok    └───┬───────┘
//!                     │ trial failed → open, resume_at = now + 12h
//! ```
//! Kept apart from the sync gate: a refresh failing says nothing about
//! whether sales can be fetched, and vice versa.
//!
//! ## Per-credential order
//! decrypt → refresh → validate new token → compare-and-swap. The stored
//! bundle is only replaced once the new token has been proven to work, and
//! the swap is one UPDATE, so readers never see a half-rotated credential.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::TallyConfig;
use crate::credentials::CredentialService;
use crate::error::{SyncError, SyncResult};
use crate::provider::AdapterContext;
use tally_core::gate::saturating_add;
use tally_core::{Admission, BreakerPolicy, BreakerState, CredentialRecord, RotationBreakerState};
use tally_db::{BreakerRepository, Database, DbError};

/// Breaker row owned by this job.
pub const ROTATION_BREAKER: &str = "credential_rotation";

/// What one batch did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationReport {
    pub rotated: u32,
    pub failed: u32,
    /// Not attempted or not counted: provider cannot rotate, or the row
    /// changed underneath us.
    pub skipped: u32,
    pub state: BreakerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<DateTime<Utc>>,
}

/// Rotates due credentials.
#[derive(Clone)]
pub struct RotationJob {
    credentials: CredentialService,
    breaker: BreakerRepository,
    policy: BreakerPolicy,
    /// Credentials expiring within this window are due.
    lead: Duration,
}

impl RotationJob {
    pub fn new(
        credentials: CredentialService,
        breaker: BreakerRepository,
        policy: BreakerPolicy,
        lead: Duration,
    ) -> Self {
        RotationJob {
            credentials,
            breaker,
            policy,
            lead,
        }
    }

    pub fn from_config(db: &Database, config: &TallyConfig, credentials: CredentialService) -> Self {
        Self::new(
            credentials,
            db.breaker(),
            config.rotation.breaker_policy(),
            config.rotation.lead(),
        )
    }

    /// Runs one batch.
    ///
    /// ## Errors
    /// * `SyncError::CircuitOpen` - the breaker is open and `resume_at` has
    ///   not passed
    pub async fn run(&self, now: DateTime<Utc>) -> SyncResult<RotationReport> {
        let mut state = self.breaker.load(ROTATION_BREAKER).await?;

        let limit = match state.admit(now) {
            Admission::Blocked { resume_at } => {
                info!(%resume_at, "Rotation breaker open, skipping batch");
                return Err(SyncError::CircuitOpen { resume_at });
            }
            Admission::Trial => {
                warn!(failures = state.failure_count, "Rotation breaker half-open, trying one credential");
                self.breaker.save(ROTATION_BREAKER, &state, now).await?;
                Some(1)
            }
            Admission::ProcessAll => None,
        };

        let deadline = saturating_add(now, self.lead);
        let due = self.credentials.due(deadline).await?;

        let mut report = RotationReport {
            rotated: 0,
            failed: 0,
            skipped: 0,
            state: state.state,
            resume_at: state.resume_at,
        };

        for record in &due {
            if limit.is_some_and(|limit| report.rotated + report.failed >= limit) {
                break;
            }

            match self.rotate_one(record, now).await {
                Ok(version) => {
                    report.rotated += 1;
                    state.record_success();
                    info!(
                        location_id = %record.location_id,
                        provider = %record.provider,
                        version,
                        "Credential rotated"
                    );
                }
                Err(SyncError::RotationUnsupported { .. }) => {
                    report.skipped += 1;
                }
                Err(SyncError::Database(DbError::StaleCredential { .. })) => {
                    report.skipped += 1;
                    info!(
                        location_id = %record.location_id,
                        provider = %record.provider,
                        "Credential changed during rotation, leaving it"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        location_id = %record.location_id,
                        provider = %record.provider,
                        error = %e,
                        "Credential rotation failed"
                    );
                    if state.record_failure(now, &self.policy) {
                        warn!(
                            failures = state.failure_count,
                            resume_at = ?state.resume_at,
                            "Rotation breaker opened"
                        );
                        break;
                    }
                }
            }
        }

        self.breaker.save(ROTATION_BREAKER, &state, now).await?;
        report.state = state.state;
        report.resume_at = state.resume_at;

        info!(
            rotated = report.rotated,
            failed = report.failed,
            skipped = report.skipped,
            state = %report.state,
            "Rotation batch finished"
        );
        Ok(report)
    }

    /// Current breaker row.
    pub async fn breaker_state(&self) -> SyncResult<RotationBreakerState> {
        Ok(self.breaker.load(ROTATION_BREAKER).await?)
    }

    async fn rotate_one(&self, record: &CredentialRecord, now: DateTime<Utc>) -> SyncResult<i64> {
        let current = self.credentials.decrypt(record)?;

        let adapter = self.credentials.registry().create(
            &record.provider,
            AdapterContext::for_credential(record.location_id.clone(), current.clone()),
        )?;
        let fresh = adapter.refresh(&current).await?;

        if !adapter.validate(&fresh.api_key).await? {
            return Err(SyncError::AuthenticationFailed {
                provider: record.provider.clone(),
            });
        }

        self.credentials.swap(record, &fresh, now).await
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{AdapterFactory, Page, PosAdapter, ProviderRegistry, SalesSource};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tally_core::vault::seal;
    use tally_core::{CanonicalSale, CredentialPayload, VaultKey};
    use tally_db::DbConfig;

    #[derive(Clone, Copy, PartialEq)]
    enum Refresh {
        Works,
        Fails,
        /// Refresh succeeds but the new key is refused.
        BadToken,
        Unsupported,
    }

    struct StubRotator {
        refresh: Refresh,
        refreshes: Arc<AtomicU32>,
    }

    #[async_trait]
    impl PosAdapter for StubRotator {
        type Raw = CanonicalSale;

        fn provider(&self) -> &'static str {
            "stub"
        }

        async fn validate(&self, api_key: &str) -> SyncResult<bool> {
            Ok(api_key.starts_with("fresh"))
        }

        async fn fetch_raw(&self, _cursor: Option<&str>) -> SyncResult<Page<CanonicalSale>> {
            Ok(Page::last(Vec::new()))
        }

        fn map(&self, raw: Vec<CanonicalSale>) -> Vec<CanonicalSale> {
            raw
        }

        async fn refresh(&self, current: &CredentialPayload) -> SyncResult<CredentialPayload> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            let api_key = match self.refresh {
                Refresh::Works => format!("fresh-{}", current.api_key),
                Refresh::BadToken => "revoked".to_string(),
                Refresh::Fails => {
                    return Err(SyncError::TransientProvider {
                        provider: "stub".into(),
                        message: "502".into(),
                    })
                }
                Refresh::Unsupported => {
                    return Err(SyncError::RotationUnsupported {
                        provider: "stub".into(),
                    })
                }
            };
            Ok(CredentialPayload {
                api_key,
                refresh_token: current.refresh_token.clone(),
                expires_at: Some(Utc::now() + chrono::Duration::days(30)),
                merchant_ref: current.merchant_ref.clone(),
            })
        }
    }

    struct StubFactory {
        refresh: Refresh,
        refreshes: Arc<AtomicU32>,
    }

    impl AdapterFactory for StubFactory {
        fn provider(&self) -> &'static str {
            "stub"
        }

        fn create(&self, _ctx: AdapterContext) -> Box<dyn SalesSource> {
            Box::new(StubRotator {
                refresh: self.refresh,
                refreshes: self.refreshes.clone(),
            })
        }
    }

    struct Harness {
        db: Database,
        key: VaultKey,
        job: RotationJob,
        refreshes: Arc<AtomicU32>,
    }

    async fn harness(refresh: Refresh) -> Harness {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let key = VaultKey::generate();
        let refreshes = Arc::new(AtomicU32::new(0));
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(StubFactory {
            refresh,
            refreshes: refreshes.clone(),
        }));

        let job = RotationJob::new(
            CredentialService::new(db.credentials(), key.clone(), registry),
            db.breaker(),
            BreakerPolicy::default(),
            Duration::from_secs(24 * 60 * 60),
        );
        Harness {
            db,
            key,
            job,
            refreshes,
        }
    }

    /// Stores a credential for `location` expiring `hours` from `now`.
    async fn enroll(h: &Harness, location: &str, now: DateTime<Utc>, hours: i64) {
        let payload = CredentialPayload {
            api_key: format!("key-{}", location),
            refresh_token: Some("r".into()),
            expires_at: Some(now + chrono::Duration::hours(hours)),
            merchant_ref: None,
        };
        let bundle = seal(&h.key, &payload).unwrap();
        h.db.credentials()
            .upsert(location, "stub", &bundle, payload.expires_at, now)
            .await
            .unwrap();
    }

    async fn stored_key(h: &Harness, location: &str) -> String {
        let record = h.db.credentials().get(location, "stub").await.unwrap().unwrap();
        let payload: CredentialPayload = tally_core::vault::open(&h.key, &record.bundle).unwrap();
        payload.api_key
    }

    #[tokio::test]
    async fn test_rotates_only_due_credentials() {
        let h = harness(Refresh::Works).await;
        let now = Utc::now();
        enroll(&h, "due", now, 2).await;
        enroll(&h, "later", now, 24 * 10).await;

        let report = h.job.run(now).await.unwrap();
        assert_eq!(report.rotated, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.state, BreakerState::Closed);

        assert_eq!(stored_key(&h, "due").await, "fresh-key-due");
        assert_eq!(stored_key(&h, "later").await, "key-later");
        let record = h.db.credentials().get("due", "stub").await.unwrap().unwrap();
        assert_eq!(record.version, 2);
        assert!(record.rotated_at.is_some());
    }

    #[tokio::test]
    async fn test_refused_new_token_keeps_old_bundle() {
        let h = harness(Refresh::BadToken).await;
        let now = Utc::now();
        enroll(&h, "loc-1", now, 1).await;

        let report = h.job.run(now).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(stored_key(&h, "loc-1").await, "key-loc-1");
        assert_eq!(h.job.breaker_state().await.unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn test_ten_failures_open_the_breaker() {
        let h = harness(Refresh::Fails).await;
        let now = Utc::now();
        for i in 0..12 {
            enroll(&h, &format!("loc-{}", i), now, 1).await;
        }

        let report = h.job.run(now).await.unwrap();
        assert_eq!(report.failed, 10);
        assert_eq!(report.state, BreakerState::Open);
        assert_eq!(report.resume_at, Some(now + chrono::Duration::hours(6)));
        // Batch stops as soon as the breaker opens
        assert_eq!(h.refreshes.load(Ordering::SeqCst), 10);

        let err = h.job.run(now + chrono::Duration::hours(1)).await.unwrap_err();
        assert!(matches!(err, SyncError::CircuitOpen { .. }));
        assert_eq!(h.refreshes.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_half_open_success_closes() {
        let h = harness(Refresh::Works).await;
        let now = Utc::now();
        for i in 0..3 {
            enroll(&h, &format!("loc-{}", i), now, 1).await;
        }
        let open = RotationBreakerState {
            state: BreakerState::Open,
            failure_count: 10,
            resume_at: Some(now - chrono::Duration::minutes(1)),
        };
        h.db.breaker().save(ROTATION_BREAKER, &open, now).await.unwrap();

        let report = h.job.run(now).await.unwrap();
        assert_eq!(report.rotated, 1, "half-open admits exactly one trial");
        assert_eq!(report.state, BreakerState::Closed);
        assert_eq!(h.job.breaker_state().await.unwrap(), RotationBreakerState::closed());
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens_longer() {
        let h = harness(Refresh::Fails).await;
        let now = Utc::now();
        enroll(&h, "loc-1", now, 1).await;
        enroll(&h, "loc-2", now, 1).await;
        let open = RotationBreakerState {
            state: BreakerState::Open,
            failure_count: 10,
            resume_at: Some(now - chrono::Duration::minutes(1)),
        };
        h.db.breaker().save(ROTATION_BREAKER, &open, now).await.unwrap();

        let report = h.job.run(now).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.state, BreakerState::Open);
        assert_eq!(report.resume_at, Some(now + chrono::Duration::hours(12)));
        assert_eq!(h.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsupported_provider_is_skipped_without_failure() {
        let h = harness(Refresh::Unsupported).await;
        let now = Utc::now();
        enroll(&h, "loc-1", now, 1).await;

        let report = h.job.run(now).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(h.job.breaker_state().await.unwrap().failure_count, 0);
    }
}
