//! # Sync Orchestrator
//!
//! One call = one (location, provider, day) sync. Consumption is stored per
//! day, so a window is always a single day; backfills call once per day.
//!
//! ## Run Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  run_pos_sync(request)                                                  │
//! │                                                                         │
//! │  1. validate request (one day) ───► ValidationError (no side effects)   │
//! │  2. gate.can_sync ──── blocked ───► Ok(Skipped { reason, wait_ms })     │
//! │  3. gate.start_sync → run_id                                            │
//! │  4. ┌─ load credential, build adapter                                   │
//! │     │  fetch page → page → ... (sequential, each page retried+timed)    │
//! │     │  aggregate all sales into one snapshot                            │
//! │     └─ upsert consumption (skipped on dry run)                          │
//! │  5a. ok  → gate.log_success(run_id, count)  → Ok(Completed)             │
//! │  5b. err → gate.log_error(run_id, error)    → Err(original error)       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every run that passed the gate is closed in the run log, whichever way
//! it ends. If the success close itself fails, the run is closed as an
//! error instead. A failure to write the error outcome is logged and does
//! not replace the error being returned.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument};

use crate::config::TallyConfig;
use crate::credentials::CredentialService;
use crate::error::{SyncError, SyncResult};
use crate::gate::SyncGate;
use crate::provider::{AdapterContext, Page, SalesSource};
use crate::retry::BaseSync;
use tally_core::gate::SuccessAck;
use tally_core::validation::{validate_consumption, validate_identifier, validate_provider_id};
use tally_core::{
    BlockReason, CanonicalSale, ConsumptionInput, ConsumptionSnapshot, DateRange, GateDecision,
    UpsertReceipt, ValidationError,
};
use tally_db::{ConsumptionRepository, Database};

// =============================================================================
// Request / Outcome
// =============================================================================

/// What to sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub client_id: String,
    pub location_id: String,
    pub provider: String,
    pub range: DateRange,
    /// Fetch and aggregate, but write nothing to the consumption table.
    pub dry_run: bool,
}

/// How a sync call ended, short of an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SyncOutcome {
    /// The gate refused; nothing was fetched or recorded.
    Skipped {
        reason: BlockReason,
        until: DateTime<Utc>,
        wait_ms: u64,
    },
    /// The run finished and was logged as a success.
    Completed {
        run_id: String,
        count: i64,
        duration_ms: i64,
        dry_run: bool,
        record: ConsumptionInput,
        #[serde(skip_serializing_if = "Option::is_none")]
        receipt: Option<UpsertReceipt>,
        ack: SuccessAck,
    },
}

impl SyncOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, SyncOutcome::Skipped { .. })
    }

    /// Number of sales aggregated (0 when skipped).
    pub fn count(&self) -> i64 {
        match self {
            SyncOutcome::Skipped { .. } => 0,
            SyncOutcome::Completed { count, .. } => *count,
        }
    }
}

/// Limits applied to provider traffic within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchLimits {
    /// Per-page timeout.
    pub request_timeout: Duration,
    pub page_size: u32,
    /// Pagination guard.
    pub max_pages: u32,
}

impl Default for FetchLimits {
    fn default() -> Self {
        FetchLimits {
            request_timeout: Duration::from_secs(20),
            page_size: 100,
            max_pages: 500,
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Runs POS syncs end to end.
#[derive(Clone)]
pub struct SyncOrchestrator {
    gate: SyncGate,
    consumption: ConsumptionRepository,
    credentials: CredentialService,
    retry: BaseSync,
    limits: FetchLimits,
}

impl SyncOrchestrator {
    pub fn new(
        gate: SyncGate,
        consumption: ConsumptionRepository,
        credentials: CredentialService,
        retry: BaseSync,
        limits: FetchLimits,
    ) -> Self {
        SyncOrchestrator {
            gate,
            consumption,
            credentials,
            retry,
            limits,
        }
    }

    /// Wires an orchestrator from config over an open database.
    pub fn from_config(db: &Database, config: &TallyConfig, credentials: CredentialService) -> Self {
        Self::new(
            SyncGate::from_settings(db.sync_log(), &config.gate),
            db.consumption(),
            credentials,
            BaseSync::new(config.sync.retries),
            FetchLimits {
                request_timeout: config.sync.request_timeout(),
                page_size: config.sync.page_size,
                max_pages: config.sync.max_pages,
            },
        )
    }

    pub fn gate(&self) -> &SyncGate {
        &self.gate
    }

    /// Syncs one (location, provider, window).
    ///
    /// ## Returns
    /// * `Skipped` - the gate refused; no run was opened
    /// * `Completed` - the run succeeded and was logged
    ///
    /// ## Errors
    /// Validation errors are returned before anything is recorded. Every
    /// other error is first logged against the run, then returned unchanged.
    #[instrument(
        skip(self, request),
        fields(
            location_id = %request.location_id,
            provider = %request.provider,
            from = %request.range.from,
            to = %request.range.to
        )
    )]
    pub async fn run_pos_sync(&self, request: &SyncRequest) -> SyncResult<SyncOutcome> {
        self.validate(request)?;

        let now = Utc::now();
        if let GateDecision::Blocked {
            reason,
            until,
            wait_ms,
        } = self
            .gate
            .can_sync(&request.location_id, &request.provider, now)
            .await
        {
            return Ok(SyncOutcome::Skipped {
                reason,
                until,
                wait_ms,
            });
        }

        let run_id = self
            .gate
            .start_sync(&request.location_id, &request.provider, now)
            .await?;
        let started = Instant::now();

        match self.execute(request).await {
            Ok((record, receipt)) => {
                let duration_ms = elapsed_ms(started);
                let count = record.orders;
                let ack = match self
                    .gate
                    .log_success(&run_id, count, duration_ms, Utc::now())
                    .await
                {
                    Ok(ack) => ack,
                    Err(e) => {
                        self.record_failure(&run_id, &e, duration_ms).await;
                        return Err(e);
                    }
                };
                info!(run_id = %run_id, count, duration_ms, dry_run = request.dry_run, "Sync completed");
                Ok(SyncOutcome::Completed {
                    run_id,
                    count,
                    duration_ms,
                    dry_run: request.dry_run,
                    record,
                    receipt,
                    ack,
                })
            }
            Err(e) => {
                self.record_failure(&run_id, &e, elapsed_ms(started)).await;
                Err(e)
            }
        }
    }

    /// Closes the run as failed. The caller returns `cause` either way.
    async fn record_failure(&self, run_id: &str, cause: &SyncError, duration_ms: i64) {
        if let Err(log_err) = self
            .gate
            .log_error(run_id, &cause.to_string(), duration_ms, Utc::now())
            .await
        {
            error!(run_id, error = %log_err, "Failed to record sync failure");
        }
    }

    fn validate(&self, request: &SyncRequest) -> SyncResult<()> {
        validate_identifier("client_id", &request.client_id)?;
        validate_identifier("location_id", &request.location_id)?;
        validate_provider_id(&request.provider)?;
        if !self.credentials.registry().contains(&request.provider) {
            return Err(ValidationError::UnsupportedProvider {
                provider: request.provider.clone(),
            }
            .into());
        }
        let range = DateRange::new(request.range.from, request.range.to)?;
        if range.days() != 1 {
            return Err(ValidationError::OutOfRange {
                field: "range_days".to_string(),
                min: 1,
                max: 1,
            }
            .into());
        }
        Ok(())
    }

    /// Steps that count against the gate when they fail.
    async fn execute(
        &self,
        request: &SyncRequest,
    ) -> SyncResult<(ConsumptionInput, Option<UpsertReceipt>)> {
        let credential = self
            .credentials
            .load_payload(&request.location_id, &request.provider)
            .await?;
        let ctx = AdapterContext::for_range(
            request.location_id.clone(),
            credential,
            request.range,
            self.limits.page_size,
        );
        let source = self.credentials.registry().create(&request.provider, ctx)?;

        let sales = self.fetch_all(source.as_ref()).await?;
        let record = ConsumptionSnapshot::from_sales(&sales).into_input(
            &request.client_id,
            &request.location_id,
            &request.provider,
            &request.range,
        );
        validate_consumption(&record)?;

        if request.dry_run {
            debug!(orders = record.orders, "Dry run, not storing consumption");
            return Ok((record, None));
        }
        let receipt = self.consumption.upsert(&record).await?;
        Ok((record, Some(receipt)))
    }

    /// Walks every page in order.
    async fn fetch_all(&self, source: &dyn SalesSource) -> SyncResult<Vec<CanonicalSale>> {
        let mut sales = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0u32;

        loop {
            if pages >= self.limits.max_pages {
                return Err(SyncError::TooManyPages {
                    provider: source.provider().to_string(),
                    max_pages: self.limits.max_pages,
                });
            }

            let page = self
                .retry
                .run("fetch_sales", || self.fetch_page(source, cursor.as_deref()))
                .await?;
            pages += 1;
            debug!(page = pages, sales = page.data.len(), "Fetched page");
            sales.extend(page.data);

            match page.next {
                Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                    return Err(SyncError::InvalidResponse {
                        provider: source.provider().to_string(),
                        message: format!("cursor {} did not advance", next),
                    });
                }
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(sales)
    }

    async fn fetch_page(
        &self,
        source: &dyn SalesSource,
        cursor: Option<&str>,
    ) -> SyncResult<Page<CanonicalSale>> {
        timeout(self.limits.request_timeout, source.fetch_sales(cursor))
            .await
            .map_err(|_| SyncError::Timeout {
                provider: source.provider().to_string(),
                secs: self.limits.request_timeout.as_secs(),
            })?
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{AdapterFactory, PosAdapter, ProviderRegistry};
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tally_core::vault::seal;
    use tally_core::{CredentialPayload, Money, PausePolicy, SaleMeta, SyncRunState, VaultKey};
    use tally_db::DbConfig;

    // -------------------------------------------------------------------------
    // Stub provider
    // -------------------------------------------------------------------------

    #[derive(Clone, Copy)]
    enum Script {
        /// Serve the pages.
        Pages,
        /// Every fetch fails transiently.
        Unavailable,
        /// Every fetch hangs past the timeout.
        Hang,
    }

    struct StubFactory {
        pages: Vec<usize>,
        script: Script,
        fetches: Arc<AtomicU32>,
    }

    struct StubAdapter {
        pages: Vec<usize>,
        script: Script,
        fetches: Arc<AtomicU32>,
    }

    fn sale(id: usize) -> CanonicalSale {
        CanonicalSale {
            external_id: format!("s-{}", id),
            occurred_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            total: Money::from_cents(250),
            discount: Money::zero(),
            tax: Money::from_cents(20),
            status: Some("completed".into()),
            items: Vec::new(),
            meta: SaleMeta::new("stub"),
        }
    }

    #[async_trait]
    impl PosAdapter for StubAdapter {
        type Raw = CanonicalSale;

        fn provider(&self) -> &'static str {
            "stub"
        }

        async fn validate(&self, _api_key: &str) -> SyncResult<bool> {
            Ok(true)
        }

        async fn fetch_raw(&self, cursor: Option<&str>) -> SyncResult<Page<CanonicalSale>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            match self.script {
                Script::Unavailable => {
                    return Err(SyncError::TransientProvider {
                        provider: "stub".into(),
                        message: "503".into(),
                    })
                }
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                Script::Pages => {}
            }

            let index: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
            let offset: usize = self.pages[..index].iter().sum();
            let data = (0..self.pages[index]).map(|i| sale(offset + i)).collect();
            let next = (index + 1 < self.pages.len()).then(|| (index + 1).to_string());
            Ok(Page { data, next })
        }

        fn map(&self, raw: Vec<CanonicalSale>) -> Vec<CanonicalSale> {
            raw
        }
    }

    impl AdapterFactory for StubFactory {
        fn provider(&self) -> &'static str {
            "stub"
        }

        fn create(&self, _ctx: AdapterContext) -> Box<dyn SalesSource> {
            Box::new(StubAdapter {
                pages: self.pages.clone(),
                script: self.script,
                fetches: self.fetches.clone(),
            })
        }
    }

    // -------------------------------------------------------------------------
    // Harness
    // -------------------------------------------------------------------------

    struct Harness {
        db: Database,
        orchestrator: SyncOrchestrator,
        fetches: Arc<AtomicU32>,
    }

    async fn harness(pages: Vec<usize>, script: Script) -> Harness {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let key = VaultKey::generate();
        let bundle = seal(&key, &CredentialPayload::api_key("k")).unwrap();
        db.credentials()
            .upsert("loc-1", "stub", &bundle, None, Utc::now())
            .await
            .unwrap();

        let fetches = Arc::new(AtomicU32::new(0));
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(StubFactory {
            pages,
            script,
            fetches: fetches.clone(),
        }));

        let gate = SyncGate::new(
            db.sync_log(),
            crate::gate::BackoffPolicy::default(),
            PausePolicy::default(),
        );
        let orchestrator = SyncOrchestrator::new(
            gate,
            db.consumption(),
            CredentialService::new(db.credentials(), key, registry),
            BaseSync::new(1),
            FetchLimits {
                request_timeout: Duration::from_millis(200),
                page_size: 2,
                max_pages: 10,
            },
        );
        Harness {
            db,
            orchestrator,
            fetches,
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    fn request(dry_run: bool) -> SyncRequest {
        SyncRequest {
            client_id: "client-1".into(),
            location_id: "loc-1".into(),
            provider: "stub".into(),
            range: DateRange::day(day()),
            dry_run,
        }
    }

    // -------------------------------------------------------------------------
    // Tests
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_pages_are_concatenated() {
        let h = harness(vec![3, 2], Script::Pages).await;

        let outcome = h.orchestrator.run_pos_sync(&request(false)).await.unwrap();
        assert_eq!(outcome.count(), 5);

        let stored = h
            .db
            .consumption()
            .get("loc-1", "stub", day())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.orders, 5);
        assert_eq!(stored.total.cents(), 1250);
        assert_eq!(stored.taxes.cents(), 100);
        assert_eq!(stored.client_id, "client-1");

        let status = h.db.sync_log().get_status("loc-1", "stub").await.unwrap().unwrap();
        assert_eq!(status.failures, 0);
        assert!(status.last_run_at.is_some());
    }

    #[tokio::test]
    async fn test_other_page_shape() {
        let h = harness(vec![2, 1], Script::Pages).await;
        let outcome = h.orchestrator.run_pos_sync(&request(false)).await.unwrap();
        assert_eq!(outcome.count(), 3);
    }

    #[tokio::test]
    async fn test_dry_run_writes_no_consumption() {
        let h = harness(vec![1], Script::Pages).await;

        match h.orchestrator.run_pos_sync(&request(true)).await.unwrap() {
            SyncOutcome::Completed {
                receipt, dry_run, ..
            } => {
                assert!(receipt.is_none());
                assert!(dry_run);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(h
            .db
            .consumption()
            .get("loc-1", "stub", day())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_fetch_error_is_logged_and_rethrown() {
        let h = harness(vec![1], Script::Unavailable).await;

        let err = h.orchestrator.run_pos_sync(&request(false)).await.unwrap_err();
        assert!(matches!(err, SyncError::TransientProvider { .. }));
        // One retry, then give up
        assert_eq!(h.fetches.load(Ordering::SeqCst), 2);

        assert!(h
            .db
            .consumption()
            .get("loc-1", "stub", day())
            .await
            .unwrap()
            .is_none());

        let status = h.db.sync_log().get_status("loc-1", "stub").await.unwrap().unwrap();
        assert_eq!(status.failures, 1);
        assert!(status.next_attempt_at.is_some());

        let runs = h.db.sync_log().recent_runs("loc-1", "stub", 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].error.as_deref().unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_blocked_gate_skips_without_side_effects() {
        let h = harness(vec![1], Script::Unavailable).await;
        h.orchestrator.run_pos_sync(&request(false)).await.unwrap_err();
        let fetches_after_failure = h.fetches.load(Ordering::SeqCst);

        let outcome = h.orchestrator.run_pos_sync(&request(false)).await.unwrap();
        match outcome {
            SyncOutcome::Skipped {
                reason, wait_ms, ..
            } => {
                assert_eq!(reason, BlockReason::Backoff);
                assert!(wait_ms > 0);
            }
            other => panic!("expected skip, got {:?}", other),
        }

        // No fetch and no new run row
        assert_eq!(h.fetches.load(Ordering::SeqCst), fetches_after_failure);
        let runs = h.db.sync_log().recent_runs("loc-1", "stub", 10).await.unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let h = harness(vec![1], Script::Hang).await;

        let err = h.orchestrator.run_pos_sync(&request(false)).await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout { .. }));

        let status = h.db.sync_log().get_status("loc-1", "stub").await.unwrap().unwrap();
        assert_eq!(status.failures, 1);
    }

    #[tokio::test]
    async fn test_runaway_pagination_is_cut_off() {
        let h = harness(vec![1; 20], Script::Pages).await;

        let err = h.orchestrator.run_pos_sync(&request(false)).await.unwrap_err();
        assert!(matches!(err, SyncError::TooManyPages { max_pages: 10, .. }));
    }

    #[tokio::test]
    async fn test_validation_happens_before_gate() {
        let h = harness(vec![1], Script::Pages).await;

        let mut bad = request(false);
        bad.provider = "lightspeed".into();
        let err = h.orchestrator.run_pos_sync(&bad).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Validation(ValidationError::UnsupportedProvider { .. })
        ));

        let mut inverted = request(false);
        inverted.range = DateRange {
            from: day(),
            to: day().pred_opt().unwrap(),
        };
        assert!(matches!(
            h.orchestrator.run_pos_sync(&inverted).await.unwrap_err(),
            SyncError::Validation(_)
        ));

        assert!(h
            .db
            .sync_log()
            .recent_runs("loc-1", "lightspeed", 10)
            .await
            .unwrap()
            .is_empty());
        assert!(h
            .db
            .sync_log()
            .recent_runs("loc-1", "stub", 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_multi_day_window_is_rejected() {
        let h = harness(vec![3], Script::Pages).await;

        let mut week = request(false);
        week.range = DateRange::new(day(), NaiveDate::from_ymd_opt(2024, 5, 7).unwrap()).unwrap();
        let err = h.orchestrator.run_pos_sync(&week).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Validation(ValidationError::OutOfRange { max: 1, .. })
        ));

        assert_eq!(h.fetches.load(Ordering::SeqCst), 0);
        assert!(h
            .db
            .consumption()
            .get("loc-1", "stub", day())
            .await
            .unwrap()
            .is_none());
        assert!(h
            .db
            .sync_log()
            .recent_runs("loc-1", "stub", 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_failed_success_close_still_closes_run() {
        let h = harness(vec![2], Script::Pages).await;
        sqlx::query(
            r#"
            CREATE TRIGGER reject_success_close
            BEFORE UPDATE OF status ON sync_runs
            WHEN NEW.status = 'success'
            BEGIN
                SELECT RAISE(ABORT, 'disk I/O error');
            END
            "#,
        )
        .execute(h.db.pool())
        .await
        .unwrap();

        let err = h.orchestrator.run_pos_sync(&request(false)).await.unwrap_err();
        assert!(matches!(err, SyncError::Database(_)));

        let runs = h.db.sync_log().recent_runs("loc-1", "stub", 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, SyncRunState::Error);
        assert!(runs[0].error.as_deref().unwrap().contains("disk I/O error"));

        let status = h.db.sync_log().get_status("loc-1", "stub").await.unwrap().unwrap();
        assert_eq!(status.failures, 1);
    }

    #[test]
    fn test_outcome_json_uses_camel_case() {
        let until = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let skipped = SyncOutcome::Skipped {
            reason: BlockReason::Backoff,
            until,
            wait_ms: 30_000,
        };
        let json = serde_json::to_value(&skipped).unwrap();
        assert_eq!(json["outcome"], "skipped");
        assert_eq!(json["waitMs"], 30_000);
        assert!(json.get("wait_ms").is_none());
    }

    #[tokio::test]
    async fn test_missing_credential_counts_against_gate() {
        let h = harness(vec![1], Script::Pages).await;
        let mut other = request(false);
        other.location_id = "loc-2".into();

        let err = h.orchestrator.run_pos_sync(&other).await.unwrap_err();
        assert!(matches!(err, SyncError::MissingCredential { .. }));
        let status = h.db.sync_log().get_status("loc-2", "stub").await.unwrap().unwrap();
        assert_eq!(status.failures, 1);
    }

    #[tokio::test]
    async fn test_rerun_replaces_snapshot() {
        let h = harness(vec![2], Script::Pages).await;
        let first = h.orchestrator.run_pos_sync(&request(false)).await.unwrap();
        let second = h.orchestrator.run_pos_sync(&request(false)).await.unwrap();

        let id = |outcome: &SyncOutcome| match outcome {
            SyncOutcome::Completed { receipt, .. } => receipt.clone().unwrap().id,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(id(&first), id(&second));
        let stored = h
            .db
            .consumption()
            .get("loc-1", "stub", day())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.orders, 2);
    }
}
