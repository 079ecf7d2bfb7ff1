//! # Scheduling Gate
//!
//! Decides whether a (location, provider) pair may sync right now, and
//! records how each run ended.
//!
//! ## Lifecycle of a gate row
//! ```text
//!                 log_error (failures < 5)
//!            ┌───────────────────────────────┐
//!            │                               ▼
//!     ┌─────────────┐               ┌─────────────────┐
//!     │   Allowed   │               │     Backoff     │  next_attempt_at > now
//!     │ failures: 0 │◄──────────────│  failures: 1..4 │
//!     └─────────────┘  log_success  └────────┬────────┘
//!            ▲                               │ log_error (failures >= 5)
//!            │                               ▼
//!            │                      ┌─────────────────┐
//!            └──────────────────────│     Paused      │  paused_until > now
//!                   log_success     └─────────────────┘
//! ```
//!
//! The gate is cooperative: `can_sync` followed by `start_sync` is not one
//! transaction. Two schedulers racing on the same pair may both start; the
//! consumption upsert is idempotent so the second run only rewrites the row.
//!
//! Reading the gate row never fails a sync. If the read errors the gate
//! answers `Allowed` and logs a warning.

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::GateSettings;
use crate::error::SyncResult;
use tally_core::gate::{ErrorAck, SuccessAck};
use tally_core::{GateDecision, PausePolicy};
use tally_db::{RunClose, SyncLogRepository};

/// Doublings before the interval is certainly capped; further steps are
/// no-ops.
const MAX_BACKOFF_STEPS: u32 = 32;

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential, capped, jittered delay between failed runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub initial: Duration,
    /// Ceiling for any delay.
    pub max: Duration,
    /// Randomization factor in `[0, 1)`; `0.2` means ±20%.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial: Duration::from_secs(30),
            max: Duration::from_secs(30 * 60),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after the `failures`-th consecutive failure.
    ///
    /// Doubles per failure starting at `initial`, never exceeds `max`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let mut backoff = self.create_backoff();
        let mut delay = self.initial;
        for _ in 0..failures.clamp(1, MAX_BACKOFF_STEPS) {
            match backoff.next_backoff() {
                Some(next) => delay = next,
                None => break,
            }
        }
        delay.min(self.max)
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial,
            initial_interval: self.initial,
            randomization_factor: self.jitter,
            multiplier: 2.0,
            max_interval: self.max,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

// =============================================================================
// Gate Service
// =============================================================================

/// The scheduling gate over the persisted run log.
#[derive(Debug, Clone)]
pub struct SyncGate {
    log: SyncLogRepository,
    backoff: BackoffPolicy,
    pause: PausePolicy,
}

impl SyncGate {
    /// Creates a gate with explicit policies.
    pub fn new(log: SyncLogRepository, backoff: BackoffPolicy, pause: PausePolicy) -> Self {
        SyncGate {
            log,
            backoff,
            pause,
        }
    }

    /// Creates a gate from the `[gate]` config section.
    pub fn from_settings(log: SyncLogRepository, settings: &GateSettings) -> Self {
        Self::new(log, settings.backoff_policy(), settings.pause_policy())
    }

    /// May this pair sync at `now`?
    ///
    /// Fail-open: a failed read is logged and treated as `Allowed`.
    pub async fn can_sync(
        &self,
        location_id: &str,
        provider: &str,
        now: DateTime<Utc>,
    ) -> GateDecision {
        let status = match self.log.get_status(location_id, provider).await {
            Ok(Some(status)) => status,
            Ok(None) => return GateDecision::Allowed,
            Err(e) => {
                warn!(
                    location_id,
                    provider,
                    error = %e,
                    "Gate read failed, allowing sync"
                );
                return GateDecision::Allowed;
            }
        };

        let decision = status.evaluate(now);
        match &decision {
            GateDecision::Allowed => {
                debug!(location_id, provider, failures = status.failures, "Gate open");
            }
            GateDecision::Blocked {
                reason, wait_ms, ..
            } => {
                info!(
                    location_id,
                    provider,
                    reason = %reason,
                    wait_ms,
                    failures = status.failures,
                    "Gate blocked sync"
                );
            }
        }
        decision
    }

    /// Opens a run. Returns its id.
    pub async fn start_sync(
        &self,
        location_id: &str,
        provider: &str,
        now: DateTime<Utc>,
    ) -> SyncResult<String> {
        let run = self.log.start_run(location_id, provider, now).await?;
        info!(location_id, provider, run_id = %run.run_id, "Sync run started");
        Ok(run.run_id)
    }

    /// Closes a run as successful and resets the pair's failure state.
    pub async fn log_success(
        &self,
        run_id: &str,
        count: i64,
        duration_ms: i64,
        now: DateTime<Utc>,
    ) -> SyncResult<SuccessAck> {
        let status = self
            .log
            .close_run(run_id, &RunClose::success(count, duration_ms), now, |current| {
                current.after_success(now)
            })
            .await?;

        info!(run_id, count, duration_ms, "Sync run succeeded");
        Ok(SuccessAck::from(&status))
    }

    /// Closes a run as failed and pushes the pair's next attempt out.
    pub async fn log_error(
        &self,
        run_id: &str,
        error: &str,
        duration_ms: i64,
        now: DateTime<Utc>,
    ) -> SyncResult<ErrorAck> {
        let backoff = self.backoff;
        let pause = self.pause;
        let status = self
            .log
            .close_run(run_id, &RunClose::error(error, duration_ms), now, |current| {
                let delay = backoff.delay_for(current.failures.saturating_add(1));
                current.after_failure(now, delay, &pause, error)
            })
            .await?;

        if status.paused_until.is_some() && status.failures >= self.pause.threshold {
            warn!(
                run_id,
                location_id = %status.location_id,
                provider = %status.provider,
                failures = status.failures,
                "Sync pair paused after repeated failures"
            );
        } else {
            warn!(run_id, failures = status.failures, error, "Sync run failed");
        }
        Ok(ErrorAck::from(&status))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
