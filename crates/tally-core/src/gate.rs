//! # Scheduling Gate Transitions
//!
//! Pure state machine for the per-(location, provider) gate. The async
//! service that persists these rows lives in `tally-sync`; this module only
//! answers "may we sync now?" and "what does the row look like after this
//! outcome?".
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   ┌────────┐  failure (n < 5)   ┌───────────┐                          │
//! │   │ READY  │ ─────────────────► │  BACKOFF  │ next_attempt_at = now+d(n)│
//! │   │ n = 0  │ ◄───────────────── │  n ≥ 1    │                          │
//! │   └────────┘      success       └─────┬─────┘                          │
//! │        ▲                              │ failure (n ≥ 5)                 │
//! │        │ success                      ▼                                 │
//! │        │                        ┌───────────┐                          │
//! │        └─────────────────────── │  PAUSED   │ paused_until = now+cool  │
//! │                                 └───────────┘                          │
//! │                                                                         │
//! │  evaluate(now):                                                         │
//! │    paused_until    > now  → Blocked(paused_until)                       │
//! │    next_attempt_at > now  → Blocked(backoff)                            │
//! │    otherwise              → Allowed                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The backoff delay `d(n)` is computed by the caller (it is jittered, and
//! randomness stays out of this crate's state transitions).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::types::SyncStatus;
use crate::PAUSE_THRESHOLD;

/// Longest error message kept on the status row.
const MAX_ERROR_LEN: usize = 500;

// =============================================================================
// Decisions
// =============================================================================

/// Why the gate refused a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    /// The pair crossed the pause threshold and is cooling down.
    PausedUntil,
    /// The pair failed recently and is waiting out its backoff.
    Backoff,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::PausedUntil => "paused_until",
            BlockReason::Backoff => "backoff",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a gate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allowed,
    Blocked {
        reason: BlockReason,
        until: DateTime<Utc>,
        wait_ms: u64,
    },
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allowed)
    }

    /// Milliseconds until the gate reopens (0 when allowed).
    pub fn wait_ms(&self) -> u64 {
        match self {
            GateDecision::Allowed => 0,
            GateDecision::Blocked { wait_ms, .. } => *wait_ms,
        }
    }

    fn blocked(reason: BlockReason, until: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let wait_ms = (until - now).num_milliseconds().max(0) as u64;
        GateDecision::Blocked {
            reason,
            until,
            wait_ms,
        }
    }
}

// =============================================================================
// Policy
// =============================================================================

/// When a failing pair stops backing off and pauses instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PausePolicy {
    /// Failure count at which the pair is paused.
    pub threshold: u32,
    /// Fixed cool-down applied once the threshold is reached.
    pub cooldown: Duration,
}

impl Default for PausePolicy {
    fn default() -> Self {
        PausePolicy {
            threshold: PAUSE_THRESHOLD,
            cooldown: Duration::from_secs(60 * 60),
        }
    }
}

// =============================================================================
// Logger Acknowledgements
// =============================================================================

/// Returned by `log_success`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessAck {
    pub failures: u32,
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Returned by `log_error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorAck {
    pub failures: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_until: Option<DateTime<Utc>>,
}

impl From<&SyncStatus> for SuccessAck {
    fn from(status: &SyncStatus) -> Self {
        SuccessAck {
            failures: status.failures,
            last_run_at: status.last_run_at,
        }
    }
}

impl From<&SyncStatus> for ErrorAck {
    fn from(status: &SyncStatus) -> Self {
        ErrorAck {
            failures: status.failures,
            next_attempt_at: status.next_attempt_at,
            paused_until: status.paused_until,
        }
    }
}

// =============================================================================
// Transitions
// =============================================================================

impl SyncStatus {
    /// Decides whether a sync may start at `now`.
    ///
    /// Pause takes precedence over backoff.
    pub fn evaluate(&self, now: DateTime<Utc>) -> GateDecision {
        if let Some(until) = self.paused_until.filter(|until| *until > now) {
            return GateDecision::blocked(BlockReason::PausedUntil, until, now);
        }
        if let Some(until) = self.next_attempt_at.filter(|until| *until > now) {
            return GateDecision::blocked(BlockReason::Backoff, until, now);
        }
        GateDecision::Allowed
    }

    /// Row after a successful run: counters and deadlines cleared.
    pub fn after_success(&self, now: DateTime<Utc>) -> SyncStatus {
        SyncStatus {
            failures: 0,
            next_attempt_at: None,
            paused_until: None,
            last_run_at: Some(now),
            last_error: None,
            ..self.clone()
        }
    }

    /// Row after a failed run.
    ///
    /// `delay` is the (already jittered) backoff for the new failure count.
    /// Once the count reaches `policy.threshold` the pair is also paused for
    /// the fixed cool-down.
    pub fn after_failure(
        &self,
        now: DateTime<Utc>,
        delay: Duration,
        policy: &PausePolicy,
        error: &str,
    ) -> SyncStatus {
        let failures = self.failures.saturating_add(1);
        let next_attempt_at = Some(saturating_add(now, delay));
        let paused_until = if failures >= policy.threshold {
            Some(saturating_add(now, policy.cooldown))
        } else {
            self.paused_until
        };

        SyncStatus {
            failures,
            next_attempt_at,
            paused_until,
            last_error: Some(truncate(error, MAX_ERROR_LEN)),
            ..self.clone()
        }
    }
}

/// `now + duration`, saturating at the latest representable instant.
pub fn saturating_add(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn truncate(message: &str, max: usize) -> String {
    if message.len() <= max {
        return message.to_string();
    }
    let mut end = max;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn status() -> SyncStatus {
        SyncStatus::new("loc-1", "square")
    }

    #[test]
    fn test_fresh_status_is_allowed() {
        assert_eq!(status().evaluate(now()), GateDecision::Allowed);
    }

    #[test]
    fn test_backoff_blocks_until_next_attempt() {
        let mut s = status();
        s.next_attempt_at = Some(now() + chrono::Duration::seconds(90));

        match s.evaluate(now()) {
            GateDecision::Blocked {
                reason, wait_ms, ..
            } => {
                assert_eq!(reason, BlockReason::Backoff);
                assert_eq!(wait_ms, 90_000);
            }
            other => panic!("expected backoff, got {:?}", other),
        }

        // Exactly at the deadline the gate is open again
        assert!(s.evaluate(now() + chrono::Duration::seconds(90)).is_allowed());
    }

    #[test]
    fn test_pause_wins_over_backoff() {
        let mut s = status();
        s.next_attempt_at = Some(now() + chrono::Duration::seconds(30));
        s.paused_until = Some(now() + chrono::Duration::minutes(60));

        match s.evaluate(now()) {
            GateDecision::Blocked {
                reason, wait_ms, ..
            } => {
                assert_eq!(reason, BlockReason::PausedUntil);
                assert_eq!(wait_ms, 3_600_000);
            }
            other => panic!("expected pause, got {:?}", other),
        }
    }

    #[test]
    fn test_expired_pause_falls_through_to_backoff() {
        let mut s = status();
        s.paused_until = Some(now() - chrono::Duration::seconds(1));
        s.next_attempt_at = Some(now() + chrono::Duration::seconds(5));
        assert!(matches!(
            s.evaluate(now()),
            GateDecision::Blocked {
                reason: BlockReason::Backoff,
                ..
            }
        ));
    }

    #[test]
    fn test_failures_pause_at_threshold() {
        let policy = PausePolicy::default();
        let mut s = status();

        for n in 1..policy.threshold {
            s = s.after_failure(now(), Duration::from_secs(30), &policy, "boom");
            assert_eq!(s.failures, n);
            assert!(s.paused_until.is_none(), "paused too early at {}", n);
        }

        s = s.after_failure(now(), Duration::from_secs(30), &policy, "boom");
        assert_eq!(s.failures, policy.threshold);
        assert_eq!(
            s.paused_until,
            Some(now() + chrono::Duration::from_std(policy.cooldown).unwrap())
        );
        assert!(matches!(
            s.evaluate(now()),
            GateDecision::Blocked {
                reason: BlockReason::PausedUntil,
                ..
            }
        ));
    }

    #[test]
    fn test_success_always_resets() {
        let policy = PausePolicy::default();
        let mut s = status();
        for _ in 0..7 {
            s = s.after_failure(now(), Duration::from_secs(30), &policy, "boom");
        }
        let reset = s.after_success(now());
        assert_eq!(reset.failures, 0);
        assert!(reset.next_attempt_at.is_none());
        assert!(reset.paused_until.is_none());
        assert!(reset.last_error.is_none());
        assert_eq!(reset.last_run_at, Some(now()));
        assert!(reset.evaluate(now()).is_allowed());
    }

    #[test]
    fn test_error_message_truncated() {
        let long = "x".repeat(2_000);
        let s = status().after_failure(now(), Duration::from_secs(1), &PausePolicy::default(), &long);
        assert_eq!(s.last_error.map(|e| e.len()), Some(MAX_ERROR_LEN));
    }

    #[test]
    fn test_acks_mirror_status() {
        let s = status().after_failure(now(), Duration::from_secs(10), &PausePolicy::default(), "e");
        let ack = ErrorAck::from(&s);
        assert_eq!(ack.failures, 1);
        assert_eq!(ack.next_attempt_at, s.next_attempt_at);
        assert!(ack.paused_until.is_none());

        let ok = s.after_success(now());
        assert_eq!(SuccessAck::from(&ok).failures, 0);
    }

    #[test]
    fn test_block_reason_strings() {
        assert_eq!(BlockReason::PausedUntil.to_string(), "paused_until");
        assert_eq!(BlockReason::Backoff.to_string(), "backoff");
    }
}
