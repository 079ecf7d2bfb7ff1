//! # Rotation Circuit Breaker
//!
//! Guards the background credential-rotation job. This breaker is NOT the
//! scheduling gate: the gate is per (location, provider) and protects
//! provider APIs from sync storms, while this one is process-wide and
//! protects the whole credential estate from a rotation job that keeps
//! failing (bad vault key, provider OAuth outage, ...).
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   ┌──────────┐   10 consecutive failures   ┌──────────┐                │
//! │   │  CLOSED  │ ──────────────────────────► │   OPEN   │ resume_at=+6h  │
//! │   │ rotate   │                             │ skip all │                │
//! │   │ all due  │                             └────┬─────┘                │
//! │   └──────────┘                                  │ now ≥ resume_at      │
//! │        ▲                                        ▼                      │
//! │        │ trial succeeds                  ┌─────────────┐               │
//! │        └──────────────────────────────── │  HALF_OPEN  │               │
//! │                                          │  1 trial    │               │
//! │                  trial fails             └──────┬──────┘               │
//! │   OPEN (resume_at=+12h) ◄───────────────────────┘                      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use ts_rs::TS;

use crate::gate::saturating_add;
use crate::ROTATION_FAILURE_THRESHOLD;

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::HalfOpen => write!(f, "half_open"),
            BreakerState::Open => write!(f, "open"),
        }
    }
}

/// Thresholds and open durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    /// How long the breaker stays open after tripping from closed.
    pub open_for: Duration,
    /// How long the breaker stays open after a failed half-open trial.
    pub reopen_for: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        BreakerPolicy {
            failure_threshold: ROTATION_FAILURE_THRESHOLD,
            open_for: Duration::from_secs(6 * 60 * 60),
            reopen_for: Duration::from_secs(12 * 60 * 60),
        }
    }
}

/// What the rotation job may do on this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Closed: rotate every due credential.
    ProcessAll,
    /// Half-open: rotate exactly one credential.
    Trial,
    /// Open: rotate nothing.
    Blocked { resume_at: DateTime<Utc> },
}

/// Persisted breaker row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct RotationBreakerState {
    pub state: BreakerState,
    pub failure_count: u32,
    #[ts(as = "Option<String>")]
    pub resume_at: Option<DateTime<Utc>>,
}

impl Default for RotationBreakerState {
    fn default() -> Self {
        RotationBreakerState::closed()
    }
}

impl RotationBreakerState {
    pub fn closed() -> Self {
        RotationBreakerState {
            state: BreakerState::Closed,
            failure_count: 0,
            resume_at: None,
        }
    }

    /// Decides what this run may do, moving open → half_open once
    /// `resume_at` has passed.
    ///
    /// The caller persists the state when it changed.
    pub fn admit(&mut self, now: DateTime<Utc>) -> Admission {
        match self.state {
            BreakerState::Closed => Admission::ProcessAll,
            BreakerState::HalfOpen => Admission::Trial,
            BreakerState::Open => match self.resume_at {
                Some(resume_at) if resume_at > now => Admission::Blocked { resume_at },
                _ => {
                    self.state = BreakerState::HalfOpen;
                    Admission::Trial
                }
            },
        }
    }

    /// A rotation succeeded.
    pub fn record_success(&mut self) {
        *self = RotationBreakerState::closed();
    }

    /// A rotation failed. Returns true if this failure opened the breaker.
    pub fn record_failure(&mut self, now: DateTime<Utc>, policy: &BreakerPolicy) -> bool {
        self.failure_count = self.failure_count.saturating_add(1);
        match self.state {
            BreakerState::HalfOpen => {
                self.open(now, policy.reopen_for);
                true
            }
            BreakerState::Closed if self.failure_count >= policy.failure_threshold => {
                self.open(now, policy.open_for);
                true
            }
            _ => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == BreakerState::Open
    }

    fn open(&mut self, now: DateTime<Utc>, duration: Duration) {
        self.state = BreakerState::Open;
        self.resume_at = Some(saturating_add(now, duration));
    }
}
