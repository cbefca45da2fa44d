//! Persistent windowed admission ledger
//!
//! The ledger is the hard authority on rate limits. Counters live in the
//! store as (model, minute-bucket) rows plus a parallel (model, day-bucket)
//! counter; a window "resets" by key rollover, never by zeroing. All
//! mutation goes through the store's atomic increment-or-create primitive,
//! so concurrent workers recording usage for the same model and minute
//! cannot lose updates.
//!
//! `record_usage` is not idempotent: callers call it exactly once per
//! admitted and executed request, with the actual cost reported by the
//! provider (which may differ from the estimate used at admission).

use std::sync::Arc;

use chrono::{DateTime, Duration, Local, Timelike, Utc};

use crate::error::Result;
use crate::models::QuotaKind;
use crate::storage::{QuotaRepository, WindowUsage};

use super::limits::{limits_for, ModelLimits, Tier};
use super::QuotaError;

/// Bucket keys for one instant.
///
/// The minute key is collision-free at minute granularity and sortable;
/// the day key is its date prefix. Both are local-time, matching the
/// day-boundary wait computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketKeys {
    /// Minute bucket, `YYYYMMDDHHMM`
    pub minute: String,

    /// Day bucket, `YYYYMMDD`
    pub day: String,
}

impl BucketKeys {
    /// Compute the keys for a given instant
    pub fn at(now: DateTime<Local>) -> Self {
        Self {
            minute: now.format("%Y%m%d%H%M").to_string(),
            day: now.format("%Y%m%d").to_string(),
        }
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// The request may proceed
    Allowed,

    /// The request would violate a limit
    Denied {
        /// First violated dimension (checks run RPM, TPM, RPD)
        dimension: QuotaKind,

        /// Seconds until the violated window resets
        wait_secs: u64,
    },
}

impl AdmissionDecision {
    /// Check if the decision allows the request
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Point-in-time usage snapshot for one model
#[derive(Debug, Clone)]
pub struct UsageSnapshot {
    pub model: String,
    pub minute_key: String,
    pub day_key: String,
    pub window: WindowUsage,
    pub requests_today: u32,
    pub limits: Option<ModelLimits>,
}

/// Seconds remaining in the current minute.
///
/// An approximation of the true window-reset distance; kept deliberately.
fn minute_wait(now: DateTime<Local>) -> u64 {
    (60 - now.second().min(59)) as u64
}

/// Seconds until the next local-day boundary
fn day_wait(now: DateTime<Local>) -> u64 {
    now.date_naive()
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .and_then(|ndt| ndt.and_local_timezone(Local).earliest())
        .map(|midnight| (midnight - now).num_seconds().max(0) as u64)
        .unwrap_or(86_400)
}

/// Quota-window expiry horizon (the store sweeps rows past it)
const WINDOW_TTL_HOURS: i64 = 24;

/// The admission ledger
pub struct AdmissionLedger {
    store: Arc<dyn QuotaRepository>,
    tier: Tier,
}

impl AdmissionLedger {
    /// Create a ledger over a quota store for the active tier
    pub fn new(store: Arc<dyn QuotaRepository>, tier: Tier) -> Self {
        Self { store, tier }
    }

    /// The active tier
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Decide whether a request with the given estimated token cost may
    /// proceed for `model` right now.
    pub fn try_admit(&self, model: &str, estimated_tokens: u64) -> Result<AdmissionDecision> {
        self.try_admit_at(model, estimated_tokens, Local::now())
    }

    /// Admission check against an explicit clock (used by tests)
    pub fn try_admit_at(
        &self,
        model: &str,
        estimated_tokens: u64,
        now: DateTime<Local>,
    ) -> Result<AdmissionDecision> {
        let limits = limits_for(self.tier, model).ok_or_else(|| QuotaError::UnknownModel {
            model: model.to_string(),
            tier: self.tier,
        })?;

        let keys = BucketKeys::at(now);
        let window = self.store.window_usage(model, &keys.minute)?;

        if window.requests >= limits.rpm {
            return Ok(AdmissionDecision::Denied {
                dimension: QuotaKind::Rpm,
                wait_secs: minute_wait(now),
            });
        }

        if window.tokens + estimated_tokens > limits.tpm {
            return Ok(AdmissionDecision::Denied {
                dimension: QuotaKind::Tpm,
                wait_secs: minute_wait(now),
            });
        }

        if let Some(rpd) = limits.rpd {
            let today = self.store.daily_usage(model, &keys.day)?;
            if today >= rpd {
                return Ok(AdmissionDecision::Denied {
                    dimension: QuotaKind::Rpd,
                    wait_secs: day_wait(now),
                });
            }
        }

        Ok(AdmissionDecision::Allowed)
    }

    /// Record one executed request with its actual token cost.
    ///
    /// Must be called exactly once per admitted request that was actually
    /// sent; the increment is atomic at the store.
    pub fn record_usage(&self, model: &str, actual_tokens: u64) -> Result<()> {
        self.record_usage_at(model, actual_tokens, Local::now())
    }

    /// Usage recording against an explicit clock (used by tests)
    pub fn record_usage_at(
        &self,
        model: &str,
        actual_tokens: u64,
        now: DateTime<Local>,
    ) -> Result<()> {
        let keys = BucketKeys::at(now);
        let expires_at = Utc::now() + Duration::hours(WINDOW_TTL_HOURS);
        self.store
            .increment_usage(model, &keys.minute, &keys.day, actual_tokens, expires_at)?;
        Ok(())
    }

    /// Snapshot current usage for one model
    pub fn usage(&self, model: &str) -> Result<UsageSnapshot> {
        self.usage_at(model, Local::now())
    }

    /// Usage snapshot against an explicit clock (used by tests)
    pub fn usage_at(&self, model: &str, now: DateTime<Local>) -> Result<UsageSnapshot> {
        let keys = BucketKeys::at(now);
        let window = self.store.window_usage(model, &keys.minute)?;
        let requests_today = self.store.daily_usage(model, &keys.day)?;

        Ok(UsageSnapshot {
            model: model.to_string(),
            minute_key: keys.minute,
            day_key: keys.day,
            window,
            requests_today,
            limits: limits_for(self.tier, model),
        })
    }
}
