//! Quota-aware admission control and model selection
//!
//! This module is the gatekeeper for every call to the inference provider:
//!
//! - [`limits`] - Static tiered rate-limit table per model
//! - [`ledger`] - Persistent windowed admission ledger (the hard authority)
//! - [`violation`] - Defensive parser for provider quota-error payloads
//! - [`overload`] - Soft, process-local overload tracking
//! - [`selector`] - Preference-ordered model selection over the above

pub mod ledger;
pub mod limits;
pub mod overload;
pub mod selector;
pub mod violation;

pub use ledger::{AdmissionDecision, AdmissionLedger, BucketKeys, UsageSnapshot};
pub use limits::{limits_for, models_for, ModelLimits, Tier, PREFERRED_MODELS};
pub use overload::OverloadTracker;
pub use selector::{ModelSelector, SelectionDenied, SelectionOutcome};
pub use violation::{parse_quota_error, ParsedViolation};

use thiserror::Error;

use crate::models::QuotaKind;

/// Errors from the admission ledger and model selector
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuotaError {
    /// A rate limit would be exceeded; carries the violated dimension and
    /// the seconds remaining until the window resets
    #[error("Quota exceeded for {model}: {dimension}, retry in {wait_secs}s")]
    Exceeded {
        model: String,
        dimension: QuotaKind,
        wait_secs: u64,
    },

    /// The model has no limits entry in the active tier
    #[error("Model {model} is not available in tier {tier}")]
    UnknownModel { model: String, tier: Tier },

    /// No candidate model could be admitted
    #[error("No model available: {0}")]
    NoModelAvailable(SelectionDenied),
}

impl QuotaError {
    /// Check if this error is recoverable (can be retried)
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Windows roll over; waiting and retrying is the designed path
            Self::Exceeded { .. } | Self::NoModelAvailable(_) => true,
            Self::UnknownModel { .. } => false,
        }
    }
}
