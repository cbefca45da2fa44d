//! Preference-ordered model selection
//!
//! The selector composes the admission ledger, the overload tracker and a
//! static preference order to pick a model for one provider call. It never
//! records usage itself; the caller does that after the call completes,
//! with the actual cost.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::Result;
use crate::models::QuotaKind;

use super::ledger::{AdmissionDecision, AdmissionLedger};
use super::limits::{limits_for, PREFERRED_MODELS};
use super::overload::OverloadTracker;

/// Why no model could be selected
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SelectionDenied {
    /// Candidates skipped because the caller excluded them
    pub excluded: usize,

    /// Candidates skipped because they are marked overloaded
    pub overloaded: usize,

    /// Candidates denied by the admission ledger
    pub quota_limited: usize,

    /// Smallest wait suggested by any quota denial
    pub min_wait_secs: Option<u64>,

    /// Model and dimension of the last quota denial, for the audit record
    pub last_denial: Option<(String, QuotaKind)>,
}

impl std::fmt::Display for SelectionDenied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "all candidates exhausted (excluded: {}, overloaded: {}, quota-limited: {})",
            self.excluded, self.overloaded, self.quota_limited
        )?;
        if let Some(wait) = self.min_wait_secs {
            write!(f, ", earliest retry in {wait}s")?;
        }
        Ok(())
    }
}

/// Outcome of a selection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionOutcome {
    /// A model was admitted for this request
    Selected {
        /// The admitted model
        model: String,
    },

    /// Every candidate was excluded, overloaded or quota-limited
    Denied(SelectionDenied),
}

/// Quota-aware model selector
pub struct ModelSelector {
    ledger: Arc<AdmissionLedger>,
    tracker: Arc<OverloadTracker>,
    default_model: String,
}

impl ModelSelector {
    /// Create a selector over a ledger and overload tracker
    pub fn new(
        ledger: Arc<AdmissionLedger>,
        tracker: Arc<OverloadTracker>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            ledger,
            tracker,
            default_model: default_model.into(),
        }
    }

    /// Candidate order: configured default first, then the static
    /// preference list, deduplicated and filtered to the active tier.
    fn candidates(&self) -> Vec<&str> {
        let tier = self.ledger.tier();
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        for model in std::iter::once(self.default_model.as_str()).chain(PREFERRED_MODELS.iter().copied())
        {
            if seen.insert(model) && limits_for(tier, model).is_some() {
                out.push(model);
            }
        }
        out
    }

    /// Pick a model for a request of the given estimated token cost.
    ///
    /// Skips excluded and overloaded candidates and returns the first one
    /// the ledger admits. The caller owns `record_usage` once the provider
    /// call actually completes.
    pub fn select(
        &self,
        estimated_tokens: u64,
        excluded: &HashSet<String>,
    ) -> Result<SelectionOutcome> {
        let mut denied = SelectionDenied::default();

        for model in self.candidates() {
            if excluded.contains(model) {
                denied.excluded += 1;
                continue;
            }
            if self.tracker.is_overloaded(model) {
                denied.overloaded += 1;
                continue;
            }

            match self.ledger.try_admit(model, estimated_tokens)? {
                AdmissionDecision::Allowed => {
                    tracing::debug!(model, estimated_tokens, "model admitted");
                    return Ok(SelectionOutcome::Selected {
                        model: model.to_string(),
                    });
                }
                AdmissionDecision::Denied {
                    dimension,
                    wait_secs,
                } => {
                    tracing::debug!(model, %dimension, wait_secs, "model quota-limited");
                    denied.quota_limited += 1;
                    denied.min_wait_secs = Some(
                        denied
                            .min_wait_secs
                            .map_or(wait_secs, |w| w.min(wait_secs)),
                    );
                    denied.last_denial = Some((model.to_string(), dimension));
                }
            }
        }

        Ok(SelectionOutcome::Denied(denied))
    }
}
