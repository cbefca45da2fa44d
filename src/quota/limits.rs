//! Static tiered rate-limit table
//!
//! Limits are indexed by (tier, model). A missing `rpd` means the model has
//! no daily cap in that tier. The table is deliberately a plain function
//! over static data; tier upgrades are a config change, not a data
//! migration.

use serde::{Deserialize, Serialize};

/// A named quota plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Free plan
    Free,
    /// First paid tier
    Tier1,
    /// Second paid tier
    Tier2,
    /// Third paid tier
    Tier3,
}

impl Tier {
    /// Get the provider-facing label (as it appears inside quota ids)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "FreeTier",
            Self::Tier1 => "Tier1",
            Self::Tier2 => "Tier2",
            Self::Tier3 => "Tier3",
        }
    }

    /// Create from a label (accepts both config names and provider labels)
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" | "FreeTier" => Some(Self::Free),
            "tier1" | "Tier1" => Some(Self::Tier1),
            "tier2" | "Tier2" => Some(Self::Tier2),
            "tier3" | "Tier3" => Some(Self::Tier3),
            _ => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Tier labels recognized inside provider quota ids
pub const KNOWN_TIER_LABELS: &[&str] = &["FreeTier", "Tier1", "Tier2", "Tier3"];

/// Static model preference order, tried after the configured default
pub const PREFERRED_MODELS: &[&str] = &[
    "gemini-2.5-flash",
    "gemini-2.5-flash-lite",
    "gemini-2.0-flash",
    "gemini-2.0-flash-lite",
];

/// Rate limits for one (tier, model) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLimits {
    /// Requests per minute
    pub rpm: u32,

    /// Tokens per minute
    pub tpm: u64,

    /// Requests per day; `None` means no daily cap
    pub rpd: Option<u32>,
}

/// Look up the limits for a model in a tier
pub fn limits_for(tier: Tier, model: &str) -> Option<ModelLimits> {
    let entry = match (tier, model) {
        (Tier::Free, "gemini-2.5-pro") => ModelLimits {
            rpm: 5,
            tpm: 250_000,
            rpd: Some(100),
        },
        (Tier::Tier1, "gemini-2.5-pro") => ModelLimits {
            rpm: 150,
            tpm: 2_000_000,
            rpd: Some(10_000),
        },
        (Tier::Tier2, "gemini-2.5-pro") => ModelLimits {
            rpm: 1_000,
            tpm: 5_000_000,
            rpd: Some(50_000),
        },
        (Tier::Tier3, "gemini-2.5-pro") => ModelLimits {
            rpm: 2_000,
            tpm: 8_000_000,
            rpd: None,
        },
        (Tier::Free, "gemini-2.5-flash") => ModelLimits {
            rpm: 10,
            tpm: 250_000,
            rpd: Some(250),
        },
        (Tier::Free, "gemini-2.5-flash-lite") => ModelLimits {
            rpm: 15,
            tpm: 250_000,
            rpd: Some(1_000),
        },
        (Tier::Free, "gemini-2.0-flash") => ModelLimits {
            rpm: 15,
            tpm: 1_000_000,
            rpd: Some(200),
        },
        (Tier::Free, "gemini-2.0-flash-lite") => ModelLimits {
            rpm: 30,
            tpm: 1_000_000,
            rpd: Some(200),
        },
        (Tier::Tier1, "gemini-2.5-flash") => ModelLimits {
            rpm: 1_000,
            tpm: 1_000_000,
            rpd: None,
        },
        (Tier::Tier1, "gemini-2.5-flash-lite") => ModelLimits {
            rpm: 4_000,
            tpm: 4_000_000,
            rpd: None,
        },
        (Tier::Tier1, "gemini-2.0-flash") => ModelLimits {
            rpm: 2_000,
            tpm: 4_000_000,
            rpd: None,
        },
        (Tier::Tier1, "gemini-2.0-flash-lite") => ModelLimits {
            rpm: 4_000,
            tpm: 4_000_000,
            rpd: None,
        },
        (Tier::Tier2, "gemini-2.5-flash") => ModelLimits {
            rpm: 2_000,
            tpm: 3_000_000,
            rpd: None,
        },
        (Tier::Tier2, "gemini-2.5-flash-lite") => ModelLimits {
            rpm: 10_000,
            tpm: 10_000_000,
            rpd: None,
        },
        (Tier::Tier2, "gemini-2.0-flash") => ModelLimits {
            rpm: 10_000,
            tpm: 10_000_000,
            rpd: None,
        },
        (Tier::Tier2, "gemini-2.0-flash-lite") => ModelLimits {
            rpm: 20_000,
            tpm: 10_000_000,
            rpd: None,
        },
        (Tier::Tier3, "gemini-2.5-flash") => ModelLimits {
            rpm: 10_000,
            tpm: 8_000_000,
            rpd: None,
        },
        (Tier::Tier3, "gemini-2.5-flash-lite") => ModelLimits {
            rpm: 30_000,
            tpm: 30_000_000,
            rpd: None,
        },
        (Tier::Tier3, "gemini-2.0-flash") => ModelLimits {
            rpm: 30_000,
            tpm: 30_000_000,
            rpd: None,
        },
        (Tier::Tier3, "gemini-2.0-flash-lite") => ModelLimits {
            rpm: 30_000,
            tpm: 30_000_000,
            rpd: None,
        },
        _ => return None,
    };

    Some(entry)
}

/// Models available in a tier, in static preference order
pub fn models_for(tier: Tier) -> Vec<&'static str> {
    PREFERRED_MODELS
        .iter()
        .copied()
        .filter(|m| limits_for(tier, m).is_some())
        .collect()
}
