//! yeoul - Quota-aware content insight pipeline
//!
//! Moves content items through a staged processing pipeline while keeping
//! calls to an external inference provider inside a constrained, tiered
//! rate budget.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`models`] - Core data structures and the status vocabulary
//! - [`quota`] - Admission ledger, violation parser, overload tracking and
//!   model selection
//! - [`pipeline`] - Stage workers and the pipeline state machine
//! - [`provider`] - Inference and metadata provider clients
//! - [`queue`] - Work-queue collaborator interface and in-process queue
//! - [`storage`] - Persistent store (SQLite)
//! - [`metrics`] - Prometheus metrics
//!
//! # Example
//!
//! ```no_run
//! use yeoul::config::Config;
//! use yeoul::quota::{AdmissionLedger, Tier};
//! use yeoul::storage::SqliteStore;
//! use std::sync::Arc;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let store = Arc::new(SqliteStore::open(&config.storage.sqlite_path)?);
//!     let ledger = AdmissionLedger::new(store, Tier::Free);
//!     let decision = ledger.try_admit("gemini-2.5-flash", 2_048)?;
//!     println!("admitted: {}", decision.is_allowed());
//!     Ok(())
//! }
//! ```

pub mod commands;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod provider;
pub mod queue;
pub mod quota;
pub mod storage;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorCategory, Result, YeoulErrorTrait};
    pub use crate::models::{ContentItem, ContentStatus, QuotaKind, QuotaViolation};
    pub use crate::pipeline::Pipeline;
    pub use crate::quota::{AdmissionDecision, AdmissionLedger, ModelSelector, Tier};
    pub use crate::storage::{ContentRepository, QuotaRepository, SqliteStore};
}

// Direct re-exports for convenience
pub use models::{ContentItem, ContentStatus, QuotaKind, QuotaViolation};
