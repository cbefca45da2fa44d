//! Soft, process-local overload tracking
//!
//! When the provider signals that a model is overloaded (503-style), the
//! model is marked unusable for a fixed window so the selector steers new
//! work elsewhere. This is a best-effort optimization only: entries live in
//! process memory, each process has its own view, and the admission ledger
//! remains the authority on hard limits.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default time a mark stays effective
pub const DEFAULT_OVERLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Process-local overload map
pub struct OverloadTracker {
    entries: Mutex<HashMap<String, Instant>>,
    timeout: Duration,
}

impl OverloadTracker {
    /// Create a tracker with the default timeout
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_OVERLOAD_TIMEOUT)
    }

    /// Create a tracker with a custom timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// The configured timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Mark a model as overloaded from now
    pub fn mark(&self, model: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(model.to_string(), Instant::now());
        tracing::warn!(model, "model marked overloaded");
    }

    /// Check whether a model is currently overloaded.
    ///
    /// Self-cleaning: an entry older than the timeout is removed on read
    /// and reported as absent.
    pub fn is_overloaded(&self, model: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(model) {
            Some(marked_at) if marked_at.elapsed() < self.timeout => true,
            Some(_) => {
                entries.remove(model);
                false
            }
            None => false,
        }
    }

    /// Proactively clear a model's entry if it has expired.
    ///
    /// Driven by a delayed one-shot task (delay = timeout) so the map does
    /// not grow between reads. A mark refreshed since scheduling survives.
    pub fn sweep(&self, model: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(marked_at) = entries.get(model) {
            if marked_at.elapsed() >= self.timeout {
                entries.remove(model);
                tracing::debug!(model, "expired overload entry swept");
            }
        }
    }

    /// Number of live entries (expired ones may still be counted until
    /// the next read or sweep touches them)
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Check if no entries are held
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

impl Default for OverloadTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_check() {
        let tracker = OverloadTracker::new();
        assert!(!tracker.is_overloaded("gemini-2.0-flash"));

        tracker.mark("gemini-2.0-flash");
        assert!(tracker.is_overloaded("gemini-2.0-flash"));
        assert!(!tracker.is_overloaded("gemini-2.5-flash"));
    }

    #[test]
    fn test_expired_entry_cleared_on_read() {
        let tracker = OverloadTracker::with_timeout(Duration::from_millis(0));
        tracker.mark("gemini-2.0-flash");

        assert!(!tracker.is_overloaded("gemini-2.0-flash"));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let expired = OverloadTracker::with_timeout(Duration::from_millis(0));
        expired.mark("m");
        expired.sweep("m");
        assert!(expired.is_empty());

        let fresh = OverloadTracker::new();
        fresh.mark("m");
        fresh.sweep("m");
        assert_eq!(fresh.len(), 1);
    }

    #[test]
    fn test_remark_refreshes() {
        let tracker = OverloadTracker::new();
        tracker.mark("m");
        tracker.mark("m");
        assert_eq!(tracker.len(), 1);
        assert!(tracker.is_overloaded("m"));
    }
}
