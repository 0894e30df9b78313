//! Scrape target registry
//!
//! Maps `<namespace>/<name>` to the endpoint a collector should scrape for that
//! pod. The whole map sits behind one lock. Only the reconciler writes to it;
//! the scraping side reads snapshots.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use http::Uri;

/// A resolved scrape endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeTarget {
    /// URI after address rewriting; this is what gets scraped
    pub url: Uri,
    /// Bare pod address
    pub address: String,
    /// URI before address rewriting
    pub original_url: Uri,
    /// Annotations, synthesized pod tags and labels, in that order of precedence
    pub tags: BTreeMap<String, String>,
}

/// Thread-safe registry of scrape targets keyed by pod
#[derive(Clone, Default)]
pub struct TargetRegistry {
    inner: Arc<Mutex<HashMap<String, ScrapeTarget>>>,
}

impl TargetRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ScrapeTarget>> {
        // Entries are replaced whole, so a panicked writer cannot leave one half-updated
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with exclusive access to the map
    pub(crate) fn with_targets<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, ScrapeTarget>) -> R,
    ) -> R {
        f(&mut self.lock())
    }

    /// Look up the target registered for a pod key
    pub fn get(&self, key: &str) -> Option<ScrapeTarget> {
        self.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Get the number of registered targets
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Consistent copy of every registered target, ordered by key
    pub fn snapshot(&self) -> BTreeMap<String, ScrapeTarget> {
        self.lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl std::fmt::Debug for TargetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetRegistry")
            .field("targets", &self.len())
            .finish()
    }
}
