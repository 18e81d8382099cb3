//! Per-run membership sets shared by the drivers, the fetcher and the
//! rewriter. Both start empty on every run.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;

use crate::error::FetchError;

/// A resource that has a file under the output root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Localized {
    pub path: PathBuf,
    /// False when the file was already on disk and no request was made.
    pub fetched: bool,
}

pub type AttemptResult = Result<Localized, FetchError>;

/// Page URLs already dispatched to the crawl driver.
#[derive(Debug, Default)]
pub struct VisitedSet {
    urls: Mutex<HashSet<String>>,
}

impl VisitedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check-and-insert as one guarded step. True if `url` was not yet
    /// visited and is now claimed by the caller.
    pub fn insert(&self, url: &str) -> bool {
        self.urls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_string())
    }

    pub fn contains(&self, url: &str) -> bool {
        self.urls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(url)
    }

    pub fn len(&self) -> usize {
        self.urls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resource URLs attempted in this run, with the outcome of the attempt.
///
/// Each URL owns a slot that is initialized exactly once. Concurrent
/// callers for a URL whose attempt is still running wait on the same slot,
/// so no URL is ever requested or written twice.
#[derive(Debug, Default)]
pub struct DownloadedSet {
    slots: Mutex<HashMap<String, Arc<OnceCell<AttemptResult>>>>,
}

impl DownloadedSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, url: &str) -> Arc<OnceCell<AttemptResult>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(url.to_string()).or_default())
    }

    /// Runs `attempt` unless `url` already has (or is getting) an outcome.
    ///
    /// Returns the recorded outcome and whether this call was the one that
    /// produced it.
    pub async fn attempt_once<F, Fut>(&self, url: &str, attempt: F) -> (AttemptResult, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AttemptResult>,
    {
        let slot = self.slot(url);
        let mut ran = false;
        let result = slot
            .get_or_init(|| {
                ran = true;
                attempt()
            })
            .await
            .clone();
        (result, ran)
    }

    /// Finished outcome for `url`, if any.
    pub fn outcome(&self, url: &str) -> Option<AttemptResult> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(url).and_then(|slot| slot.get().cloned())
    }

    pub fn contains(&self, url: &str) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(url)
    }

    /// Local file for `url` when it was localized successfully.
    pub fn localized_path(&self, url: &str) -> Option<PathBuf> {
        match self.outcome(url) {
            Some(Ok(localized)) => Some(localized.path),
            _ => None,
        }
    }

    /// Every finished attempt, sorted by URL.
    pub fn snapshot(&self) -> Vec<(String, AttemptResult)> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<_> = slots
            .iter()
            .filter_map(|(url, slot)| slot.get().map(|result| (url.clone(), result.clone())))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
