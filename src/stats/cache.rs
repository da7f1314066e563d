use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, RwLock};

use crate::stats::{StatResult, Statistic};

/// Per-column memoization of computed statistics.
///
/// Reads of populated entries go through the read lock only; computation is
/// serialized per column by the compute gate, with a re-check under the gate
/// so concurrent requests never duplicate work.
#[derive(Default)]
pub struct StatsCache {
    results: RwLock<HashMap<Statistic, StatResult>>,
    compute: Mutex<()>,
}

impl StatsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, statistic: Statistic) -> Option<StatResult> {
        self.results.read().unwrap().get(&statistic).cloned()
    }

    pub(crate) fn put(&self, statistic: Statistic, result: StatResult) {
        self.results.write().unwrap().insert(statistic, result);
    }

    pub(crate) fn lock_compute(&self) -> MutexGuard<'_, ()> {
        self.compute.lock().unwrap()
    }
}
