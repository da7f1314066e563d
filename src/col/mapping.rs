use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, trace};

use crate::error::{EngineError, Result};

/// Mapping entry marking a missing output row.
pub const MISSING_ROW: i32 = -1;

/// Composes two mappings: `result[i] = inner[outer[i]]`, out-of-bounds in
/// either array reading as missing.
pub fn merge(outer: &[i32], inner: &[i32]) -> Vec<i32> {
    outer
        .iter()
        .map(|&o| {
            if o < 0 || o as usize >= inner.len() {
                MISSING_ROW
            } else {
                inner[o as usize]
            }
        })
        .collect()
}

/// Gathers `data` through `mapping` into a fresh array, writing `fill` for
/// out-of-range entries.
pub fn apply<T: Copy>(data: &[T], mapping: &[i32], fill: T) -> Vec<T> {
    mapping
        .iter()
        .map(|&m| {
            if m < 0 || m as usize >= data.len() {
                fill
            } else {
                data[m as usize]
            }
        })
        .collect()
}

/// Gather for object rows, filling `None` for out-of-range entries.
pub fn apply_cloned<T: Clone>(data: &[Option<T>], mapping: &[i32]) -> Vec<Option<T>> {
    mapping
        .iter()
        .map(|&m| {
            if m < 0 || m as usize >= data.len() {
                None
            } else {
                data[m as usize].clone()
            }
        })
        .collect()
}

/// The identity mapping over `len` rows.
pub fn identity(len: usize) -> Vec<i32> {
    (0..len as i32).collect()
}

/// De-duplicates mapping merges across the columns of one bulk map
/// operation.
///
/// Keyed by the allocation address of the inner mapping array, so columns
/// sharing a mapping share one merged result. The first caller per key
/// computes; concurrent callers block on the cell until it completes. The
/// cache borrows mapping identities only for the enclosing operation and
/// must not outlive it.
#[derive(Default)]
pub struct MergeCache {
    cells: Mutex<HashMap<usize, Arc<MergeCell>>>,
}

struct MergeCell {
    state: Mutex<CellState>,
    ready: Condvar,
}

enum CellState {
    Pending,
    Done(Arc<Vec<i32>>),
    Failed(EngineError),
}

/// Completes the owned cell exceptionally if the computation never finished,
/// so waiters cannot block forever.
struct CellGuard<'a> {
    cell: &'a MergeCell,
    armed: bool,
}

impl Drop for CellGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.cell.state.lock().unwrap();
            *state = CellState::Failed(EngineError::ExecutionAborted(
                "merge computation did not complete".into(),
            ));
            self.cell.ready.notify_all();
        }
    }
}

impl MergeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merged mapping `inner[outer[i]]`, computed at most once per identity
    /// of `inner` while this cache is shared.
    pub fn merged(&self, outer: &[i32], inner: &Arc<Vec<i32>>) -> Result<Arc<Vec<i32>>> {
        let key = Arc::as_ptr(inner) as usize;
        let (cell, owner) = {
            let mut cells = self.cells.lock().unwrap();
            match cells.get(&key) {
                Some(cell) => (cell.clone(), false),
                None => {
                    let cell = Arc::new(MergeCell {
                        state: Mutex::new(CellState::Pending),
                        ready: Condvar::new(),
                    });
                    cells.insert(key, cell.clone());
                    (cell, true)
                }
            }
        };

        if owner {
            let mut guard = CellGuard {
                cell: &cell,
                armed: true,
            };
            debug!("merging mapping identity {:#x}", key);
            let merged = Arc::new(merge(outer, inner));
            let mut state = cell.state.lock().unwrap();
            *state = CellState::Done(merged.clone());
            guard.armed = false;
            cell.ready.notify_all();
            Ok(merged)
        } else {
            trace!("waiting on mapping identity {:#x}", key);
            let mut state = cell.state.lock().unwrap();
            while matches!(*state, CellState::Pending) {
                state = cell.ready.wait(state).unwrap();
            }
            match &*state {
                CellState::Done(merged) => Ok(merged.clone()),
                CellState::Failed(cause) => {
                    Err(EngineError::ExecutionAborted(cause.to_string()))
                }
                CellState::Pending => unreachable!("woken before completion"),
            }
        }
    }
}

#[cfg(test)]
mod mapping_tests {

    use std::env::set_var;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::util;

    fn setup() {
        set_var("RUST_LOG", "info");
        util::init();
    }

    #[test]
    fn merge_composes_with_missing() {
        setup();
        let inner = vec![4, 3, 2, 1];
        let outer = vec![0, 2, -1, 9, 3];
        assert_eq!(merge(&outer, &inner), vec![4, 2, -1, -1, 1]);
    }

    #[test]
    fn apply_fills_out_of_range() {
        setup();
        let data = vec![10i64, 20, 30];
        assert_eq!(apply(&data, &[2, -1, 0, 7], 0), vec![30, 0, 10, 0]);

        let doubles = vec![1.5f64, 2.5];
        let gathered = apply(&doubles, &[1, 5], f64::NAN);
        assert_eq!(gathered[0], 2.5);
        assert!(gathered[1].is_nan());
    }

    #[test]
    fn merged_is_shared_by_identity() {
        setup();
        let cache = MergeCache::new();
        let inner = Arc::new(vec![1, 0]);
        let outer = vec![0, 1, 1];
        let a = cache.merged(&outer, &inner).unwrap();
        let b = cache.merged(&outer, &inner).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*a, vec![1, 0, 0]);

        // a different allocation with equal content computes separately
        let other = Arc::new(vec![1, 0]);
        let c = cache.merged(&outer, &other).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(*a, *c);
    }

    #[test]
    fn concurrent_merges_compute_once() {
        setup();
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        let cache = Arc::new(MergeCache::new());
        let inner = Arc::new(identity(512));
        let outer: Arc<Vec<i32>> = Arc::new((0..256).map(|i| i * 2).collect());

        let results: Vec<Arc<Vec<i32>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let cache = cache.clone();
                    let inner = inner.clone();
                    let outer = outer.clone();
                    scope.spawn(move || {
                        CALLS.fetch_add(1, Ordering::Relaxed);
                        cache.merged(&outer, &inner).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(CALLS.load(Ordering::Relaxed), 8);
        for pair in results.windows(2) {
            assert!(Arc::ptr_eq(&pair[0], &pair[1]));
        }
    }
}
