use std::cmp::Ordering;

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Below this length numeric columns are always dense.
pub const MIN_SPARSE_COLUMN_SIZE: usize = 1024;

/// Number of rows the sparsity heuristic samples.
pub const SPARSITY_SAMPLE_SIZE: usize = 1024;

/// Minimal sampled frequency of the candidate default.
pub const MIN_SPARSITY: f64 = 0.625;

/// Sparsity estimate over a uniform random sample: the sampled mode and its
/// frequency. The caller-provided seed makes the estimate deterministic.
fn sample_mode<T, F>(data: &[T], seed: u64, cmp: F) -> Option<T>
where
    T: Copy,
    F: Fn(&T, &T) -> Ordering,
{
    if data.len() < MIN_SPARSE_COLUMN_SIZE {
        return None;
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut sample: Vec<T> = (0..SPARSITY_SAMPLE_SIZE)
        .map(|_| data[rng.gen_range(0..data.len())])
        .collect();
    sample.sort_unstable_by(|a, b| cmp(a, b));

    // the mode is the longest run of the sorted sample
    let mut mode = sample[0];
    let mut mode_count = 1usize;
    let mut run_start = 0usize;
    for i in 1..sample.len() {
        if cmp(&sample[i], &sample[run_start]) != Ordering::Equal {
            run_start = i;
        }
        let run = i - run_start + 1;
        if run > mode_count {
            mode_count = run;
            mode = sample[i];
        }
    }

    let estimate = mode_count as f64 / SPARSITY_SAMPLE_SIZE as f64;
    debug!(
        "sparsity estimate {:.3} over {} rows (threshold {})",
        estimate,
        data.len(),
        MIN_SPARSITY
    );
    if estimate >= MIN_SPARSITY {
        Some(mode)
    } else {
        None
    }
}

/// Candidate default for a double column, or `None` when the data is too
/// small or no value reaches the sparsity threshold.
pub(crate) fn detect_default_f64(data: &[f64], seed: u64) -> Option<f64> {
    sample_mode(data, seed, |a, b| a.total_cmp(b))
}

/// Candidate default for a long-backed column (time, date-time).
pub(crate) fn detect_default_i64(data: &[i64], seed: u64) -> Option<i64> {
    sample_mode(data, seed, |a, b| a.cmp(b))
}
