use std::sync::Arc;

use log::trace;

use crate::col::categorical::CategoricalColumn;
use crate::col::dict::MISSING_INDEX;
use crate::col::object::ObjectValue;
use crate::error::Result;
use crate::exec::Context;
use crate::stats::cache::StatsCache;
use crate::stats::{batch_ranges, StatObject, StatResult, Statistic, REDUCE_BATCH};

/// One-pass accumulation of a counter per category index; batch counters
/// combine by elementwise sum.
fn index_counts<C: Context>(ctx: &C, col: &CategoricalColumn) -> Result<Vec<u64>> {
    let counters = col.dictionary().maximal_index() as usize + 1;
    let tasks: Vec<_> = batch_ranges(col.size(), ctx.parallelism())
        .into_iter()
        .map(|range| {
            move || {
                let mut counts = vec![0u64; counters];
                let mut buf = vec![0i32; REDUCE_BATCH.min(range.len())];
                let mut offset = range.start;
                while offset < range.end {
                    ctx.require_active()?;
                    let n = (range.end - offset).min(buf.len());
                    col.fill_indices(&mut buf[..n], offset);
                    for &idx in &buf[..n] {
                        counts[idx as usize] += 1;
                    }
                    offset += n;
                }
                Ok(counts)
            }
        })
        .collect();

    let mut merged = vec![0u64; counters];
    for part in ctx.call(tasks)? {
        for (total, c) in merged.iter_mut().zip(part) {
            *total += c;
        }
    }
    trace!("index counts over {} categories", counters);
    Ok(merged)
}

fn category_result(col: &CategoricalColumn, index: i32, count: u64) -> StatResult {
    let value = col
        .dictionary()
        .get(index)
        .map(|v| ObjectValue::Text(v.to_string()));
    StatResult::of_categorical(index, count as f64, value)
}

/// Categorical statistics. All of them derive from the index counter array,
/// which is computed once and cached.
pub(crate) fn compute_categorical<C: Context>(
    ctx: &C,
    col: &CategoricalColumn,
    statistic: Statistic,
    cache: &StatsCache,
) -> Result<()> {
    let counts = match cache.get(Statistic::INDEX_COUNTS) {
        Some(StatResult {
            object: Some(StatObject::IndexCounts(counts)),
            ..
        }) => counts,
        _ => {
            let counts = Arc::new(index_counts(ctx, col)?);
            cache.put(
                Statistic::INDEX_COUNTS,
                StatResult {
                    numeric: f64::NAN,
                    categorical: MISSING_INDEX,
                    object: Some(StatObject::IndexCounts(counts.clone())),
                },
            );
            counts
        }
    };

    match statistic {
        Statistic::INDEX_COUNTS => {}
        Statistic::COUNT => {
            let count = col.size() as u64 - counts[MISSING_INDEX as usize];
            cache.put(Statistic::COUNT, StatResult::of_numeric(count as f64));
        }
        Statistic::MODE => {
            // ties resolve to the lowest index
            let mode = counts
                .iter()
                .enumerate()
                .skip(1)
                .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(&a.0)))
                .filter(|(_, &count)| count > 0);
            let result = match mode {
                Some((index, &count)) => category_result(col, index as i32, count),
                None => StatResult::of_categorical(MISSING_INDEX, 0.0, None),
            };
            cache.put(Statistic::MODE, result);
        }
        Statistic::LEAST => {
            // the least frequent category that actually occurs
            let least = counts
                .iter()
                .enumerate()
                .skip(1)
                .filter(|(_, &count)| count > 0)
                .min_by(|a, b| a.1.cmp(b.1).then(a.0.cmp(&b.0)));
            let result = match least {
                Some((index, &count)) => category_result(col, index as i32, count),
                None => StatResult::of_categorical(MISSING_INDEX, 0.0, None),
            };
            cache.put(Statistic::LEAST, result);
        }
        other => unreachable!("{} is not a categorical statistic", other),
    }
    Ok(())
}
