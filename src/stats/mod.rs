pub mod cache;
mod categorical;
mod numeric;

use std::ops::Range;
use std::sync::Arc;

use log::debug;
use strum::{Display, EnumString};

use crate::col::datetime::{self, DateTimeColumn};
use crate::col::dict::MISSING_INDEX;
use crate::col::object::{ObjectColumn, ObjectValue};
use crate::col::types::{ColumnType, TypeId};
use crate::col::Column;
use crate::error::{EngineError, Result};
use crate::exec::Context;
use crate::stats::cache::StatsCache;

/// Rows a reduction task handles between cancellation checks.
pub(crate) const REDUCE_BATCH: usize = 2048;

/// Tags of the derivable statistics.
#[allow(non_camel_case_types)]
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Display, EnumString, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Statistic {
    COUNT,
    MIN,
    MAX,
    MEAN,
    VAR,
    SD,
    P25,
    P50,
    P75,
    MEDIAN,
    LEAST,
    MODE,
    INDEX_COUNTS,
}

/// Result of a statistic, populated per the column category.
#[derive(Debug, Clone, PartialEq)]
pub struct StatResult {
    pub numeric: f64,
    pub categorical: i32,
    pub object: Option<StatObject>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatObject {
    Value(ObjectValue),
    IndexCounts(Arc<Vec<u64>>),
}

impl StatResult {
    pub(crate) fn of_numeric(numeric: f64) -> Self {
        Self {
            numeric,
            categorical: MISSING_INDEX,
            object: None,
        }
    }

    pub(crate) fn of_categorical(index: i32, count: f64, value: Option<ObjectValue>) -> Self {
        Self {
            numeric: count,
            categorical: index,
            object: value.map(StatObject::Value),
        }
    }
}

/// Whether `statistic` is derivable for columns of `ctype`.
pub fn supported(ctype: &ColumnType, statistic: Statistic) -> bool {
    use Statistic::*;
    match ctype.id() {
        TypeId::REAL | TypeId::INTEGER_53_BIT => {
            matches!(statistic, COUNT | MIN | MAX | MEAN | VAR | SD | P25 | P50 | P75 | MEDIAN)
        }
        // the variance of nanoseconds of day overflows the time range, the
        // standard deviation stays representable
        TypeId::TIME => {
            matches!(statistic, COUNT | MIN | MAX | MEAN | SD | P25 | P50 | P75 | MEDIAN)
        }
        TypeId::DATE_TIME => matches!(statistic, COUNT | MIN | MAX),
        TypeId::NOMINAL => matches!(statistic, COUNT | LEAST | MODE | INDEX_COUNTS),
        _ => matches!(statistic, COUNT),
    }
}

/// Derives one statistic, memoized on the column.
pub fn compute<C: Context>(ctx: &C, column: &Column, statistic: Statistic) -> Result<StatResult> {
    let mut results = compute_all(ctx, column, &[statistic])?;
    Ok(results.remove(0))
}

/// Derives several statistics in one request, computing only the subset the
/// column's cache does not hold yet.
pub fn compute_all<C: Context>(
    ctx: &C,
    column: &Column,
    statistics: &[Statistic],
) -> Result<Vec<StatResult>> {
    for &statistic in statistics {
        if !supported(column.column_type(), statistic) {
            return Err(EngineError::Unsupported(format!(
                "statistic {} for type {}",
                statistic,
                column.column_type().id()
            )));
        }
    }
    let cache = column.stats_cache();
    let mut missing: Vec<Statistic> = statistics
        .iter()
        .copied()
        .filter(|&s| cache.get(s).is_none())
        .collect();
    missing.dedup();
    if !missing.is_empty() {
        let _compute = cache.lock_compute();
        for statistic in missing {
            if cache.get(statistic).is_some() {
                continue;
            }
            debug!("computing {} for {}", statistic, column.column_type().id());
            compute_and_store(ctx, column, statistic, cache)?;
        }
    }
    Ok(statistics
        .iter()
        .map(|&s| cache.get(s).expect("ERR_STATISTIC_NOT_COMPUTED"))
        .collect())
}

fn compute_and_store<C: Context>(
    ctx: &C,
    column: &Column,
    statistic: Statistic,
    cache: &StatsCache,
) -> Result<()> {
    match column {
        Column::Numeric(_) | Column::Time(_) => {
            numeric::compute_numeric(ctx, column, statistic, cache)
        }
        Column::Categorical(col) => categorical::compute_categorical(ctx, col, statistic, cache),
        Column::DateTime(col) => compute_date_time(ctx, col, cache),
        Column::Object(col) => compute_object_count(ctx, col, cache),
    }
}

/// Contiguous batch ranges, at most one per unit of parallelism.
pub(crate) fn batch_ranges(size: usize, parallelism: usize) -> Vec<Range<usize>> {
    let tasks = parallelism.max(1).min(size.max(1));
    let chunk = (size + tasks - 1) / tasks;
    (0..tasks)
        .map(|t| t * chunk..((t + 1) * chunk).min(size))
        .filter(|r| !r.is_empty())
        .collect()
}

/// Date-time statistics: one pass computing count, min and max instants.
fn compute_date_time<C: Context>(
    ctx: &C,
    col: &DateTimeColumn,
    cache: &StatsCache,
) -> Result<()> {
    struct Extremes {
        count: usize,
        min: Option<(i64, i32)>,
        max: Option<(i64, i32)>,
    }

    let tasks: Vec<_> = batch_ranges(col.size(), ctx.parallelism())
        .into_iter()
        .map(|range| {
            move || {
                let mut part = Extremes {
                    count: 0,
                    min: None,
                    max: None,
                };
                let mut offset = range.start;
                while offset < range.end {
                    ctx.require_active()?;
                    let upto = (offset + REDUCE_BATCH).min(range.end);
                    for row in offset..upto {
                        let seconds = col.seconds_at(row as i64);
                        if seconds == datetime::MISSING_VALUE {
                            continue;
                        }
                        let instant = (seconds, col.nanos_at(row as i64));
                        part.count += 1;
                        part.min = Some(part.min.map_or(instant, |m| m.min(instant)));
                        part.max = Some(part.max.map_or(instant, |m| m.max(instant)));
                    }
                    offset = upto;
                }
                Ok(part)
            }
        })
        .collect();

    let mut count = 0usize;
    let mut min: Option<(i64, i32)> = None;
    let mut max: Option<(i64, i32)> = None;
    for part in ctx.call(tasks)? {
        count += part.count;
        min = match (min, part.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        max = match (max, part.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    cache.put(Statistic::COUNT, StatResult::of_numeric(count as f64));
    cache.put(Statistic::MIN, instant_result(min));
    cache.put(Statistic::MAX, instant_result(max));
    Ok(())
}

fn instant_result(instant: Option<(i64, i32)>) -> StatResult {
    match instant {
        Some((seconds, nanos)) => StatResult {
            numeric: seconds as f64,
            categorical: MISSING_INDEX,
            object: Some(StatObject::Value(ObjectValue::Instant { seconds, nanos })),
        },
        None => StatResult::of_numeric(f64::NAN),
    }
}

/// Object statistics: the non-missing count.
fn compute_object_count<C: Context>(
    ctx: &C,
    col: &ObjectColumn,
    cache: &StatsCache,
) -> Result<()> {
    let tasks: Vec<_> = batch_ranges(col.size(), ctx.parallelism())
        .into_iter()
        .map(|range| {
            move || {
                let mut count = 0usize;
                let mut offset = range.start;
                while offset < range.end {
                    ctx.require_active()?;
                    let upto = (offset + REDUCE_BATCH).min(range.end);
                    count += (offset..upto)
                        .filter(|&row| col.value(row as i64).is_some())
                        .count();
                    offset = upto;
                }
                Ok(count)
            }
        })
        .collect();
    let count: usize = ctx.call(tasks)?.into_iter().sum();
    cache.put(Statistic::COUNT, StatResult::of_numeric(count as f64));
    Ok(())
}
