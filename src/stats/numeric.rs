use std::sync::Arc;

use log::trace;

use crate::col::types::TypeId;
use crate::col::{Column, Order};
use crate::error::Result;
use crate::exec::Context;
use crate::stats::cache::StatsCache;
use crate::stats::{batch_ranges, StatResult, Statistic, REDUCE_BATCH};

/// Single-pass numeric aggregate: count of non-missing values, extremes and
/// mean. Batches carry the running sum and fold it into a mean before
/// combination, so combining stays numerically stable.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NumericCounts {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl NumericCounts {
    fn empty() -> Self {
        Self {
            count: 0,
            min: f64::NAN,
            max: f64::NAN,
            mean: f64::NAN,
        }
    }
}

/// Weighted combination of two batch aggregates:
/// `mean = alpha * meanA + (1 - alpha) * meanB` with `alpha` the count
/// share of the first batch. A mean pushed outside the observed range by
/// precision loss is clamped to the nearer finite extreme.
fn combine(a: NumericCounts, b: NumericCounts) -> NumericCounts {
    if a.count == 0 {
        return b;
    }
    if b.count == 0 {
        return a;
    }
    let count = a.count + b.count;
    let alpha = a.count as f64 / count as f64;
    let mut mean = alpha * a.mean + (1.0 - alpha) * b.mean;
    let min = a.min.min(b.min);
    let max = a.max.max(b.max);
    if mean < min {
        mean = if min.is_finite() { min } else { f64::NAN };
    } else if mean > max {
        mean = if max.is_finite() { max } else { f64::NAN };
    }
    NumericCounts {
        count,
        min,
        max,
        mean,
    }
}

fn counts<C: Context>(ctx: &C, column: &Column) -> Result<NumericCounts> {
    let tasks: Vec<_> = batch_ranges(column.size(), ctx.parallelism())
        .into_iter()
        .map(|range| {
            move || {
                let mut buf = vec![0.0f64; REDUCE_BATCH.min(range.len())];
                let mut count = 0usize;
                let mut min = f64::INFINITY;
                let mut max = f64::NEG_INFINITY;
                let mut sum = 0.0f64;
                let mut offset = range.start;
                while offset < range.end {
                    ctx.require_active()?;
                    let n = (range.end - offset).min(buf.len());
                    column.fill_numeric(&mut buf[..n], offset)?;
                    for &v in &buf[..n] {
                        if v.is_nan() {
                            continue;
                        }
                        count += 1;
                        min = min.min(v);
                        max = max.max(v);
                        sum += v;
                    }
                    offset += n;
                }
                // fold the temporaries before batches combine
                Ok(if count == 0 {
                    NumericCounts::empty()
                } else {
                    NumericCounts {
                        count,
                        min,
                        max,
                        mean: sum / count as f64,
                    }
                })
            }
        })
        .collect();

    let merged = ctx
        .call(tasks)?
        .into_iter()
        .fold(NumericCounts::empty(), combine);
    trace!(
        "numeric counts: n={} min={} max={} mean={}",
        merged.count,
        merged.min,
        merged.max,
        merged.mean
    );
    Ok(merged)
}

/// Sample variance via a second pass against a known mean. Needs at least
/// two values and a finite mean, `NaN` otherwise.
fn sample_variance<C: Context>(
    ctx: &C,
    column: &Column,
    count: usize,
    mean: f64,
) -> Result<f64> {
    if count < 2 || !mean.is_finite() {
        return Ok(f64::NAN);
    }
    struct Deviation {
        count: usize,
        msd: f64,
    }

    let tasks: Vec<_> = batch_ranges(column.size(), ctx.parallelism())
        .into_iter()
        .map(|range| {
            move || {
                let mut buf = vec![0.0f64; REDUCE_BATCH.min(range.len())];
                let mut n = 0usize;
                let mut sum = 0.0f64;
                let mut offset = range.start;
                while offset < range.end {
                    ctx.require_active()?;
                    let len = (range.end - offset).min(buf.len());
                    column.fill_numeric(&mut buf[..len], offset)?;
                    for &v in &buf[..len] {
                        if v.is_nan() {
                            continue;
                        }
                        n += 1;
                        sum += (v - mean) * (v - mean);
                    }
                    offset += len;
                }
                Ok(Deviation {
                    count: n,
                    msd: if n == 0 { 0.0 } else { sum / n as f64 },
                })
            }
        })
        .collect();

    let mut total = 0usize;
    let mut msd = 0.0f64;
    for part in ctx.call(tasks)? {
        if part.count == 0 {
            continue;
        }
        let combined = total + part.count;
        let alpha = total as f64 / combined as f64;
        msd = alpha * msd + (1.0 - alpha) * part.msd;
        total = combined;
    }
    // population to sample variance
    Ok(msd * total as f64 / (total as f64 - 1.0))
}

/// NIST percentile over the ascending sorted view: `rank = p * (n + 1)`,
/// linear interpolation between the two neighboring positions.
fn percentile(column: &Column, count: usize, p: f64) -> Result<f64> {
    if count == 0 {
        return Ok(f64::NAN);
    }
    let perm = column.sort(Order::ASCENDING)?;
    let mapping: Arc<Vec<i32>> = Arc::new(perm.into_iter().map(|r| r as i32).collect());
    let sorted = column.map(&mapping, true);

    let rank = p * (count + 1) as f64;
    let idx = rank.floor() as i64;
    let weight = rank - idx as f64;

    let mut pair = [0.0f64; 2];
    if idx < 1 {
        sorted.fill_numeric(&mut pair[..1], 0)?;
        return Ok(pair[0]);
    }
    if idx >= count as i64 {
        sorted.fill_numeric(&mut pair[..1], count - 1)?;
        return Ok(pair[0]);
    }
    sorted.fill_numeric(&mut pair, idx as usize - 1)?;
    Ok(pair[0] + weight * (pair[1] - pair[0]))
}

/// Reads the single-pass aggregate through the cache, computing and storing
/// it on a miss. Must run under the column's compute gate.
fn ensure_counts<C: Context>(
    ctx: &C,
    column: &Column,
    cache: &StatsCache,
) -> Result<NumericCounts> {
    if let (Some(count), Some(min), Some(max), Some(mean)) = (
        cache.get(Statistic::COUNT),
        cache.get(Statistic::MIN),
        cache.get(Statistic::MAX),
        cache.get(Statistic::MEAN),
    ) {
        return Ok(NumericCounts {
            count: count.numeric as usize,
            min: min.numeric,
            max: max.numeric,
            mean: mean.numeric,
        });
    }
    let computed = counts(ctx, column)?;
    cache.put(
        Statistic::COUNT,
        StatResult::of_numeric(computed.count as f64),
    );
    cache.put(Statistic::MIN, StatResult::of_numeric(computed.min));
    cache.put(Statistic::MAX, StatResult::of_numeric(computed.max));
    cache.put(Statistic::MEAN, StatResult::of_numeric(computed.mean));
    Ok(computed)
}

/// Numeric statistics for double and time columns. Derived values that fall
/// out of the same pass are stored alongside the requested one.
pub(crate) fn compute_numeric<C: Context>(
    ctx: &C,
    column: &Column,
    statistic: Statistic,
    cache: &StatsCache,
) -> Result<()> {
    match statistic {
        Statistic::COUNT | Statistic::MIN | Statistic::MAX | Statistic::MEAN => {
            ensure_counts(ctx, column, cache)?;
        }
        Statistic::VAR | Statistic::SD => {
            let counts = ensure_counts(ctx, column, cache)?;
            let var = sample_variance(ctx, column, counts.count, counts.mean)?;
            if column.column_type().id() != TypeId::TIME {
                cache.put(Statistic::VAR, StatResult::of_numeric(var));
            }
            cache.put(Statistic::SD, StatResult::of_numeric(var.sqrt()));
        }
        Statistic::P25 | Statistic::P50 | Statistic::P75 | Statistic::MEDIAN => {
            let counts = ensure_counts(ctx, column, cache)?;
            let p = match statistic {
                Statistic::P25 => 0.25,
                Statistic::P75 => 0.75,
                _ => 0.5,
            };
            let value = percentile(column, counts.count, p)?;
            cache.put(statistic, StatResult::of_numeric(value));
            // the median and the 50th percentile are the same value
            match statistic {
                Statistic::P50 => cache.put(Statistic::MEDIAN, StatResult::of_numeric(value)),
                Statistic::MEDIAN => cache.put(Statistic::P50, StatResult::of_numeric(value)),
                _ => {}
            }
        }
        other => unreachable!("{} is not a numeric statistic", other),
    }
    Ok(())
}
