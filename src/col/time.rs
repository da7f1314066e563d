use std::sync::Arc;

use derivative::Derivative;
use lazy_static::lazy_static;
use log::debug;

use crate::col::bitmap::{SparseBitmap, DEFAULT_INDEX};
use crate::col::mapping::{self, MergeCache};
use crate::col::sparsity;
use crate::col::types::{type_of, ColumnType, TypeId};
use crate::col::{fill_count, Order, MAPPING_THRESHOLD};
use crate::error::{EngineError, Result};
use crate::stats::cache::StatsCache;

/// Missing nanoseconds-of-day value.
pub const MISSING_VALUE: i64 = i64::MAX;

/// Last valid nanosecond of a day.
pub const MAX_NANOS_OF_DAY: i64 = 86_399_999_999_999;

/// Collapse threshold when mapping sparse time storage.
pub const MAX_DENSITY_TIME: f64 = 0.5;

/// Nanoseconds-of-day column family, dense, sparse or mapped.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct TimeColumn {
    ctype: &'static ColumnType,
    size: usize,
    rep: TimeRep,
    #[derivative(Debug = "ignore")]
    stats: Arc<StatsCache>,
}

#[derive(Clone, Derivative)]
#[derivative(Debug)]
enum TimeRep {
    Dense(#[derivative(Debug = "ignore")] Arc<Vec<i64>>),
    Sparse(SparseTime),
    Mapped {
        #[derivative(Debug = "ignore")]
        data: Arc<Vec<i64>>,
        #[derivative(Debug = "ignore")]
        mapping: Arc<Vec<i32>>,
    },
}

#[derive(Clone, Derivative)]
#[derivative(Debug)]
struct SparseTime {
    default: i64,
    #[derivative(Debug = "ignore")]
    rows: Arc<Vec<u32>>,
    #[derivative(Debug = "ignore")]
    values: Arc<Vec<i64>>,
    bitmap: Arc<SparseBitmap>,
}

impl SparseTime {
    fn new(default: i64, rows: Vec<u32>, values: Vec<i64>, size: usize) -> Self {
        let bitmap = SparseBitmap::new(default == MISSING_VALUE, &rows, size);
        Self {
            default,
            rows: Arc::new(rows),
            values: Arc::new(values),
            bitmap: Arc::new(bitmap),
        }
    }
}

lazy_static! {
    static ref EMPTY_TIME: TimeColumn = TimeColumn {
        ctype: type_of(TypeId::TIME),
        size: 0,
        rep: TimeRep::Dense(Arc::new(Vec::new())),
        stats: Arc::new(StatsCache::new()),
    };
}

fn check_nanos(values: &[i64]) -> Result<()> {
    for (row, &v) in values.iter().enumerate() {
        if v != MISSING_VALUE && !(0..=MAX_NANOS_OF_DAY).contains(&v) {
            return Err(EngineError::Range(format!(
                "nanoseconds of day {} at row {}",
                v, row
            )));
        }
    }
    Ok(())
}

impl TimeColumn {
    /// Dense column over nanoseconds of day. Values outside
    /// `[0, 86_399_999_999_999]` other than the missing sentinel fail.
    pub fn dense(values: Vec<i64>) -> Result<Self> {
        check_nanos(&values)?;
        Ok(Self {
            ctype: type_of(TypeId::TIME),
            size: values.len(),
            rep: TimeRep::Dense(Arc::new(values)),
            stats: Arc::new(StatsCache::new()),
        })
    }

    /// Column over raw data, sparse when the seeded sample finds a default.
    pub fn from_data(values: Vec<i64>, seed: u64) -> Result<Self> {
        check_nanos(&values)?;
        let default = match sparsity::detect_default_i64(&values, seed) {
            Some(default) => default,
            None => {
                return Ok(Self {
                    ctype: type_of(TypeId::TIME),
                    size: values.len(),
                    rep: TimeRep::Dense(Arc::new(values)),
                    stats: Arc::new(StatsCache::new()),
                })
            }
        };
        let mut rows = Vec::new();
        let mut non_defaults = Vec::new();
        for (row, &v) in values.iter().enumerate() {
            if v != default {
                rows.push(row as u32);
                non_defaults.push(v);
            }
        }
        debug!(
            "sparse time column over {} rows, {} non-defaults",
            values.len(),
            rows.len()
        );
        Ok(Self {
            ctype: type_of(TypeId::TIME),
            size: values.len(),
            rep: TimeRep::Sparse(SparseTime::new(default, rows, non_defaults, values.len())),
            stats: Arc::new(StatsCache::new()),
        })
    }

    /// Sparse column from its parts; `rows` strictly ascending in
    /// `[0, size)`.
    pub fn sparse(default: i64, rows: Vec<u32>, values: Vec<i64>, size: usize) -> Result<Self> {
        check_nanos(&values)?;
        check_nanos(std::slice::from_ref(&default))?;
        if rows.len() != values.len()
            || rows.windows(2).any(|w| w[0] >= w[1])
            || rows.last().map_or(false, |&r| r as usize >= size)
        {
            return Err(EngineError::Range(
                "non-default rows must be strictly ascending within the column".into(),
            ));
        }
        Ok(Self {
            ctype: type_of(TypeId::TIME),
            size,
            rep: TimeRep::Sparse(SparseTime::new(default, rows, values, size)),
            stats: Arc::new(StatsCache::new()),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn column_type(&self) -> &'static ColumnType {
        self.ctype
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self.rep, TimeRep::Sparse(_))
    }

    pub fn is_view(&self) -> bool {
        matches!(self.rep, TimeRep::Mapped { .. })
    }

    pub(crate) fn stats_cache(&self) -> &Arc<StatsCache> {
        &self.stats
    }

    /// Nanoseconds of day at `row`, the missing sentinel outside bounds.
    pub fn value(&self, row: i64) -> i64 {
        if row < 0 || row >= self.size as i64 {
            return MISSING_VALUE;
        }
        match &self.rep {
            TimeRep::Dense(data) => data[row as usize],
            TimeRep::Sparse(sp) => match sp.bitmap.get(row) {
                DEFAULT_INDEX => sp.default,
                pos => sp.values[pos as usize],
            },
            TimeRep::Mapped { data, mapping } => {
                let m = mapping[row as usize];
                if m < 0 || m as usize >= data.len() {
                    MISSING_VALUE
                } else {
                    data[m as usize]
                }
            }
        }
    }

    pub fn fill(&self, dst: &mut [i64], row_offset: usize) {
        self.fill_strided(dst, row_offset, 0, 1);
    }

    pub fn fill_strided(
        &self,
        dst: &mut [i64],
        row_offset: usize,
        array_offset: usize,
        step: usize,
    ) {
        let count = fill_count(dst.len(), array_offset, step, self.size, row_offset);
        if count == 0 {
            return;
        }
        match &self.rep {
            TimeRep::Dense(data) => {
                if step == 1 {
                    dst[array_offset..array_offset + count]
                        .copy_from_slice(&data[row_offset..row_offset + count]);
                } else {
                    for k in 0..count {
                        dst[array_offset + k * step] = data[row_offset + k];
                    }
                }
            }
            TimeRep::Sparse(sp) => {
                for k in 0..count {
                    dst[array_offset + k * step] = sp.default;
                }
                let from = sp.rows.partition_point(|&r| (r as usize) < row_offset);
                for p in from..sp.rows.len() {
                    let row = sp.rows[p] as usize;
                    if row >= row_offset + count {
                        break;
                    }
                    dst[array_offset + (row - row_offset) * step] = sp.values[p];
                }
            }
            TimeRep::Mapped { data, mapping } => {
                for k in 0..count {
                    let m = mapping[row_offset + k];
                    dst[array_offset + k * step] = if m < 0 || m as usize >= data.len() {
                        MISSING_VALUE
                    } else {
                        data[m as usize]
                    };
                }
            }
        }
    }

    /// Numeric read of the nanoseconds, `NaN` for missing rows.
    pub fn fill_numeric(&self, dst: &mut [f64], row_offset: usize) {
        let count = fill_count(dst.len(), 0, 1, self.size, row_offset);
        for k in 0..count {
            let v = self.value((row_offset + k) as i64);
            dst[k] = if v == MISSING_VALUE { f64::NAN } else { v as f64 };
        }
    }

    pub fn map(&self, mapping: &Arc<Vec<i32>>, prefer_view: bool) -> TimeColumn {
        match self.map_impl(mapping, prefer_view, None) {
            Ok(column) => column,
            Err(_) => unreachable!("mapping without a shared cache cannot fail"),
        }
    }

    pub fn map_cached(
        &self,
        mapping: &Arc<Vec<i32>>,
        prefer_view: bool,
        cache: &MergeCache,
    ) -> Result<TimeColumn> {
        self.map_impl(mapping, prefer_view, Some(cache))
    }

    fn map_impl(
        &self,
        mapping: &Arc<Vec<i32>>,
        prefer_view: bool,
        cache: Option<&MergeCache>,
    ) -> Result<TimeColumn> {
        if mapping.is_empty() {
            return Ok(self.strip_data());
        }
        let view = prefer_view || mapping.len() as f64 > self.size as f64 * MAPPING_THRESHOLD;
        let rep = match &self.rep {
            TimeRep::Dense(data) => {
                if view {
                    TimeRep::Mapped {
                        data: data.clone(),
                        mapping: mapping.clone(),
                    }
                } else {
                    TimeRep::Dense(Arc::new(mapping::apply(data, mapping, MISSING_VALUE)))
                }
            }
            TimeRep::Mapped {
                data,
                mapping: inner,
            } => {
                let merged = match cache {
                    Some(cache) => cache.merged(mapping, inner)?,
                    None => Arc::new(mapping::merge(mapping, inner)),
                };
                if view {
                    TimeRep::Mapped {
                        data: data.clone(),
                        mapping: merged,
                    }
                } else {
                    TimeRep::Dense(Arc::new(mapping::apply(data, &merged, MISSING_VALUE)))
                }
            }
            TimeRep::Sparse(sp) => {
                let survivors = sp.bitmap.count_non_defaults(mapping);
                let density = survivors as f64 / mapping.len() as f64;
                if density > MAX_DENSITY_TIME {
                    debug!("sparse time map collapses to dense at density {:.3}", density);
                    TimeRep::Dense(Arc::new(
                        mapping.iter().map(|&m| self.value(m as i64)).collect(),
                    ))
                } else {
                    let mut rows = Vec::with_capacity(survivors);
                    let mut values = Vec::with_capacity(survivors);
                    for (row, &m) in mapping.iter().enumerate() {
                        let pos = sp.bitmap.get(m as i64);
                        if pos == DEFAULT_INDEX {
                            continue;
                        }
                        rows.push(row as u32);
                        values.push(if pos >= 0 {
                            sp.values[pos as usize]
                        } else {
                            MISSING_VALUE
                        });
                    }
                    TimeRep::Sparse(SparseTime::new(sp.default, rows, values, mapping.len()))
                }
            }
        };
        Ok(TimeColumn {
            ctype: self.ctype,
            size: mapping.len(),
            rep,
            stats: Arc::new(StatsCache::new()),
        })
    }

    /// Sorting permutation; the missing sentinel is the largest long, so
    /// missing rows come last ascending.
    pub fn sort(&self, order: Order) -> Vec<u32> {
        match &self.rep {
            TimeRep::Sparse(sp) => {
                let mut tagged: Vec<(i64, u32)> = sp
                    .values
                    .iter()
                    .copied()
                    .zip(sp.rows.iter().copied())
                    .collect();
                tagged.sort_unstable_by(|a, b| ordered(a.0, b.0, order));
                let before = tagged
                    .iter()
                    .take_while(|(v, _)| ordered(*v, sp.default, order) == std::cmp::Ordering::Less)
                    .count();
                let mut perm = Vec::with_capacity(self.size);
                perm.extend(tagged[..before].iter().map(|(_, row)| *row));
                let mut p = 0usize;
                for row in 0..self.size as u32 {
                    if p < sp.rows.len() && sp.rows[p] == row {
                        p += 1;
                        continue;
                    }
                    perm.push(row);
                }
                perm.extend(tagged[before..].iter().map(|(_, row)| *row));
                perm
            }
            _ => {
                let mut perm: Vec<u32> = (0..self.size as u32).collect();
                perm.sort_by(|&a, &b| ordered(self.value(a as i64), self.value(b as i64), order));
                perm
            }
        }
    }

    pub fn strip_data(&self) -> TimeColumn {
        EMPTY_TIME.clone()
    }
}

fn ordered(a: i64, b: i64, order: Order) -> std::cmp::Ordering {
    match order {
        Order::ASCENDING => a.cmp(&b),
        Order::DESCENDING => a.cmp(&b).reverse(),
    }
}

#[cfg(test)]
mod time_tests {

    use std::env::set_var;

    use super::*;
    use crate::util;

    fn setup() {
        set_var("RUST_LOG", "info");
        util::init();
    }

    fn read_all(col: &TimeColumn) -> Vec<i64> {
        let mut buf = vec![0i64; col.size()];
        col.fill(&mut buf, 0);
        buf
    }

    #[test]
    fn range_is_validated_at_construction() {
        setup();
        assert!(TimeColumn::dense(vec![0, MAX_NANOS_OF_DAY, MISSING_VALUE]).is_ok());
        assert!(matches!(
            TimeColumn::dense(vec![MAX_NANOS_OF_DAY + 1]),
            Err(EngineError::Range(_))
        ));
        assert!(matches!(
            TimeColumn::dense(vec![-1]),
            Err(EngineError::Range(_))
        ));
    }

    #[test]
    fn sparse_reads_match_dense() {
        setup();
        let col = TimeColumn::sparse(1_000, vec![1, 5], vec![2_000, 3_000], 7).unwrap();
        assert_eq!(
            read_all(&col),
            vec![1_000, 2_000, 1_000, 1_000, 1_000, 3_000, 1_000]
        );
    }

    #[test]
    fn numeric_read_uses_nan_for_missing() {
        setup();
        let col = TimeColumn::dense(vec![5, MISSING_VALUE]).unwrap();
        let mut buf = vec![0.0; 2];
        col.fill_numeric(&mut buf, 0);
        assert_eq!(buf[0], 5.0);
        assert!(buf[1].is_nan());
    }

    #[test]
    fn mapped_view_reads_through() {
        setup();
        let col = TimeColumn::dense(vec![10, 20, 30]).unwrap();
        let mapped = col.map(&Arc::new(vec![2, -1, 0]), true);
        assert!(mapped.is_view());
        assert_eq!(read_all(&mapped), vec![30, MISSING_VALUE, 10]);
    }

    #[test]
    fn sparse_map_collapse_over_density() {
        setup();
        let col = TimeColumn::sparse(0, vec![2], vec![77], 16).unwrap();
        // every mapped row is the non-default: density 1.0 > 0.5
        let collapsed = col.map(&Arc::new(vec![2, 2, 2, 2]), true);
        assert!(!collapsed.is_sparse());
        assert_eq!(read_all(&collapsed), vec![77; 4]);
    }

    #[test]
    fn from_data_detects_a_dominant_value() {
        setup();
        let values: Vec<i64> = (0..4096)
            .map(|i| if i % 5 == 0 { i as i64 } else { 3_600_000_000_000 })
            .collect();
        let col = TimeColumn::from_data(values.clone(), 21).unwrap();
        assert!(col.is_sparse());
        assert_eq!(read_all(&col), values);
    }

    #[test]
    fn sort_orders_missing_last() {
        setup();
        let col = TimeColumn::dense(vec![MISSING_VALUE, 300, 100, 200]).unwrap();
        let perm = col.sort(Order::ASCENDING);
        let sorted: Vec<i64> = perm.iter().map(|&r| col.value(r as i64)).collect();
        assert_eq!(sorted, vec![100, 200, 300, MISSING_VALUE]);
    }
}
