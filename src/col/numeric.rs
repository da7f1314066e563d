use std::cmp::Ordering;
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

/// Collapse threshold when mapping sparse double storage.
pub const MAX_DENSITY_DOUBLE_SPARSE: f64 = 0.5;

/// Double-precision column family, dense, sparse or mapped. `NaN` is the
/// missing value. Frozen after construction.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct NumericColumn {
    ctype: &'static ColumnType,
    size: usize,
    rep: NumericRep,
    #[derivative(Debug = "ignore")]
    stats: Arc<StatsCache>,
}

#[derive(Clone, Derivative)]
#[derivative(Debug)]
enum NumericRep {
    Dense(#[derivative(Debug = "ignore")] Arc<Vec<f64>>),
    Sparse(SparseNumeric),
    Mapped {
        #[derivative(Debug = "ignore")]
        data: Arc<Vec<f64>>,
        #[derivative(Debug = "ignore")]
        mapping: Arc<Vec<i32>>,
    },
}

#[derive(Clone, Derivative)]
#[derivative(Debug)]
struct SparseNumeric {
    default: f64,
    #[derivative(Debug = "ignore")]
    rows: Arc<Vec<u32>>,
    #[derivative(Debug = "ignore")]
    values: Arc<Vec<f64>>,
    bitmap: Arc<SparseBitmap>,
}

impl SparseNumeric {
    fn new(default: f64, rows: Vec<u32>, values: Vec<f64>, size: usize) -> Self {
        let bitmap = SparseBitmap::new(default.is_nan(), &rows, size);
        Self {
            default,
            rows: Arc::new(rows),
            values: Arc::new(values),
            bitmap: Arc::new(bitmap),
        }
    }
}

lazy_static! {
    static ref EMPTY_REAL: NumericColumn = NumericColumn {
        ctype: type_of(TypeId::REAL),
        size: 0,
        rep: NumericRep::Dense(Arc::new(Vec::new())),
        stats: Arc::new(StatsCache::new()),
    };
    static ref EMPTY_INTEGER_53_BIT: NumericColumn = NumericColumn {
        ctype: type_of(TypeId::INTEGER_53_BIT),
        size: 0,
        rep: NumericRep::Dense(Arc::new(Vec::new())),
        stats: Arc::new(StatsCache::new()),
    };
}

fn numeric_type(tid: TypeId) -> Result<&'static ColumnType> {
    match tid {
        TypeId::REAL | TypeId::INTEGER_53_BIT => Ok(type_of(tid)),
        other => Err(EngineError::Unsupported(format!(
            "numeric column of type {}",
            other
        ))),
    }
}

/// INTEGER_53_BIT stores whole doubles, rounded half away from zero.
fn conform(tid: TypeId, mut values: Vec<f64>) -> Vec<f64> {
    if tid == TypeId::INTEGER_53_BIT {
        for v in values.iter_mut() {
            if !v.is_nan() {
                *v = v.round();
            }
        }
    }
    values
}

impl NumericColumn {
    /// Dense column over `values`; `tid` must be `REAL` or `INTEGER_53_BIT`.
    pub fn dense(tid: TypeId, values: Vec<f64>) -> Result<Self> {
        let ctype = numeric_type(tid)?;
        let values = conform(tid, values);
        Ok(Self {
            ctype,
            size: values.len(),
            rep: NumericRep::Dense(Arc::new(values)),
            stats: Arc::new(StatsCache::new()),
        })
    }

    /// Column over raw data, choosing sparse storage when the seeded sample
    /// finds a default value above the sparsity threshold.
    pub fn from_data(tid: TypeId, values: Vec<f64>, seed: u64) -> Result<Self> {
        let ctype = numeric_type(tid)?;
        let values = conform(tid, values);
        let default = match sparsity::detect_default_f64(&values, seed) {
            Some(default) => default,
            None => {
                return Ok(Self {
                    ctype,
                    size: values.len(),
                    rep: NumericRep::Dense(Arc::new(values)),
                    stats: Arc::new(StatsCache::new()),
                })
            }
        };
        let mut rows = Vec::new();
        let mut non_defaults = Vec::new();
        for (row, &v) in values.iter().enumerate() {
            if v.total_cmp(&default) != Ordering::Equal {
                rows.push(row as u32);
                non_defaults.push(v);
            }
        }
        debug!(
            "sparse {} column over {} rows, default {}, {} non-defaults",
            tid,
            values.len(),
            default,
            rows.len()
        );
        Ok(Self {
            ctype,
            size: values.len(),
            rep: NumericRep::Sparse(SparseNumeric::new(
                default,
                rows,
                non_defaults,
                values.len(),
            )),
            stats: Arc::new(StatsCache::new()),
        })
    }

    /// Sparse column from its parts. `rows` must be strictly ascending and
    /// within `[0, size)`, one value per row.
    pub fn sparse(
        tid: TypeId,
        default: f64,
        rows: Vec<u32>,
        values: Vec<f64>,
        size: usize,
    ) -> Result<Self> {
        let ctype = numeric_type(tid)?;
        if rows.len() != values.len() {
            return Err(EngineError::Range(format!(
                "{} rows against {} values",
                rows.len(),
                values.len()
            )));
        }
        if rows.windows(2).any(|w| w[0] >= w[1]) || rows.last().map_or(false, |&r| r as usize >= size) {
            return Err(EngineError::Range(
                "non-default rows must be strictly ascending within the column".into(),
            ));
        }
        let values = conform(tid, values);
        let default = conform(tid, vec![default])[0];
        Ok(Self {
            ctype,
            size,
            rep: NumericRep::Sparse(SparseNumeric::new(default, rows, values, size)),
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
        matches!(self.rep, NumericRep::Sparse(_))
    }

    pub fn is_view(&self) -> bool {
        matches!(self.rep, NumericRep::Mapped { .. })
    }

    pub(crate) fn stats_cache(&self) -> &Arc<StatsCache> {
        &self.stats
    }

    /// Value at `row`, `NaN` outside `[0, size)`.
    pub fn value(&self, row: i64) -> f64 {
        if row < 0 || row >= self.size as i64 {
            return f64::NAN;
        }
        match &self.rep {
            NumericRep::Dense(data) => data[row as usize],
            NumericRep::Sparse(sp) => match sp.bitmap.get(row) {
                DEFAULT_INDEX => sp.default,
                pos => sp.values[pos as usize],
            },
            NumericRep::Mapped { data, mapping } => {
                let m = mapping[row as usize];
                if m < 0 || m as usize >= data.len() {
                    f64::NAN
                } else {
                    data[m as usize]
                }
            }
        }
    }

    pub fn fill(&self, dst: &mut [f64], row_offset: usize) {
        self.fill_strided(dst, row_offset, 0, 1);
    }

    /// Writes `min(dst.len() - array_offset, size - row_offset)` values into
    /// `dst`, strided by `step`.
    pub fn fill_strided(
        &self,
        dst: &mut [f64],
        row_offset: usize,
        array_offset: usize,
        step: usize,
    ) {
        let count = fill_count(dst.len(), array_offset, step, self.size, row_offset);
        if count == 0 {
            return;
        }
        match &self.rep {
            NumericRep::Dense(data) => {
                if step == 1 {
                    dst[array_offset..array_offset + count]
                        .copy_from_slice(&data[row_offset..row_offset + count]);
                } else {
                    for k in 0..count {
                        dst[array_offset + k * step] = data[row_offset + k];
                    }
                }
            }
            NumericRep::Sparse(sp) => {
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
            NumericRep::Mapped { data, mapping } => {
                for k in 0..count {
                    let m = mapping[row_offset + k];
                    dst[array_offset + k * step] = if m < 0 || m as usize >= data.len() {
                        f64::NAN
                    } else {
                        data[m as usize]
                    };
                }
            }
        }
    }

    /// Row selection. Lazy when a view is preferred or the mapping covers
    /// more than a tenth of the column, otherwise a deep copy. Sparse
    /// storage is rebuilt, collapsing to dense when the mapping destroys
    /// sparsity.
    pub fn map(&self, mapping: &Arc<Vec<i32>>, prefer_view: bool) -> NumericColumn {
        match self.map_impl(mapping, prefer_view, None) {
            Ok(column) => column,
            Err(_) => unreachable!("mapping without a shared cache cannot fail"),
        }
    }

    /// Like [`map`](Self::map), sharing merged mappings through `cache` with
    /// any sibling holding the same backing mapping.
    pub fn map_cached(
        &self,
        mapping: &Arc<Vec<i32>>,
        prefer_view: bool,
        cache: &MergeCache,
    ) -> Result<NumericColumn> {
        self.map_impl(mapping, prefer_view, Some(cache))
    }

    fn map_impl(
        &self,
        mapping: &Arc<Vec<i32>>,
        prefer_view: bool,
        cache: Option<&MergeCache>,
    ) -> Result<NumericColumn> {
        if mapping.is_empty() {
            return Ok(self.strip_data());
        }
        let view = prefer_view || mapping.len() as f64 > self.size as f64 * MAPPING_THRESHOLD;
        let rep = match &self.rep {
            NumericRep::Dense(data) => {
                if view {
                    NumericRep::Mapped {
                        data: data.clone(),
                        mapping: mapping.clone(),
                    }
                } else {
                    NumericRep::Dense(Arc::new(mapping::apply(data, mapping, f64::NAN)))
                }
            }
            NumericRep::Mapped {
                data,
                mapping: inner,
            } => {
                let merged = match cache {
                    Some(cache) => cache.merged(mapping, inner)?,
                    None => Arc::new(mapping::merge(mapping, inner)),
                };
                if view {
                    NumericRep::Mapped {
                        data: data.clone(),
                        mapping: merged,
                    }
                } else {
                    NumericRep::Dense(Arc::new(mapping::apply(data, &merged, f64::NAN)))
                }
            }
            NumericRep::Sparse(sp) => {
                let survivors = sp.bitmap.count_non_defaults(mapping);
                let density = survivors as f64 / mapping.len() as f64;
                if density > MAX_DENSITY_DOUBLE_SPARSE {
                    debug!("sparse map collapses to dense at density {:.3}", density);
                    NumericRep::Dense(Arc::new(
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
                            f64::NAN
                        });
                    }
                    NumericRep::Sparse(SparseNumeric::new(
                        sp.default,
                        rows,
                        values,
                        mapping.len(),
                    ))
                }
            }
        };
        Ok(NumericColumn {
            ctype: self.ctype,
            size: mapping.len(),
            rep,
            stats: Arc::new(StatsCache::new()),
        })
    }

    /// Sorting permutation over the row indices. Missing values order after
    /// every finite value, so they come last ascending.
    pub fn sort(&self, order: Order) -> Vec<u32> {
        match &self.rep {
            NumericRep::Sparse(sp) => self.sort_sparse(sp, order),
            _ => {
                let mut perm: Vec<u32> = (0..self.size as u32).collect();
                perm.sort_by(|&a, &b| ordered(self.value(a as i64), self.value(b as i64), order));
                perm
            }
        }
    }

    /// Sorts the non-default values, locates the default among them, and
    /// splices the default rows contiguously at that position.
    fn sort_sparse(&self, sp: &SparseNumeric, order: Order) -> Vec<u32> {
        let mut tagged: Vec<(f64, u32)> = sp
            .values
            .iter()
            .copied()
            .zip(sp.rows.iter().copied())
            .collect();
        tagged.sort_unstable_by(|a, b| ordered(a.0, b.0, order));
        let before = tagged
            .iter()
            .take_while(|(v, _)| ordered(*v, sp.default, order) == Ordering::Less)
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

    /// The canonical shared empty column of the same type.
    pub fn strip_data(&self) -> NumericColumn {
        match self.ctype.id() {
            TypeId::REAL => EMPTY_REAL.clone(),
            _ => EMPTY_INTEGER_53_BIT.clone(),
        }
    }
}

fn cmp_missing_greatest(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

fn ordered(a: f64, b: f64, order: Order) -> Ordering {
    let cmp = cmp_missing_greatest(a, b);
    match order {
        Order::ASCENDING => cmp,
        Order::DESCENDING => cmp.reverse(),
    }
}
