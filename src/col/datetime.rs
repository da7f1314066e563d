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

/// Missing seconds-since-epoch value.
pub const MISSING_VALUE: i64 = i64::MAX;

/// Last valid nanosecond of a second.
pub const MAX_NANOS: i32 = 999_999_999;

/// Collapse threshold when mapping sparse date-time storage. Lower than the
/// plain long columns because a materialized row carries two arrays.
pub const MAX_DENSITY_DATE_TIME: f64 = 0.375;

/// Seconds-since-epoch column family with optional sub-second precision.
///
/// Sparse storage encodes only the seconds; the nano array stays dense when
/// present. Without sub-second precision nano reads are zero.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct DateTimeColumn {
    ctype: &'static ColumnType,
    size: usize,
    rep: DateTimeRep,
    #[derivative(Debug = "ignore")]
    stats: Arc<StatsCache>,
}

#[derive(Clone, Derivative)]
#[derivative(Debug)]
enum DateTimeRep {
    Dense {
        #[derivative(Debug = "ignore")]
        seconds: Arc<Vec<i64>>,
        #[derivative(Debug = "ignore")]
        nanos: Option<Arc<Vec<i32>>>,
    },
    Sparse {
        default: i64,
        #[derivative(Debug = "ignore")]
        rows: Arc<Vec<u32>>,
        #[derivative(Debug = "ignore")]
        values: Arc<Vec<i64>>,
        #[derivative(Debug = "ignore")]
        nanos: Option<Arc<Vec<i32>>>,
        bitmap: Arc<SparseBitmap>,
    },
    Mapped {
        #[derivative(Debug = "ignore")]
        seconds: Arc<Vec<i64>>,
        #[derivative(Debug = "ignore")]
        nanos: Option<Arc<Vec<i32>>>,
        #[derivative(Debug = "ignore")]
        mapping: Arc<Vec<i32>>,
    },
}

lazy_static! {
    static ref EMPTY_DATE_TIME: DateTimeColumn = DateTimeColumn {
        ctype: type_of(TypeId::DATE_TIME),
        size: 0,
        rep: DateTimeRep::Dense {
            seconds: Arc::new(Vec::new()),
            nanos: None,
        },
        stats: Arc::new(StatsCache::new()),
    };
}

/// Nanos must be in range and zero on missing rows.
fn conform_nanos(seconds: &[i64], mut nanos: Vec<i32>) -> Result<Vec<i32>> {
    if nanos.len() != seconds.len() {
        return Err(EngineError::Range(format!(
            "{} nano entries against {} seconds",
            nanos.len(),
            seconds.len()
        )));
    }
    for (row, n) in nanos.iter_mut().enumerate() {
        if !(0..=MAX_NANOS).contains(n) {
            return Err(EngineError::Range(format!(
                "nanoseconds {} at row {}",
                n, row
            )));
        }
        if seconds[row] == MISSING_VALUE {
            *n = 0;
        }
    }
    Ok(nanos)
}

impl DateTimeColumn {
    /// Dense column; sub-second precision iff `nanos` is given.
    pub fn dense(seconds: Vec<i64>, nanos: Option<Vec<i32>>) -> Result<Self> {
        let nanos = match nanos {
            Some(nanos) => Some(Arc::new(conform_nanos(&seconds, nanos)?)),
            None => None,
        };
        Ok(Self {
            ctype: type_of(TypeId::DATE_TIME),
            size: seconds.len(),
            rep: DateTimeRep::Dense {
                seconds: Arc::new(seconds),
                nanos,
            },
            stats: Arc::new(StatsCache::new()),
        })
    }

    /// Column over raw data, sparse seconds when the seeded sample finds a
    /// default.
    pub fn from_data(seconds: Vec<i64>, nanos: Option<Vec<i32>>, seed: u64) -> Result<Self> {
        let default = match sparsity::detect_default_i64(&seconds, seed) {
            Some(default) => default,
            None => return Self::dense(seconds, nanos),
        };
        let nanos = match nanos {
            Some(nanos) => Some(Arc::new(conform_nanos(&seconds, nanos)?)),
            None => None,
        };
        let mut rows = Vec::new();
        let mut values = Vec::new();
        for (row, &v) in seconds.iter().enumerate() {
            if v != default {
                rows.push(row as u32);
                values.push(v);
            }
        }
        debug!(
            "sparse date-time column over {} rows, {} non-defaults",
            seconds.len(),
            rows.len()
        );
        let bitmap = SparseBitmap::new(default == MISSING_VALUE, &rows, seconds.len());
        Ok(Self {
            ctype: type_of(TypeId::DATE_TIME),
            size: seconds.len(),
            rep: DateTimeRep::Sparse {
                default,
                rows: Arc::new(rows),
                values: Arc::new(values),
                nanos,
                bitmap: Arc::new(bitmap),
            },
            stats: Arc::new(StatsCache::new()),
        })
    }

    /// Sparse column from its parts; the nano array, when given, is dense
    /// over all `size` rows.
    pub fn sparse(
        default: i64,
        rows: Vec<u32>,
        values: Vec<i64>,
        size: usize,
        nanos: Option<Vec<i32>>,
    ) -> Result<Self> {
        if rows.len() != values.len()
            || rows.windows(2).any(|w| w[0] >= w[1])
            || rows.last().map_or(false, |&r| r as usize >= size)
        {
            return Err(EngineError::Range(
                "non-default rows must be strictly ascending within the column".into(),
            ));
        }
        let nanos = match nanos {
            Some(nanos) => {
                if nanos.len() != size {
                    return Err(EngineError::Range(format!(
                        "{} nano entries against {} rows",
                        nanos.len(),
                        size
                    )));
                }
                for (row, &n) in nanos.iter().enumerate() {
                    if !(0..=MAX_NANOS).contains(&n) {
                        return Err(EngineError::Range(format!(
                            "nanoseconds {} at row {}",
                            n, row
                        )));
                    }
                }
                Some(Arc::new(nanos))
            }
            None => None,
        };
        let bitmap = SparseBitmap::new(default == MISSING_VALUE, &rows, size);
        Ok(Self {
            ctype: type_of(TypeId::DATE_TIME),
            size,
            rep: DateTimeRep::Sparse {
                default,
                rows: Arc::new(rows),
                values: Arc::new(values),
                nanos,
                bitmap: Arc::new(bitmap),
            },
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
        matches!(self.rep, DateTimeRep::Sparse { .. })
    }

    pub fn is_view(&self) -> bool {
        matches!(self.rep, DateTimeRep::Mapped { .. })
    }

    /// Whether the column carries sub-second precision.
    pub fn sub_second(&self) -> bool {
        match &self.rep {
            DateTimeRep::Dense { nanos, .. } => nanos.is_some(),
            DateTimeRep::Sparse { nanos, .. } => nanos.is_some(),
            DateTimeRep::Mapped { nanos, .. } => nanos.is_some(),
        }
    }

    pub(crate) fn stats_cache(&self) -> &Arc<StatsCache> {
        &self.stats
    }

    /// Seconds since epoch at `row`, the missing sentinel outside bounds.
    pub fn seconds_at(&self, row: i64) -> i64 {
        if row < 0 || row >= self.size as i64 {
            return MISSING_VALUE;
        }
        match &self.rep {
            DateTimeRep::Dense { seconds, .. } => seconds[row as usize],
            DateTimeRep::Sparse {
                default,
                values,
                bitmap,
                ..
            } => match bitmap.get(row) {
                DEFAULT_INDEX => *default,
                pos => values[pos as usize],
            },
            DateTimeRep::Mapped {
                seconds, mapping, ..
            } => {
                let m = mapping[row as usize];
                if m < 0 || m as usize >= seconds.len() {
                    MISSING_VALUE
                } else {
                    seconds[m as usize]
                }
            }
        }
    }

    /// Nanoseconds of second at `row`; zero without sub-second precision.
    pub fn nanos_at(&self, row: i64) -> i32 {
        if row < 0 || row >= self.size as i64 {
            return 0;
        }
        match &self.rep {
            DateTimeRep::Dense { nanos, .. } | DateTimeRep::Sparse { nanos, .. } => {
                nanos.as_ref().map_or(0, |n| n[row as usize])
            }
            DateTimeRep::Mapped { nanos, mapping, .. } => {
                let m = mapping[row as usize];
                match nanos {
                    Some(nanos) if m >= 0 && (m as usize) < nanos.len() => nanos[m as usize],
                    _ => 0,
                }
            }
        }
    }

    pub fn fill_seconds(&self, dst: &mut [i64], row_offset: usize) {
        self.fill_seconds_strided(dst, row_offset, 0, 1);
    }

    pub fn fill_seconds_strided(
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
            DateTimeRep::Dense { seconds, .. } if step == 1 => {
                dst[array_offset..array_offset + count]
                    .copy_from_slice(&seconds[row_offset..row_offset + count]);
            }
            DateTimeRep::Sparse {
                default,
                rows,
                values,
                ..
            } => {
                for k in 0..count {
                    dst[array_offset + k * step] = *default;
                }
                let from = rows.partition_point(|&r| (r as usize) < row_offset);
                for p in from..rows.len() {
                    let row = rows[p] as usize;
                    if row >= row_offset + count {
                        break;
                    }
                    dst[array_offset + (row - row_offset) * step] = values[p];
                }
            }
            _ => {
                for k in 0..count {
                    dst[array_offset + k * step] = self.seconds_at((row_offset + k) as i64);
                }
            }
        }
    }

    /// Writes the sub-second parts, zeros when the column has none.
    pub fn fill_nanos(&self, dst: &mut [i32], row_offset: usize) {
        let count = fill_count(dst.len(), 0, 1, self.size, row_offset);
        for k in 0..count {
            dst[k] = self.nanos_at((row_offset + k) as i64);
        }
    }

    pub fn map(&self, mapping: &Arc<Vec<i32>>, prefer_view: bool) -> DateTimeColumn {
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
    ) -> Result<DateTimeColumn> {
        self.map_impl(mapping, prefer_view, Some(cache))
    }

    fn map_impl(
        &self,
        mapping: &Arc<Vec<i32>>,
        prefer_view: bool,
        cache: Option<&MergeCache>,
    ) -> Result<DateTimeColumn> {
        if mapping.is_empty() {
            return Ok(self.strip_data());
        }
        let view = prefer_view || mapping.len() as f64 > self.size as f64 * MAPPING_THRESHOLD;
        let rep = match &self.rep {
            DateTimeRep::Dense { seconds, nanos } => {
                if view {
                    DateTimeRep::Mapped {
                        seconds: seconds.clone(),
                        nanos: nanos.clone(),
                        mapping: mapping.clone(),
                    }
                } else {
                    DateTimeRep::Dense {
                        seconds: Arc::new(mapping::apply(seconds, mapping, MISSING_VALUE)),
                        nanos: nanos
                            .as_ref()
                            .map(|n| Arc::new(mapping::apply(n, mapping, 0i32))),
                    }
                }
            }
            DateTimeRep::Mapped {
                seconds,
                nanos,
                mapping: inner,
            } => {
                let merged = match cache {
                    Some(cache) => cache.merged(mapping, inner)?,
                    None => Arc::new(mapping::merge(mapping, inner)),
                };
                if view {
                    DateTimeRep::Mapped {
                        seconds: seconds.clone(),
                        nanos: nanos.clone(),
                        mapping: merged,
                    }
                } else {
                    DateTimeRep::Dense {
                        seconds: Arc::new(mapping::apply(seconds, &merged, MISSING_VALUE)),
                        nanos: nanos
                            .as_ref()
                            .map(|n| Arc::new(mapping::apply(n, &merged, 0i32))),
                    }
                }
            }
            DateTimeRep::Sparse {
                default,
                values,
                nanos,
                bitmap,
                ..
            } => {
                let survivors = bitmap.count_non_defaults(mapping);
                let density = survivors as f64 / mapping.len() as f64;
                let mapped_nanos = nanos
                    .as_ref()
                    .map(|n| Arc::new(mapping::apply(n, mapping, 0i32)));
                if density > MAX_DENSITY_DATE_TIME {
                    debug!(
                        "sparse date-time map collapses to dense at density {:.3}",
                        density
                    );
                    DateTimeRep::Dense {
                        seconds: Arc::new(
                            mapping.iter().map(|&m| self.seconds_at(m as i64)).collect(),
                        ),
                        nanos: mapped_nanos,
                    }
                } else {
                    let mut rows = Vec::with_capacity(survivors);
                    let mut mapped_values = Vec::with_capacity(survivors);
                    for (row, &m) in mapping.iter().enumerate() {
                        let pos = bitmap.get(m as i64);
                        if pos == DEFAULT_INDEX {
                            continue;
                        }
                        rows.push(row as u32);
                        mapped_values.push(if pos >= 0 {
                            values[pos as usize]
                        } else {
                            MISSING_VALUE
                        });
                    }
                    let bitmap =
                        SparseBitmap::new(*default == MISSING_VALUE, &rows, mapping.len());
                    DateTimeRep::Sparse {
                        default: *default,
                        rows: Arc::new(rows),
                        values: Arc::new(mapped_values),
                        nanos: mapped_nanos,
                        bitmap: Arc::new(bitmap),
                    }
                }
            }
        };
        Ok(DateTimeColumn {
            ctype: self.ctype,
            size: mapping.len(),
            rep,
            stats: Arc::new(StatsCache::new()),
        })
    }

    /// Sorting permutation over `(seconds, nanos)`. The sparse high
    /// precision path sorts by seconds first, then re-sorts each window of
    /// equal seconds by the nano parts.
    pub fn sort(&self, order: Order) -> Vec<u32> {
        match &self.rep {
            DateTimeRep::Sparse {
                default,
                rows,
                values,
                ..
            } => {
                let mut perm = self.sort_sparse_seconds(*default, rows, values, order);
                if self.sub_second() {
                    self.resort_equal_seconds(&mut perm, order);
                }
                perm
            }
            _ => {
                let mut perm: Vec<u32> = (0..self.size as u32).collect();
                perm.sort_by(|&a, &b| {
                    let key_a = (self.seconds_at(a as i64), self.nanos_at(a as i64));
                    let key_b = (self.seconds_at(b as i64), self.nanos_at(b as i64));
                    ordered(key_a.cmp(&key_b), order)
                });
                perm
            }
        }
    }

    fn sort_sparse_seconds(
        &self,
        default: i64,
        rows: &[u32],
        values: &[i64],
        order: Order,
    ) -> Vec<u32> {
        let mut tagged: Vec<(i64, u32)> =
            values.iter().copied().zip(rows.iter().copied()).collect();
        tagged.sort_unstable_by(|a, b| ordered(a.0.cmp(&b.0), order));
        let before = tagged
            .iter()
            .take_while(|(v, _)| ordered(v.cmp(&default), order) == Ordering::Less)
            .count();
        let mut perm = Vec::with_capacity(self.size);
        perm.extend(tagged[..before].iter().map(|(_, row)| *row));
        let mut p = 0usize;
        for row in 0..self.size as u32 {
            if p < rows.len() && rows[p] == row {
                p += 1;
                continue;
            }
            perm.push(row);
        }
        perm.extend(tagged[before..].iter().map(|(_, row)| *row));
        perm
    }

    /// Partial re-sort of equal-seconds windows by the nano parts, using an
    /// auxiliary buffer per window.
    fn resort_equal_seconds(&self, perm: &mut [u32], order: Order) {
        let mut start = 0usize;
        while start < perm.len() {
            let seconds = self.seconds_at(perm[start] as i64);
            let mut end = start + 1;
            while end < perm.len() && self.seconds_at(perm[end] as i64) == seconds {
                end += 1;
            }
            if end - start > 1 {
                let mut window: Vec<u32> = perm[start..end].to_vec();
                window.sort_by(|&a, &b| {
                    ordered(self.nanos_at(a as i64).cmp(&self.nanos_at(b as i64)), order)
                });
                perm[start..end].copy_from_slice(&window);
            }
            start = end;
        }
    }

    pub fn strip_data(&self) -> DateTimeColumn {
        EMPTY_DATE_TIME.clone()
    }
}

fn ordered(cmp: Ordering, order: Order) -> Ordering {
    match order {
        Order::ASCENDING => cmp,
        Order::DESCENDING => cmp.reverse(),
    }
}

#[cfg(test)]
mod datetime_tests {

    use std::env::set_var;

    use super::*;
    use crate::util;

    fn setup() {
        set_var("RUST_LOG", "info");
        util::init();
    }

    fn read_seconds(col: &DateTimeColumn) -> Vec<i64> {
        let mut buf = vec![0i64; col.size()];
        col.fill_seconds(&mut buf, 0);
        buf
    }

    #[test]
    fn nanos_are_validated_and_zeroed_on_missing() {
        setup();
        assert!(matches!(
            DateTimeColumn::dense(vec![0], Some(vec![MAX_NANOS + 1])),
            Err(EngineError::Range(_))
        ));
        assert!(matches!(
            DateTimeColumn::dense(vec![0], Some(vec![-1])),
            Err(EngineError::Range(_))
        ));

        let col =
            DateTimeColumn::dense(vec![7, MISSING_VALUE], Some(vec![500, 900])).unwrap();
        assert_eq!(col.nanos_at(0), 500);
        assert_eq!(col.nanos_at(1), 0);
    }

    #[test]
    fn low_precision_nanos_read_zero() {
        setup();
        let col = DateTimeColumn::dense(vec![1, 2], None).unwrap();
        assert!(!col.sub_second());
        let mut buf = vec![9i32; 2];
        col.fill_nanos(&mut buf, 0);
        assert_eq!(buf, vec![0, 0]);
    }

    #[test]
    fn sparse_keeps_nanos_dense() {
        setup();
        let col = DateTimeColumn::sparse(
            100,
            vec![1, 3],
            vec![200, 300],
            5,
            Some(vec![0, 10, 20, 30, 40]),
        )
        .unwrap();
        assert!(col.is_sparse());
        assert!(col.sub_second());
        assert_eq!(read_seconds(&col), vec![100, 200, 100, 300, 100]);
        assert_eq!(col.nanos_at(2), 20);
        assert_eq!(col.nanos_at(3), 30);
    }

    #[test]
    fn mapped_view_reads_through_both_arrays() {
        setup();
        let col = DateTimeColumn::dense(vec![10, 20, 30], Some(vec![1, 2, 3])).unwrap();
        let mapped = col.map(&Arc::new(vec![2, -1, 0]), true);
        assert!(mapped.is_view());
        assert_eq!(read_seconds(&mapped), vec![30, MISSING_VALUE, 10]);
        assert_eq!(mapped.nanos_at(0), 3);
        assert_eq!(mapped.nanos_at(1), 0);
        assert_eq!(mapped.nanos_at(2), 1);
    }

    #[test]
    fn sparse_map_collapses_at_lower_density() {
        setup();
        let col = DateTimeColumn::sparse(0, vec![0, 1], vec![5, 6], 8, None).unwrap();
        // density 0.5 > 0.375 collapses
        let collapsed = col.map(&Arc::new(vec![0, 1, 2, 3]), true);
        assert!(!collapsed.is_sparse());
        assert_eq!(read_seconds(&collapsed), vec![5, 6, 0, 0]);

        // density 0.25 stays sparse
        let still_sparse = col.map(&Arc::new(vec![0, 2, 3, 4]), true);
        assert!(still_sparse.is_sparse());
        assert_eq!(read_seconds(&still_sparse), vec![5, 0, 0, 0]);
    }

    #[test]
    fn from_data_keeps_sparse_seconds_and_dense_nanos() {
        setup();
        let seconds: Vec<i64> = (0..2048)
            .map(|i| if i % 100 == 0 { i as i64 } else { 1_600_000_000 })
            .collect();
        let nanos: Vec<i32> = (0..2048).map(|i| (i % 1000) as i32).collect();
        let col = DateTimeColumn::from_data(seconds.clone(), Some(nanos.clone()), 17).unwrap();
        assert!(col.is_sparse());
        assert!(col.sub_second());
        assert_eq!(read_seconds(&col), seconds);
        for row in (0..2048).step_by(321) {
            assert_eq!(col.nanos_at(row as i64), nanos[row]);
        }
    }

    #[test]
    fn high_precision_sort_breaks_ties_by_nanos() {
        setup();
        let col = DateTimeColumn::dense(
            vec![5, 5, 1, 5, MISSING_VALUE],
            Some(vec![300, 100, 0, 200, 0]),
        )
        .unwrap();
        let perm = col.sort(Order::ASCENDING);
        let keys: Vec<(i64, i32)> = perm
            .iter()
            .map(|&r| (col.seconds_at(r as i64), col.nanos_at(r as i64)))
            .collect();
        assert_eq!(
            keys,
            vec![(1, 0), (5, 100), (5, 200), (5, 300), (MISSING_VALUE, 0)]
        );
    }

    #[test]
    fn sparse_high_precision_sort_two_phase() {
        setup();
        // seconds: [9, 2, 9, 2, 9], nanos: [4, 1, 3, 2, 5]
        let col = DateTimeColumn::sparse(
            9,
            vec![1, 3],
            vec![2, 2],
            5,
            Some(vec![4, 1, 3, 2, 5]),
        )
        .unwrap();
        let perm = col.sort(Order::ASCENDING);
        let keys: Vec<(i64, i32)> = perm
            .iter()
            .map(|&r| (col.seconds_at(r as i64), col.nanos_at(r as i64)))
            .collect();
        assert_eq!(keys, vec![(2, 1), (2, 2), (9, 3), (9, 4), (9, 5)]);
    }
}
