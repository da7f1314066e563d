use std::cmp::Ordering;
use std::sync::Arc;

use derivative::Derivative;
use lazy_static::lazy_static;
use log::debug;

use crate::col::bitmap::{SparseBitmap, DEFAULT_INDEX};
use crate::col::dict::{Dictionary, MISSING_INDEX};
use crate::col::mapping::{self, MergeCache};
use crate::col::packed::{IndexData, IndexFormat};
use crate::col::types::{type_of, ColumnType, TypeId};
use crate::col::{fill_count, Order, MAPPING_THRESHOLD};
use crate::error::{EngineError, Result};
use crate::stats::cache::StatsCache;

/// Collapse thresholds when mapping sparse categorical storage, per width.
pub const MAX_DENSITY_UINT8: f64 = 0.2;
pub const MAX_DENSITY_UINT16: f64 = 0.33;
pub const MAX_DENSITY_INT32: f64 = 0.5;

/// Dictionary-encoded column family over packed index storage.
///
/// Row selections stack as one lazy mapping layer, value transformations as
/// one lazy remap layer; composing either with itself merges the tables so
/// the representation depth never exceeds a base plus one of each.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct CategoricalColumn {
    ctype: &'static ColumnType,
    size: usize,
    dict: Arc<Dictionary>,
    rep: CategoricalRep,
    #[derivative(Debug = "ignore")]
    stats: Arc<StatsCache>,
}

#[derive(Clone, Derivative)]
#[derivative(Debug)]
enum CategoricalRep {
    Dense(Arc<IndexData>),
    Sparse(SparseIndices),
    Mapped {
        data: Arc<IndexData>,
        #[derivative(Debug = "ignore")]
        mapping: Arc<Vec<i32>>,
    },
    Remapped {
        data: Arc<IndexData>,
        #[derivative(Debug = "ignore")]
        remap: Arc<Vec<i32>>,
    },
    RemappedMapped {
        data: Arc<IndexData>,
        #[derivative(Debug = "ignore")]
        remap: Arc<Vec<i32>>,
        #[derivative(Debug = "ignore")]
        mapping: Arc<Vec<i32>>,
    },
}

#[derive(Clone, Derivative)]
#[derivative(Debug)]
struct SparseIndices {
    default: i32,
    #[derivative(Debug = "ignore")]
    rows: Arc<Vec<u32>>,
    #[derivative(Debug = "ignore")]
    values: Arc<Vec<i32>>,
    format: IndexFormat,
    bitmap: Arc<SparseBitmap>,
}

impl SparseIndices {
    fn new(default: i32, rows: Vec<u32>, values: Vec<i32>, size: usize, format: IndexFormat) -> Self {
        let bitmap = SparseBitmap::new(default == MISSING_INDEX, &rows, size);
        Self {
            default,
            rows: Arc::new(rows),
            values: Arc::new(values),
            format,
            bitmap: Arc::new(bitmap),
        }
    }
}

lazy_static! {
    static ref EMPTY_NOMINAL: CategoricalColumn = CategoricalColumn {
        ctype: type_of(TypeId::NOMINAL),
        size: 0,
        dict: Arc::new(Dictionary::default()),
        rep: CategoricalRep::Dense(Arc::new(IndexData::empty(IndexFormat::U2))),
        stats: Arc::new(StatsCache::new()),
    };
}

fn max_density(format: IndexFormat) -> f64 {
    match format {
        IndexFormat::U8 => MAX_DENSITY_UINT8,
        IndexFormat::U16 => MAX_DENSITY_UINT16,
        _ => MAX_DENSITY_INT32,
    }
}

fn check_indices(indices: &[i32], dict: &Dictionary) -> Result<()> {
    for (row, &idx) in indices.iter().enumerate() {
        if idx < 0 || idx > dict.maximal_index() {
            return Err(EngineError::Range(format!(
                "category index {} at row {} beyond maximal index {}",
                idx,
                row,
                dict.maximal_index()
            )));
        }
    }
    Ok(())
}

impl CategoricalColumn {
    /// Dense column at an explicit width; indices must fit the dictionary
    /// and the format.
    pub fn dense(
        dict: Arc<Dictionary>,
        indices: &[i32],
        format: IndexFormat,
    ) -> Result<Self> {
        check_indices(indices, &dict)?;
        let data = IndexData::from_indices(indices, format)?;
        Ok(Self {
            ctype: type_of(TypeId::NOMINAL),
            size: indices.len(),
            dict,
            rep: CategoricalRep::Dense(Arc::new(data)),
            stats: Arc::new(StatsCache::new()),
        })
    }

    /// Dense column at the smallest width fitting the dictionary.
    pub fn dense_auto(dict: Arc<Dictionary>, indices: &[i32]) -> Result<Self> {
        let format = IndexFormat::fitting(dict.maximal_index());
        Self::dense(dict, indices, format)
    }

    /// Sparse column from its parts. The 2-bit and 4-bit widths have no
    /// sparse storage.
    pub fn sparse(
        dict: Arc<Dictionary>,
        default: i32,
        rows: Vec<u32>,
        values: Vec<i32>,
        size: usize,
        format: IndexFormat,
    ) -> Result<Self> {
        if !format.supports_sparse() {
            return Err(EngineError::Unsupported(format!(
                "sparse categorical storage at format {}",
                format
            )));
        }
        check_indices(&values, &dict)?;
        check_indices(std::slice::from_ref(&default), &dict)?;
        if values.iter().any(|&v| v > format.max_index()) || default > format.max_index() {
            return Err(EngineError::Range(format!(
                "category index beyond format {}",
                format
            )));
        }
        if rows.len() != values.len()
            || rows.windows(2).any(|w| w[0] >= w[1])
            || rows.last().map_or(false, |&r| r as usize >= size)
        {
            return Err(EngineError::Range(
                "non-default rows must be strictly ascending within the column".into(),
            ));
        }
        Ok(Self {
            ctype: type_of(TypeId::NOMINAL),
            size,
            dict,
            rep: CategoricalRep::Sparse(SparseIndices::new(default, rows, values, size, format)),
            stats: Arc::new(StatsCache::new()),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn column_type(&self) -> &'static ColumnType {
        self.ctype
    }

    pub fn dictionary(&self) -> &Arc<Dictionary> {
        &self.dict
    }

    pub fn format(&self) -> IndexFormat {
        match &self.rep {
            CategoricalRep::Dense(data)
            | CategoricalRep::Mapped { data, .. }
            | CategoricalRep::Remapped { data, .. }
            | CategoricalRep::RemappedMapped { data, .. } => data.format(),
            CategoricalRep::Sparse(sp) => sp.format,
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self.rep, CategoricalRep::Sparse(_))
    }

    pub fn is_view(&self) -> bool {
        matches!(
            self.rep,
            CategoricalRep::Mapped { .. }
                | CategoricalRep::Remapped { .. }
                | CategoricalRep::RemappedMapped { .. }
        )
    }

    pub(crate) fn stats_cache(&self) -> &Arc<StatsCache> {
        &self.stats
    }

    /// Category index at `row`, the missing index outside bounds.
    pub fn index_at(&self, row: i64) -> i32 {
        if row < 0 || row >= self.size as i64 {
            return MISSING_INDEX;
        }
        match &self.rep {
            CategoricalRep::Dense(data) => data.get(row as usize),
            CategoricalRep::Sparse(sp) => match sp.bitmap.get(row) {
                DEFAULT_INDEX => sp.default,
                pos if pos >= 0 => sp.values[pos as usize],
                _ => MISSING_INDEX,
            },
            CategoricalRep::Mapped { data, mapping } => {
                let m = mapping[row as usize];
                if m < 0 || m as usize >= data.len() {
                    MISSING_INDEX
                } else {
                    data.get(m as usize)
                }
            }
            CategoricalRep::Remapped { data, remap } => {
                remap_index(remap, data.get(row as usize))
            }
            CategoricalRep::RemappedMapped {
                data,
                remap,
                mapping,
            } => {
                let m = mapping[row as usize];
                if m < 0 || m as usize >= data.len() {
                    MISSING_INDEX
                } else {
                    remap_index(remap, data.get(m as usize))
                }
            }
        }
    }

    pub fn fill_indices(&self, dst: &mut [i32], row_offset: usize) {
        self.fill_indices_strided(dst, row_offset, 0, 1);
    }

    pub fn fill_indices_strided(
        &self,
        dst: &mut [i32],
        row_offset: usize,
        array_offset: usize,
        step: usize,
    ) {
        let count = fill_count(dst.len(), array_offset, step, self.size, row_offset);
        if count == 0 {
            return;
        }
        if let CategoricalRep::Sparse(sp) = &self.rep {
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
        } else {
            for k in 0..count {
                dst[array_offset + k * step] = self.index_at((row_offset + k) as i64);
            }
        }
    }

    /// Numeric read of the category indices; the missing index reads `NaN`.
    pub fn fill_numeric(&self, dst: &mut [f64], row_offset: usize) {
        let count = fill_count(dst.len(), 0, 1, self.size, row_offset);
        for k in 0..count {
            let idx = self.index_at((row_offset + k) as i64);
            dst[k] = if idx == MISSING_INDEX {
                f64::NAN
            } else {
                idx as f64
            };
        }
    }

    /// Object read of the dictionary values.
    pub fn fill_values(&self, dst: &mut [Option<String>], row_offset: usize) {
        let count = fill_count(dst.len(), 0, 1, self.size, row_offset);
        for k in 0..count {
            dst[k] = self
                .dict
                .get(self.index_at((row_offset + k) as i64))
                .map(str::to_string);
        }
    }

    pub fn map(&self, mapping: &Arc<Vec<i32>>, prefer_view: bool) -> CategoricalColumn {
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
    ) -> Result<CategoricalColumn> {
        self.map_impl(mapping, prefer_view, Some(cache))
    }

    fn map_impl(
        &self,
        mapping: &Arc<Vec<i32>>,
        prefer_view: bool,
        cache: Option<&MergeCache>,
    ) -> Result<CategoricalColumn> {
        if mapping.is_empty() {
            return Ok(self.strip_data());
        }
        let view = prefer_view || mapping.len() as f64 > self.size as f64 * MAPPING_THRESHOLD;
        let rep = match &self.rep {
            CategoricalRep::Dense(data) => {
                if view {
                    CategoricalRep::Mapped {
                        data: data.clone(),
                        mapping: mapping.clone(),
                    }
                } else {
                    self.materialize(mapping)?
                }
            }
            CategoricalRep::Mapped {
                data,
                mapping: inner,
            } => {
                if view {
                    let merged = match cache {
                        Some(cache) => cache.merged(mapping, inner)?,
                        None => Arc::new(mapping::merge(mapping, inner)),
                    };
                    CategoricalRep::Mapped {
                        data: data.clone(),
                        mapping: merged,
                    }
                } else {
                    self.materialize(mapping)?
                }
            }
            CategoricalRep::Remapped { data, remap } => {
                if view {
                    CategoricalRep::RemappedMapped {
                        data: data.clone(),
                        remap: remap.clone(),
                        mapping: mapping.clone(),
                    }
                } else {
                    self.materialize(mapping)?
                }
            }
            CategoricalRep::RemappedMapped {
                data,
                remap,
                mapping: inner,
            } => {
                if view {
                    let merged = match cache {
                        Some(cache) => cache.merged(mapping, inner)?,
                        None => Arc::new(mapping::merge(mapping, inner)),
                    };
                    CategoricalRep::RemappedMapped {
                        data: data.clone(),
                        remap: remap.clone(),
                        mapping: merged,
                    }
                } else {
                    self.materialize(mapping)?
                }
            }
            CategoricalRep::Sparse(sp) => {
                let survivors = sp.bitmap.count_non_defaults(mapping);
                let density = survivors as f64 / mapping.len() as f64;
                if density > max_density(sp.format) {
                    debug!(
                        "sparse categorical map collapses to dense at density {:.3} ({})",
                        density, sp.format
                    );
                    self.materialize(mapping)?
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
                            MISSING_INDEX
                        });
                    }
                    CategoricalRep::Sparse(SparseIndices::new(
                        sp.default,
                        rows,
                        values,
                        mapping.len(),
                        sp.format,
                    ))
                }
            }
        };
        Ok(CategoricalColumn {
            ctype: self.ctype,
            size: mapping.len(),
            dict: self.dict.clone(),
            rep,
            stats: Arc::new(StatsCache::new()),
        })
    }

    /// Deep copy through `mapping`, folding any remap layer into the stored
    /// indices, at the smallest width fitting the dictionary.
    fn materialize(&self, mapping: &[i32]) -> Result<CategoricalRep> {
        let gathered: Vec<i32> = mapping.iter().map(|&m| self.index_at(m as i64)).collect();
        let format = IndexFormat::fitting(self.dict.maximal_index());
        Ok(CategoricalRep::Dense(Arc::new(IndexData::from_indices(
            &gathered, format,
        )?)))
    }

    /// Lazy value transformation aligning the data with `new_dict`:
    /// `table[old_index]` is the new index. Applying a second remap composes
    /// the tables instead of chaining layers.
    pub fn remap(&self, new_dict: &Arc<Dictionary>, table: &[i32]) -> Result<CategoricalColumn> {
        if (table.len() as i32) < self.dict.maximal_index() + 1 {
            return Err(EngineError::Range(format!(
                "remap table of length {} against maximal index {}",
                table.len(),
                self.dict.maximal_index()
            )));
        }
        check_indices(table, new_dict)?;
        let rep = match &self.rep {
            CategoricalRep::Dense(data) => CategoricalRep::Remapped {
                data: data.clone(),
                remap: Arc::new(table.to_vec()),
            },
            CategoricalRep::Mapped { data, mapping } => CategoricalRep::RemappedMapped {
                data: data.clone(),
                remap: Arc::new(table.to_vec()),
                mapping: mapping.clone(),
            },
            CategoricalRep::Remapped { data, remap } => CategoricalRep::Remapped {
                data: data.clone(),
                remap: Arc::new(mapping::merge(remap, table)),
            },
            CategoricalRep::RemappedMapped {
                data,
                remap,
                mapping,
            } => CategoricalRep::RemappedMapped {
                data: data.clone(),
                remap: Arc::new(mapping::merge(remap, table)),
                mapping: mapping.clone(),
            },
            CategoricalRep::Sparse(sp) => {
                // sparse indices are rewritten in place of a lazy layer
                let default = remap_index(table, sp.default);
                let values: Vec<i32> =
                    sp.values.iter().map(|&v| remap_index(table, v)).collect();
                let format = IndexFormat::fitting(new_dict.maximal_index());
                let format = if format.supports_sparse() {
                    format
                } else {
                    IndexFormat::U8
                };
                CategoricalRep::Sparse(SparseIndices::new(
                    default,
                    sp.rows.as_ref().clone(),
                    values,
                    self.size,
                    format,
                ))
            }
        };
        Ok(CategoricalColumn {
            ctype: self.ctype,
            size: self.size,
            dict: new_dict.clone(),
            rep,
            stats: Arc::new(StatsCache::new()),
        })
    }

    /// Replaces the dictionary identity without touching the data. The new
    /// dictionary must cover the old maximal index.
    pub fn swap_dictionary(&self, new_dict: &Arc<Dictionary>) -> Result<CategoricalColumn> {
        if new_dict.maximal_index() < self.dict.maximal_index() {
            return Err(EngineError::InvalidDictionaryShape(format!(
                "replacement maximal index {} below {}",
                new_dict.maximal_index(),
                self.dict.maximal_index()
            )));
        }
        Ok(CategoricalColumn {
            ctype: self.ctype,
            size: self.size,
            dict: new_dict.clone(),
            rep: self.rep.clone(),
            stats: Arc::new(StatsCache::new()),
        })
    }

    /// New column whose dictionary starts with `other`, appending any of
    /// this column's values absent from it, the data remapped accordingly.
    /// The result stays boolean when `other` is boolean, still has at most
    /// two values and keeps `other`'s positive index valid.
    pub fn merge_dictionaries(&self, other: &Arc<Dictionary>) -> Result<CategoricalColumn> {
        let inverse = other.create_inverse();
        let mut values = other.values().to_vec();
        let mut table = vec![MISSING_INDEX; (self.dict.maximal_index() + 1) as usize];
        for (i, v) in self.dict.iter() {
            match inverse.get(&Some(v.to_string())) {
                Some(&j) => table[i as usize] = j,
                None => {
                    values.push(Some(v.to_string()));
                    table[i as usize] = values.len() as i32 - 1;
                }
            }
        }
        debug!(
            "merged dictionary of {} entries from {} and {}",
            values.len(),
            other.size(),
            self.dict.size()
        );
        let merged = if other.is_boolean() && values.len() <= 3 {
            Dictionary::boolean(values.clone(), other.positive_index()?)
                .or_else(|_| Dictionary::new(values))?
        } else {
            Dictionary::new(values)?
        };
        self.remap(&Arc::new(merged), &table)
    }

    /// Column over the boolean view of the dictionary with `positive`
    /// located, `NO_ENTRY` when absent.
    pub fn to_boolean(&self, positive: Option<&str>) -> Result<CategoricalColumn> {
        let boolean = self.dict.to_boolean(positive)?;
        self.swap_dictionary(&Arc::new(boolean))
    }

    /// Sorting permutation by dictionary value, missing last ascending.
    pub fn sort(&self, order: Order) -> Vec<u32> {
        let keys: Vec<Option<&str>> = (0..self.size)
            .map(|row| self.dict.get(self.index_at(row as i64)))
            .collect();
        let mut perm: Vec<u32> = (0..self.size as u32).collect();
        perm.sort_by(|&a, &b| {
            let cmp = match (keys[a as usize], keys[b as usize]) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(va), Some(vb)) => va.cmp(vb),
            };
            match order {
                Order::ASCENDING => cmp,
                Order::DESCENDING => cmp.reverse(),
            }
        });
        perm
    }

    pub fn strip_data(&self) -> CategoricalColumn {
        EMPTY_NOMINAL.clone()
    }
}

fn remap_index(remap: &[i32], index: i32) -> i32 {
    if index < 0 || index as usize >= remap.len() {
        MISSING_INDEX
    } else {
        remap[index as usize]
    }
}
