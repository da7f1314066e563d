pub mod bitmap;
pub mod categorical;
pub mod datetime;
pub mod dict;
pub mod mapping;
pub mod numeric;
pub mod object;
pub mod packed;
pub mod sparsity;
pub mod time;
pub mod types;

use std::sync::Arc;

use crate::col::categorical::CategoricalColumn;
use crate::col::datetime::DateTimeColumn;
use crate::col::mapping::MergeCache;
use crate::col::numeric::NumericColumn;
use crate::col::object::ObjectColumn;
use crate::col::time::TimeColumn;
use crate::col::types::{Category, ColumnType, NUMERIC_READABLE};
use crate::error::{EngineError, Result};
use crate::stats::cache::StatsCache;

/// Below this mapping/size ratio `map` deep-copies even when a view is
/// allowed.
pub const MAPPING_THRESHOLD: f64 = 0.1;

/// Sorting direction.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    ASCENDING,
    DESCENDING,
}

/// Number of values a fill writes: `min` of what the destination window and
/// the remaining rows admit.
pub(crate) fn fill_count(
    dst_len: usize,
    array_offset: usize,
    step: usize,
    size: usize,
    row_offset: usize,
) -> usize {
    debug_assert!(step >= 1);
    if row_offset >= size || array_offset >= dst_len {
        return 0;
    }
    (size - row_offset).min((dst_len - array_offset + step - 1) / step)
}

/// An immutable column, a union over the five category families. All
/// mutator-shaped operations return new columns.
#[derive(Debug, Clone)]
pub enum Column {
    Numeric(NumericColumn),
    Categorical(CategoricalColumn),
    Time(TimeColumn),
    DateTime(DateTimeColumn),
    Object(ObjectColumn),
}

impl Column {
    pub fn size(&self) -> usize {
        match self {
            Column::Numeric(col) => col.size(),
            Column::Categorical(col) => col.size(),
            Column::Time(col) => col.size(),
            Column::DateTime(col) => col.size(),
            Column::Object(col) => col.size(),
        }
    }

    pub fn column_type(&self) -> &ColumnType {
        match self {
            Column::Numeric(col) => col.column_type(),
            Column::Categorical(col) => col.column_type(),
            Column::Time(col) => col.column_type(),
            Column::DateTime(col) => col.column_type(),
            Column::Object(col) => col.column_type(),
        }
    }

    pub fn category(&self) -> Category {
        self.column_type().category()
    }

    /// Row selection; see the family `map` operations for the view rules.
    pub fn map(&self, mapping: &Arc<Vec<i32>>, prefer_view: bool) -> Column {
        match self {
            Column::Numeric(col) => Column::Numeric(col.map(mapping, prefer_view)),
            Column::Categorical(col) => Column::Categorical(col.map(mapping, prefer_view)),
            Column::Time(col) => Column::Time(col.map(mapping, prefer_view)),
            Column::DateTime(col) => Column::DateTime(col.map(mapping, prefer_view)),
            Column::Object(col) => Column::Object(col.map(mapping, prefer_view)),
        }
    }

    /// Row selection sharing merged mappings through `cache`.
    pub fn map_cached(
        &self,
        mapping: &Arc<Vec<i32>>,
        prefer_view: bool,
        cache: &MergeCache,
    ) -> Result<Column> {
        Ok(match self {
            Column::Numeric(col) => Column::Numeric(col.map_cached(mapping, prefer_view, cache)?),
            Column::Categorical(col) => {
                Column::Categorical(col.map_cached(mapping, prefer_view, cache)?)
            }
            Column::Time(col) => Column::Time(col.map_cached(mapping, prefer_view, cache)?),
            Column::DateTime(col) => {
                Column::DateTime(col.map_cached(mapping, prefer_view, cache)?)
            }
            Column::Object(col) => Column::Object(col.map_cached(mapping, prefer_view, cache)?),
        })
    }

    /// Sorting permutation; fails for object types without a comparator.
    pub fn sort(&self, order: Order) -> Result<Vec<u32>> {
        match self {
            Column::Numeric(col) => Ok(col.sort(order)),
            Column::Categorical(col) => Ok(col.sort(order)),
            Column::Time(col) => Ok(col.sort(order)),
            Column::DateTime(col) => Ok(col.sort(order)),
            Column::Object(col) => col.sort(order),
        }
    }

    /// The canonical empty column of the same type.
    pub fn strip_data(&self) -> Column {
        match self {
            Column::Numeric(col) => Column::Numeric(col.strip_data()),
            Column::Categorical(col) => Column::Categorical(col.strip_data()),
            Column::Time(col) => Column::Time(col.strip_data()),
            Column::DateTime(col) => Column::DateTime(col.strip_data()),
            Column::Object(col) => Column::Object(col.strip_data()),
        }
    }

    /// Numeric read for numeric-readable columns: doubles, nanoseconds of
    /// day, or category indices, with `NaN` for missing rows.
    pub fn fill_numeric(&self, dst: &mut [f64], row_offset: usize) -> Result<()> {
        if !self.column_type().has_capability(NUMERIC_READABLE) {
            return Err(EngineError::Unsupported(format!(
                "numeric read of {}",
                self.column_type().id()
            )));
        }
        match self {
            Column::Numeric(col) => col.fill(dst, row_offset),
            Column::Time(col) => col.fill_numeric(dst, row_offset),
            Column::Categorical(col) => col.fill_numeric(dst, row_offset),
            _ => unreachable!("numeric-readable categories are covered above"),
        }
        Ok(())
    }

    pub(crate) fn stats_cache(&self) -> &Arc<StatsCache> {
        match self {
            Column::Numeric(col) => col.stats_cache(),
            Column::Categorical(col) => col.stats_cache(),
            Column::Time(col) => col.stats_cache(),
            Column::DateTime(col) => col.stats_cache(),
            Column::Object(col) => col.stats_cache(),
        }
    }
}

impl From<NumericColumn> for Column {
    fn from(col: NumericColumn) -> Self {
        Column::Numeric(col)
    }
}

impl From<CategoricalColumn> for Column {
    fn from(col: CategoricalColumn) -> Self {
        Column::Categorical(col)
    }
}

impl From<TimeColumn> for Column {
    fn from(col: TimeColumn) -> Self {
        Column::Time(col)
    }
}

impl From<DateTimeColumn> for Column {
    fn from(col: DateTimeColumn) -> Self {
        Column::DateTime(col)
    }
}

impl From<ObjectColumn> for Column {
    fn from(col: ObjectColumn) -> Self {
        Column::Object(col)
    }
}
