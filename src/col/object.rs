use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use derivative::Derivative;

use crate::col::mapping::{self, MergeCache};
use crate::col::types::{type_of, Category, ColumnType, TypeId};
use crate::col::{fill_count, Order, MAPPING_THRESHOLD};
use crate::error::{EngineError, Result};
use crate::stats::cache::StatsCache;

/// Element of an object column. The built-in object types draw from this
/// closed set; custom types pick a payload kind and carry their identity in
/// the column type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectValue {
    Text(String),
    TextSet(BTreeSet<String>),
    TextList(Vec<String>),
    Instant { seconds: i64, nanos: i32 },
}

/// Column of arbitrary immutable objects, dense or mapped. `None` is the
/// missing value.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct ObjectColumn {
    ctype: Arc<ColumnType>,
    size: usize,
    rep: ObjectRep,
    #[derivative(Debug = "ignore")]
    stats: Arc<StatsCache>,
}

#[derive(Clone, Derivative)]
#[derivative(Debug)]
enum ObjectRep {
    Dense(#[derivative(Debug = "ignore")] Arc<Vec<Option<ObjectValue>>>),
    Mapped {
        #[derivative(Debug = "ignore")]
        data: Arc<Vec<Option<ObjectValue>>>,
        #[derivative(Debug = "ignore")]
        mapping: Arc<Vec<i32>>,
    },
}

impl ObjectColumn {
    /// Dense column over `values`; `ctype` must be an object type.
    pub fn dense(ctype: Arc<ColumnType>, values: Vec<Option<ObjectValue>>) -> Result<Self> {
        if ctype.category() != Category::OBJECT {
            return Err(EngineError::Unsupported(format!(
                "object column of category {}",
                ctype.category()
            )));
        }
        Ok(Self {
            ctype,
            size: values.len(),
            rep: ObjectRep::Dense(Arc::new(values)),
            stats: Arc::new(StatsCache::new()),
        })
    }

    /// TEXT column over plain strings.
    pub fn text(values: Vec<Option<String>>) -> Self {
        let values: Vec<Option<ObjectValue>> = values
            .into_iter()
            .map(|v| v.map(ObjectValue::Text))
            .collect();
        Self {
            ctype: Arc::new(type_of(TypeId::TEXT).clone()),
            size: values.len(),
            rep: ObjectRep::Dense(Arc::new(values)),
            stats: Arc::new(StatsCache::new()),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn column_type(&self) -> &ColumnType {
        &self.ctype
    }

    pub fn is_view(&self) -> bool {
        matches!(self.rep, ObjectRep::Mapped { .. })
    }

    pub(crate) fn stats_cache(&self) -> &Arc<StatsCache> {
        &self.stats
    }

    /// Value at `row`, `None` outside bounds and for missing rows.
    pub fn value(&self, row: i64) -> Option<&ObjectValue> {
        if row < 0 || row >= self.size as i64 {
            return None;
        }
        match &self.rep {
            ObjectRep::Dense(data) => data[row as usize].as_ref(),
            ObjectRep::Mapped { data, mapping } => {
                let m = mapping[row as usize];
                if m < 0 || m as usize >= data.len() {
                    None
                } else {
                    data[m as usize].as_ref()
                }
            }
        }
    }

    pub fn fill(&self, dst: &mut [Option<ObjectValue>], row_offset: usize) {
        self.fill_strided(dst, row_offset, 0, 1);
    }

    pub fn fill_strided(
        &self,
        dst: &mut [Option<ObjectValue>],
        row_offset: usize,
        array_offset: usize,
        step: usize,
    ) {
        let count = fill_count(dst.len(), array_offset, step, self.size, row_offset);
        for k in 0..count {
            dst[array_offset + k * step] = self.value((row_offset + k) as i64).cloned();
        }
    }

    pub fn map(&self, mapping: &Arc<Vec<i32>>, prefer_view: bool) -> ObjectColumn {
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
    ) -> Result<ObjectColumn> {
        self.map_impl(mapping, prefer_view, Some(cache))
    }

    fn map_impl(
        &self,
        mapping: &Arc<Vec<i32>>,
        prefer_view: bool,
        cache: Option<&MergeCache>,
    ) -> Result<ObjectColumn> {
        if mapping.is_empty() {
            return Ok(self.strip_data());
        }
        let view = prefer_view || mapping.len() as f64 > self.size as f64 * MAPPING_THRESHOLD;
        let rep = match &self.rep {
            ObjectRep::Dense(data) => {
                if view {
                    ObjectRep::Mapped {
                        data: data.clone(),
                        mapping: mapping.clone(),
                    }
                } else {
                    ObjectRep::Dense(Arc::new(mapping::apply_cloned(data, mapping)))
                }
            }
            ObjectRep::Mapped {
                data,
                mapping: inner,
            } => {
                let merged = match cache {
                    Some(cache) => cache.merged(mapping, inner)?,
                    None => Arc::new(mapping::merge(mapping, inner)),
                };
                if view {
                    ObjectRep::Mapped {
                        data: data.clone(),
                        mapping: merged,
                    }
                } else {
                    ObjectRep::Dense(Arc::new(mapping::apply_cloned(data, &merged)))
                }
            }
        };
        Ok(ObjectColumn {
            ctype: self.ctype.clone(),
            size: mapping.len(),
            rep,
            stats: Arc::new(StatsCache::new()),
        })
    }

    /// Sorting permutation through the column type's comparator; fails
    /// without one. Missing values come last ascending.
    pub fn sort(&self, order: Order) -> Result<Vec<u32>> {
        let comparator = self.ctype.comparator().ok_or_else(|| {
            EngineError::Unsupported(format!(
                "sort of {} without a comparator",
                self.ctype.id()
            ))
        })?;
        let mut perm: Vec<u32> = (0..self.size as u32).collect();
        perm.sort_by(|&a, &b| {
            let cmp = match (self.value(a as i64), self.value(b as i64)) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(va), Some(vb)) => comparator(va, vb),
            };
            match order {
                Order::ASCENDING => cmp,
                Order::DESCENDING => cmp.reverse(),
            }
        });
        Ok(perm)
    }

    /// The empty column of the same type. Custom types have no shared
    /// canonical instance, so this builds a fresh empty column.
    pub fn strip_data(&self) -> ObjectColumn {
        ObjectColumn {
            ctype: self.ctype.clone(),
            size: 0,
            rep: ObjectRep::Dense(Arc::new(Vec::new())),
            stats: Arc::new(StatsCache::new()),
        }
    }
}

#[cfg(test)]
mod object_tests {

    use std::env::set_var;

    use super::*;
    use crate::util;

    fn setup() {
        set_var("RUST_LOG", "info");
        util::init();
    }

    fn texts(values: &[Option<&str>]) -> ObjectColumn {
        ObjectColumn::text(values.iter().map(|v| v.map(str::to_string)).collect())
    }

    #[test]
    fn text_reads_and_missing() {
        setup();
        let col = texts(&[Some("b"), None, Some("a")]);
        assert_eq!(col.size(), 3);
        assert_eq!(col.value(0), Some(&ObjectValue::Text("b".into())));
        assert_eq!(col.value(1), None);
        assert_eq!(col.value(9), None);
    }

    #[test]
    fn sort_uses_the_type_comparator() {
        setup();
        let col = texts(&[Some("b"), None, Some("a"), Some("c")]);
        let perm = col.sort(Order::ASCENDING).unwrap();
        assert_eq!(perm, vec![2, 0, 3, 1]);

        // descending reverses the whole order, missing rows first
        let perm = col.sort(Order::DESCENDING).unwrap();
        let values: Vec<Option<&ObjectValue>> =
            perm.iter().map(|&r| col.value(r as i64)).collect();
        assert_eq!(values[0], None);
        assert_eq!(values[1], Some(&ObjectValue::Text("c".into())));
    }

    #[test]
    fn sort_without_comparator_is_unsupported() {
        setup();
        let ctype = Arc::new(type_of(TypeId::TEXT_SET).clone());
        let col = ObjectColumn::dense(
            ctype,
            vec![Some(ObjectValue::TextSet(
                ["a".to_string()].into_iter().collect(),
            ))],
        )
        .unwrap();
        assert!(matches!(
            col.sort(Order::ASCENDING),
            Err(EngineError::Unsupported(_))
        ));
    }

    #[test]
    fn mapped_sort_covers_the_logical_size() {
        setup();
        let col = texts(&[Some("z"), Some("a"), Some("m")]);
        // the view selects two rows; its sort must cover exactly those
        let view = col.map(&Arc::new(vec![0, 1]), true);
        let perm = view.sort(Order::ASCENDING).unwrap();
        assert_eq!(perm.len(), 2);
        assert_eq!(perm, vec![1, 0]);
    }

    #[test]
    fn non_object_type_is_rejected() {
        setup();
        let ctype = Arc::new(type_of(TypeId::REAL).clone());
        assert!(matches!(
            ObjectColumn::dense(ctype, vec![]),
            Err(EngineError::Unsupported(_))
        ));
    }

    #[test]
    fn map_copy_below_threshold() {
        setup();
        let values: Vec<Option<String>> = (0..100).map(|i| Some(format!("v{:03}", i))).collect();
        let col = ObjectColumn::text(values);
        let copied = col.map(&Arc::new(vec![42, 7]), false);
        assert!(!copied.is_view());
        assert_eq!(copied.value(0), Some(&ObjectValue::Text("v042".into())));
        assert_eq!(copied.value(1), Some(&ObjectValue::Text("v007".into())));
    }
}
