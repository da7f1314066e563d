use std::sync::Arc;

use bytes::BytesMut;

use colbase::col::categorical::CategoricalColumn;
use colbase::col::dict::{Dictionary, NO_ENTRY};
use colbase::col::mapping::{self, MergeCache};
use colbase::col::numeric::NumericColumn;
use colbase::col::time::{self, TimeColumn};
use colbase::col::types::TypeId;
use colbase::exec::{SequentialContext, SingleThreadedContext, ThreadPoolContext};
use colbase::io;
use colbase::stats::{self, Statistic};
use colbase::{Column, EngineError, Order};

fn real(values: Vec<f64>) -> Column {
    Column::Numeric(NumericColumn::dense(TypeId::REAL, values).unwrap())
}

fn read_numeric(col: &Column) -> Vec<f64> {
    let mut buf = vec![0.0; col.size()];
    col.fill_numeric(&mut buf, 0).unwrap();
    buf
}

#[test]
fn sparse_map_collapses_to_dense() {
    colbase::util::init();
    // length 8, default 0.0, non-defaults 1.0 at row 2 and 2.0 at row 4
    let col = NumericColumn::sparse(TypeId::REAL, 0.0, vec![2, 4], vec![1.0, 2.0], 8).unwrap();
    let mapped = col.map(&Arc::new(vec![2, 4, 2, 4, 2, 4]), true);
    assert_eq!(mapped.size(), 6);
    assert!(!mapped.is_sparse());
    let mut values = vec![0.0; 6];
    mapped.fill(&mut values, 0);
    assert_eq!(values, vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
}

#[test]
fn statistics_on_a_small_column() {
    colbase::util::init();
    let ctx = SequentialContext::new();
    let col = real(vec![1.0, 2.0, f64::NAN, 4.0]);
    let results = stats::compute_all(
        &ctx,
        &col,
        &[
            Statistic::COUNT,
            Statistic::MIN,
            Statistic::MAX,
            Statistic::MEAN,
            Statistic::P50,
        ],
    )
    .unwrap();
    assert_eq!(results[0].numeric, 3.0);
    assert_eq!(results[1].numeric, 1.0);
    assert_eq!(results[2].numeric, 4.0);
    assert_eq!(results[3].numeric, (1.0 + 2.0 + 4.0) / 3.0);
    assert_eq!(results[4].numeric, 2.0);
}

#[test]
fn boolean_dictionary_shape() {
    colbase::util::init();
    let d = Dictionary::boolean(vec![None, Some("yes".into()), Some("no".into())], 1).unwrap();
    assert!(d.has_positive().unwrap());
    assert!(d.has_negative().unwrap());
    assert_eq!(d.positive_index().unwrap(), 1);
    assert_eq!(d.negative_index().unwrap(), 2);
}

#[test]
fn concurrent_mapping_shares_one_merge() {
    colbase::util::init();
    let backing = NumericColumn::dense(TypeId::REAL, (0..64).map(f64::from).collect()).unwrap();
    // the shared inner mapping every thread composes against
    let view = backing.map(&Arc::new((0..64).rev().collect()), true);
    let outer: Arc<Vec<i32>> = Arc::new((0..32).map(|i| i * 2).collect());

    let cache = MergeCache::new();
    let results: Vec<Vec<f64>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let view = &view;
                let outer = &outer;
                let cache = &cache;
                scope.spawn(move || {
                    let mapped = view.map_cached(outer, true, cache).unwrap();
                    let mut buf = vec![0.0; mapped.size()];
                    mapped.fill(&mut buf, 0);
                    buf
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let expected: Vec<f64> = (0..32).map(|i| (63 - i * 2) as f64).collect();
    for result in results {
        assert_eq!(result, expected);
    }
}

#[test]
fn time_reader_validates_range() {
    colbase::util::init();
    let mut reader = io::read_time(1);
    let out_of_range = 86_400_000_000_000i64;
    assert!(matches!(
        reader.put(&out_of_range.to_le_bytes()),
        Err(EngineError::Range(_))
    ));
}

#[test]
fn dictionary_replacement_conflict() {
    colbase::util::init();
    let d = Dictionary::new(vec![None, Some("a".into()), Some("b".into())]).unwrap();
    assert!(matches!(
        d.replace("a", "b"),
        Err(EngineError::IllegalReplacement(_))
    ));
}

#[test]
fn identity_mapping_preserves_reads() {
    colbase::util::init();
    let columns = vec![
        real(vec![1.5, f64::NAN, 3.0, -7.25]),
        Column::Numeric(
            NumericColumn::sparse(TypeId::REAL, 0.5, vec![1], vec![9.0], 5).unwrap(),
        ),
        Column::Time(TimeColumn::dense(vec![5, time::MISSING_VALUE, 7]).unwrap()),
    ];
    for col in columns {
        let identity = Arc::new(mapping::identity(col.size()));
        let mapped = col.map(&identity, true);
        let a = read_numeric(&col);
        let b = read_numeric(&mapped);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.to_bits(), y.to_bits());
        }
    }
}

#[test]
fn view_composition_equals_merged_mapping() {
    colbase::util::init();
    let col = real((0..20).map(f64::from).collect());
    let m1: Arc<Vec<i32>> = Arc::new(vec![5, 3, -1, 19, 7, 2]);
    let m2: Arc<Vec<i32>> = Arc::new(vec![4, 0, 2, 9]);

    let chained = col.map(&m1, true).map(&m2, true);
    // compose(m1, m2)[i] = m1[m2[i]]
    let composed: Arc<Vec<i32>> = Arc::new(mapping::merge(&m2, &m1));
    let direct = col.map(&composed, true);

    let a = read_numeric(&chained);
    let b = read_numeric(&direct);
    for (x, y) in a.iter().zip(&b) {
        assert_eq!(x.to_bits(), y.to_bits());
    }
}

#[test]
fn dictionary_inverse_round_trips() {
    colbase::util::init();
    let d = Dictionary::new(vec![
        None,
        Some("a".into()),
        None,
        Some("c".into()),
        Some("d".into()),
    ])
    .unwrap();
    let inverse = d.create_inverse();
    for i in 1..=d.maximal_index() {
        match d.get(i) {
            None => {}
            Some(v) => assert_eq!(inverse[&Some(v.to_string())], i),
        }
    }
}

#[test]
fn repeated_statistics_are_bit_identical() {
    colbase::util::init();
    let ctx = SequentialContext::new();
    let col = real(vec![0.1, 0.2, 0.3, f64::NAN, 0.4, 1e-9]);
    for statistic in [Statistic::MEAN, Statistic::SD, Statistic::P25] {
        let first = stats::compute(&ctx, &col, statistic).unwrap();
        let second = stats::compute(&ctx, &col, statistic).unwrap();
        assert_eq!(first.numeric.to_bits(), second.numeric.to_bits());
    }
}

#[test]
fn sort_yields_a_permutation() {
    colbase::util::init();
    let columns = vec![
        real(vec![3.0, f64::NAN, 1.0, 2.0, f64::NAN]),
        Column::Numeric(
            NumericColumn::sparse(TypeId::REAL, 1.0, vec![0, 4], vec![5.0, -5.0], 7).unwrap(),
        ),
    ];
    for col in columns {
        for order in [Order::ASCENDING, Order::DESCENDING] {
            let perm = col.sort(order).unwrap();
            let mut seen = vec![false; col.size()];
            for &row in &perm {
                assert!(!seen[row as usize]);
                seen[row as usize] = true;
            }
            assert!(seen.into_iter().all(|s| s));
        }
    }
}

#[test]
fn io_round_trip_is_element_wise_equal() {
    colbase::util::init();
    let col = NumericColumn::dense(
        TypeId::REAL,
        vec![0.0, -0.0, f64::NAN, f64::INFINITY, 1.0e300, -2.5],
    )
    .unwrap();
    let mut buf = BytesMut::new();
    io::put_numeric_doubles(&col, 0, &mut buf);
    let mut reader = io::read_real(col.size());
    reader.put(&buf);
    let back = reader.finish().unwrap();
    for row in 0..col.size() {
        assert_eq!(
            col.value(row as i64).to_bits(),
            back.value(row as i64).to_bits()
        );
    }
}

#[test]
fn all_missing_sort_is_stable_ascending() {
    colbase::util::init();
    let col = real(vec![f64::NAN; 4]);
    assert_eq!(col.sort(Order::ASCENDING).unwrap(), vec![0, 1, 2, 3]);
}

#[test]
fn empty_mapping_strips_to_canonical_empty() {
    colbase::util::init();
    let col = Column::Numeric(
        NumericColumn::sparse(TypeId::REAL, 0.0, vec![1], vec![1.0], 4).unwrap(),
    );
    let empty = col.map(&Arc::new(Vec::new()), true);
    assert_eq!(empty.size(), 0);
    assert_eq!(empty.column_type(), col.column_type());
}

#[test]
fn parallel_statistics_match_sequential() {
    colbase::util::init();
    let values: Vec<f64> = (0..10_000)
        .map(|i| if i % 17 == 0 { f64::NAN } else { (i % 101) as f64 })
        .collect();
    let col = real(values);

    let sequential = SequentialContext::new();
    let pool = ThreadPoolContext::new(4).unwrap();
    for statistic in [
        Statistic::COUNT,
        Statistic::MIN,
        Statistic::MAX,
        Statistic::MEAN,
        Statistic::VAR,
        Statistic::SD,
        Statistic::P25,
        Statistic::MEDIAN,
    ] {
        // separate column values so each context computes from scratch
        let a = stats::compute(&sequential, &col, statistic).unwrap();
        let fresh = real({
            let mut buf = vec![0.0; col.size()];
            col.fill_numeric(&mut buf, 0).unwrap();
            buf
        });
        let b = stats::compute(&pool, &fresh, statistic).unwrap();
        assert!(
            (a.numeric - b.numeric).abs() < 1e-6,
            "{}: {} vs {}",
            statistic,
            a.numeric,
            b.numeric
        );
    }
}

#[test]
fn serialized_pool_context_computes_the_same() {
    colbase::util::init();
    let ctx = SingleThreadedContext::new(ThreadPoolContext::new(2).unwrap());
    let col = real((0..5_000).map(f64::from).collect());
    let mean = stats::compute(&ctx, &col, Statistic::MEAN).unwrap();
    assert!((mean.numeric - 4_999.0 / 2.0).abs() < 1e-9);
}

#[test]
fn enum_dispatch_shares_merges_too() {
    colbase::util::init();
    let dict = Arc::new(
        Dictionary::new(vec![None, Some("a".into()), Some("b".into())]).unwrap(),
    );
    let base = CategoricalColumn::dense_auto(dict, &[1, 2, 1, 2]).unwrap();
    let view = Column::Categorical(base.map(&Arc::new(vec![3, 2, 1, 0]), true));

    let cache = MergeCache::new();
    let outer = Arc::new(vec![0, 3]);
    let a = view.map_cached(&outer, true, &cache).unwrap();
    let b = view.map_cached(&outer, true, &cache).unwrap();
    for col in [&a, &b] {
        let mut buf = vec![0.0; 2];
        col.fill_numeric(&mut buf, 0).unwrap();
        assert_eq!(buf, vec![2.0, 1.0]);
    }
}

#[test]
fn cancelled_context_aborts_reductions() {
    colbase::util::init();
    let ctx = SequentialContext::new();
    ctx.deactivate();
    let col = real((0..10_000).map(f64::from).collect());
    assert!(matches!(
        stats::compute(&ctx, &col, Statistic::MEAN),
        Err(EngineError::ExecutionAborted(_))
    ));
}

#[test]
fn unsupported_statistics_are_rejected() {
    colbase::util::init();
    let ctx = SequentialContext::new();
    let time_col = Column::Time(TimeColumn::dense(vec![1, 2, 3]).unwrap());
    assert!(matches!(
        stats::compute(&ctx, &time_col, Statistic::VAR),
        Err(EngineError::Unsupported(_))
    ));
    assert!(stats::compute(&ctx, &time_col, Statistic::SD).is_ok());

    let dict = Arc::new(Dictionary::new(vec![None, Some("a".into())]).unwrap());
    let nominal =
        Column::Categorical(CategoricalColumn::dense_auto(dict, &[1, 0, 1]).unwrap());
    assert!(matches!(
        stats::compute(&ctx, &nominal, Statistic::MEAN),
        Err(EngineError::Unsupported(_))
    ));
}

#[test]
fn categorical_statistics_end_to_end() {
    colbase::util::init();
    let ctx = SequentialContext::new();
    let dict = Arc::new(
        Dictionary::new(vec![
            None,
            Some("red".into()),
            Some("green".into()),
            Some("blue".into()),
        ])
        .unwrap(),
    );
    let col = Column::Categorical(
        CategoricalColumn::dense_auto(dict, &[1, 2, 2, 0, 3, 2]).unwrap(),
    );
    let results = stats::compute_all(
        &ctx,
        &col,
        &[Statistic::COUNT, Statistic::MODE, Statistic::LEAST],
    )
    .unwrap();
    assert_eq!(results[0].numeric, 5.0);
    assert_eq!(results[1].categorical, 2);
    assert_eq!(results[1].numeric, 3.0);
    // red and blue tie at the bottom, the lowest index wins
    assert_eq!(results[2].categorical, 1);
    assert_eq!(results[2].numeric, 1.0);
}

#[test]
fn to_boolean_keeps_data_and_locates_positive() {
    colbase::util::init();
    let dict = Arc::new(
        Dictionary::new(vec![None, Some("yes".into()), Some("no".into())]).unwrap(),
    );
    let col = CategoricalColumn::dense_auto(dict, &[1, 2, 0, 1]).unwrap();
    let boolean = col.to_boolean(Some("no")).unwrap();
    assert!(boolean.dictionary().is_boolean());
    assert_eq!(boolean.dictionary().positive_index().unwrap(), 2);
    let mut indices = vec![0i32; 4];
    boolean.fill_indices(&mut indices, 0);
    assert_eq!(indices, vec![1, 2, 0, 1]);

    // with two values a positive must exist, so an absent one cannot form
    // a valid boolean dictionary
    assert!(matches!(
        col.to_boolean(Some("maybe")),
        Err(EngineError::InvalidDictionaryShape(_))
    ));

    let single = CategoricalColumn::dense_auto(
        Arc::new(Dictionary::new(vec![None, Some("odd".into())]).unwrap()),
        &[1, 0],
    )
    .unwrap();
    let boolean = single.to_boolean(Some("even")).unwrap();
    assert_eq!(boolean.dictionary().positive_index().unwrap(), NO_ENTRY);
}
