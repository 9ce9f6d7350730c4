//! Property tests: every chunk encoding behaves like a plain vector of
//! cells.

use proptest::prelude::*;
use tilegrid_core::{
    CellValue, Chunk, ChunkFactory, ChunkId, ChunkKind, ChunkRecord, ExactSum,
};

const ROWS: usize = 6;
const COLS: usize = 5;
const NO_DATA: i32 = -1;
const ID: ChunkId = ChunkId::new(2, 7);

fn writable_factory() -> impl Strategy<Value = ChunkFactory> {
    prop_oneof![
        Just(ChunkFactory::fixed(ChunkKind::Array)),
        (1usize..6).prop_map(|threshold| {
            ChunkFactory::fixed(ChunkKind::Map).with_promotion_threshold(threshold)
        }),
    ]
}

fn writes() -> impl Strategy<Value = Vec<(usize, usize, i32)>> {
    prop::collection::vec((0..ROWS, 0..COLS, -1i32..4), 0..80)
}

fn sorted(mut values: Vec<i32>) -> Vec<i32> {
    values.sort_unstable();
    values
}

proptest! {
    #[test]
    fn prop_writes_match_plain_vector(
        factory in writable_factory(),
        fill in -1i32..4,
        writes in writes(),
    ) {
        let mut chunk = factory.create(ID, ROWS, COLS, NO_DATA, fill).unwrap();
        let mut model = vec![fill; ROWS * COLS];
        for (row, col, value) in writes {
            let previous = chunk.set_cell(row, col, value).unwrap();
            prop_assert_eq!(previous, model[row * COLS + col]);
            model[row * COLS + col] = value;
        }

        prop_assert_eq!(chunk.to_values().unwrap(), model.clone());
        prop_assert_eq!(sorted(chunk.aspatial().collect()), sorted(model.clone()));

        let data: Vec<i32> = model.iter().copied().filter(|v| *v != NO_DATA).collect();
        let summary = chunk.summary();
        prop_assert_eq!(summary.n, data.len() as u64);
        prop_assert_eq!(summary.sum.to_f64(), data.iter().map(|v| *v as f64).sum::<f64>());
        prop_assert_eq!(summary.min, data.iter().copied().min());
        prop_assert_eq!(summary.max, data.iter().copied().max());
    }

    #[test]
    fn prop_reencoding_keeps_cells(
        factory in writable_factory(),
        writes in writes(),
    ) {
        let mut chunk = factory.create(ID, ROWS, COLS, NO_DATA, NO_DATA).unwrap();
        for (row, col, value) in writes {
            chunk.set_cell(row, col, value).unwrap();
        }
        let values = chunk.to_values().unwrap();

        for kind in [ChunkKind::Array, ChunkKind::Map] {
            let converted = factory.convert(&chunk, kind).unwrap();
            prop_assert_eq!(converted.kind(), kind);
            prop_assert_eq!(converted.to_values().unwrap(), values.clone());
        }
        let optimised = ChunkFactory::adaptive().optimise(&chunk).unwrap();
        prop_assert_eq!(optimised.to_values().unwrap(), values.clone());
        if optimised.kind() == ChunkKind::Singlet {
            prop_assert!(values.iter().all(|v| *v == values[0]));
        }

        let json = serde_json::to_string(&ChunkRecord::from_chunk(&chunk)).unwrap();
        let record: ChunkRecord<i32> = serde_json::from_str(&json).unwrap();
        let restored = record.into_chunk().unwrap();
        prop_assert_eq!(restored.kind(), chunk.kind());
        prop_assert_eq!(restored.to_values().unwrap(), values);
    }

    #[test]
    fn prop_float_sums_agree_across_encodings(
        values in prop::collection::vec(float_value(), ROWS * COLS),
    ) {
        let sums = encoded_sums(&values, f64::NAN);
        let mut reversed = ExactSum::new();
        for value in values.iter().rev().filter(|v| !v.is_nan()) {
            reversed.add(value.exact(), 1);
        }
        for (kind, sum) in &sums {
            prop_assert_eq!(sum, &reversed, "{} chunk", kind);
            prop_assert_eq!(sum.to_f64().to_bits(), reversed.to_f64().to_bits());
        }
    }

    #[test]
    fn prop_large_integer_sums_agree_across_encodings(
        values in prop::collection::vec(wide_integer(), ROWS * COLS),
    ) {
        let expected: i128 = values
            .iter()
            .filter(|v| **v != i64::MIN)
            .map(|v| i128::from(*v))
            .sum();
        for (kind, sum) in encoded_sums(&values, i64::MIN) {
            prop_assert_eq!(sum.to_integer(), Some(expected.into()), "{} chunk", kind);
        }
    }

    #[test]
    fn prop_singlet_sum_matches_array(value in float_value()) {
        let factory = ChunkFactory::default();
        let values = vec![value; ROWS * COLS];
        let singlet = factory
            .build_as(ChunkKind::Singlet, ID, ROWS, COLS, f64::NAN, values.clone())
            .unwrap();
        let array = factory
            .build_as(ChunkKind::Array, ID, ROWS, COLS, f64::NAN, values)
            .unwrap();
        prop_assert_eq!(singlet.summary(), array.summary());
    }
}

/// Finite floats from tenths to magnitudes where `f64` addition drops bits.
fn float_value() -> impl Strategy<Value = f64> {
    prop_oneof![
        (-1000i32..1000).prop_map(|v| f64::from(v) / 10.0),
        prop_oneof![Just(1e16), Just(-1e16), Just(0.1), Just(1e-300)],
        -1e17f64..1e17,
    ]
}

/// `i64` values clustered around 2^53, where `f64` loses integers.
fn wide_integer() -> impl Strategy<Value = i64> {
    prop_oneof![
        (-4i64..4).prop_map(|d| (1i64 << 53) + d),
        (-4i64..4).prop_map(|d| -(1i64 << 53) + d),
        -1000i64..1000,
        (i64::MIN / 64)..(i64::MAX / 64),
    ]
}

/// Sum of `values` as an Array chunk and as a Map chunk.
fn encoded_sums<T: CellValue>(values: &[T], no_data: T) -> Vec<(ChunkKind, ExactSum)> {
    let factory = ChunkFactory::default().with_promotion_threshold(3);
    [ChunkKind::Array, ChunkKind::Map]
        .into_iter()
        .map(|kind| {
            let chunk: Chunk<T> = factory
                .build_as(kind, ID, ROWS, COLS, no_data, values.to_vec())
                .unwrap();
            (kind, chunk.summary().sum)
        })
        .collect()
}
