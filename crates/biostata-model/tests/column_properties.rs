use biostata_model::{
    simplify_integer_list, Column, ColumnSet, Dictionary, DictionaryType, FunctionId, IdItem,
    Kwargs, Representation, Value,
};
use proptest::prelude::*;
use std::sync::Arc;

fn enum_repr() -> Representation {
    let dict = Dictionary::from_pairs(
        "stage",
        DictionaryType::Enum,
        [(0, "egg"), (1, "larva"), (2, "pupa"), (5, "adult")],
    )
    .unwrap();
    Representation::Dictionary(Arc::new(dict))
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        rng_seed: proptest::test_runner::RngSeed::Fixed(0),
        failure_persistence: None,
        .. ProptestConfig::default()
    })]

    #[test]
    fn int_round_trip(x in any::<i64>()) {
        let raw = Value::Integer(x);
        prop_assert_eq!(Representation::Int.dematerialize(&Representation::Int.represent(&raw)), raw);
    }

    #[test]
    fn real_round_trip(x in -1.0e12f64..1.0e12) {
        let raw = Value::Real(x);
        prop_assert_eq!(Representation::Real.dematerialize(&Representation::Real.represent(&raw)), raw);
    }

    #[test]
    fn text_round_trip(s in ".*") {
        let raw = Value::Text(s);
        prop_assert_eq!(Representation::Text.dematerialize(&Representation::Text.represent(&raw)), raw);
    }

    #[test]
    fn dictionary_round_trip_preserves_keys(idx in 0usize..4) {
        let repr = enum_repr();
        let key = repr.dictionary().unwrap().keys()[idx];
        let raw = Value::Integer(key);
        prop_assert_eq!(repr.dematerialize(&repr.represent(&raw)), raw);
    }

    #[test]
    fn simplify_expands_back_to_the_sorted_set(
        values in proptest::collection::vec(-50i64..50, 0..64),
        min_run in 2usize..6,
    ) {
        let items = simplify_integer_list(&values, min_run);
        let mut expected = values.clone();
        expected.sort_unstable();
        expected.dedup();
        prop_assert_eq!(biostata_model::filter::expand_id_items(&items), expected);
        for item in items {
            if let IdItem::Range(a, b) = item {
                prop_assert!((b - a + 1) as usize >= min_run);
            }
        }
    }

    #[test]
    fn partition_survives_random_edits(ops in proptest::collection::vec((0u8..4, 0usize..8), 0..24)) {
        let mut set = ColumnSet::new();
        let mut counter = 0;
        for (op, pick) in ops {
            let names: Vec<String> = set.names().skip(1).map(str::to_string).collect();
            match op {
                0 => {
                    counter += 1;
                    set.add(Column::stored(format!("r{counter}"), Representation::Real)).unwrap();
                }
                1 => {
                    counter += 1;
                    set.add(Column::stored(format!("t{counter}"), Representation::Text)).unwrap();
                }
                2 if !names.is_empty() => {
                    let name = &names[pick % names.len()];
                    if set.dependents(name).is_empty() {
                        set.remove(name).unwrap();
                    }
                }
                3 if !names.is_empty() => {
                    let name = &names[pick % names.len()];
                    let repr = if set.require(name).unwrap().is_category() {
                        Representation::Real
                    } else {
                        Representation::Int
                    };
                    set.set_representation(name, repr).unwrap();
                }
                _ => {}
            }
            prop_assert_eq!(set.at(0).unwrap().name(), "id");
            prop_assert!(set.is_partitioned());
        }
    }
}

#[test]
fn run_of_exactly_min_length_collapses_and_one_shorter_does_not() {
    assert_eq!(simplify_integer_list(&[1, 2, 3, 4], 4), vec![IdItem::Range(1, 4)]);
    assert_eq!(
        simplify_integer_list(&[1, 2, 3], 4),
        vec![IdItem::Single(1), IdItem::Single(2), IdItem::Single(3)]
    );
}

#[test]
fn computed_columns_need_existing_dependencies() {
    let mut set = ColumnSet::new();
    let orphan = Column::computed(
        "x",
        Representation::Real,
        FunctionId::Abs,
        vec!["missing".to_string()],
        false,
        Kwargs::new(),
    )
    .unwrap();
    assert!(set.add(orphan).is_err());
}
