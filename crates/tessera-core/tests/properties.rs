//! Property tests over the key model and the schema configuration.

use proptest::prelude::*;
use serde_json::json;
use tessera_core::{DataType, DatabaseSchema, IndexSchema, Key, KeyRange, StoreSchema};

fn scalar_key() -> impl Strategy<Value = Key> {
    prop_oneof![
        (-1.0e12f64..1.0e12).prop_map(Key::from),
        any::<i32>().prop_map(Key::from),
        (-10_000_000_000_000i64..10_000_000_000_000).prop_map(Key::Date),
        "[a-z]{0,8}".prop_map(Key::from),
    ]
}

fn any_key() -> impl Strategy<Value = Key> {
    scalar_key().prop_recursive(2, 16, 4, |inner| {
        prop::collection::vec(inner, 0..4).prop_map(Key::Array)
    })
}

proptest! {
    #[test]
    fn order_is_total_and_antisymmetric(a in any_key(), b in any_key()) {
        let ab = a.cmp(&b);
        let ba = b.cmp(&a);
        prop_assert_eq!(ab, ba.reverse());
    }

    #[test]
    fn json_round_trip_without_dates(a in scalar_key().prop_filter("dates map to strings", |k| !matches!(k, Key::Date(_)))) {
        prop_assert_eq!(Key::from_json(&a.to_json()), Some(a));
    }

    #[test]
    fn date_json_round_trip(ms in -10_000_000_000_000i64..10_000_000_000_000) {
        let key = Key::Date(ms);
        prop_assert_eq!(Key::from_json_typed(&key.to_json(), DataType::Date), Some(key));
    }

    #[test]
    fn closed_range_contains_its_bounds(a in any_key(), b in any_key()) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let range = KeyRange::bound(lo.clone(), hi.clone(), false, false).unwrap();
        prop_assert!(range.contains(&lo));
        prop_assert!(range.contains(&hi));
    }

    #[test]
    fn prefix_range_matches_starts_with(prefix in "[a-c]{0,3}", text in "[a-c]{0,5}") {
        let range = KeyRange::starts_with(&prefix);
        prop_assert_eq!(range.contains(&Key::from(text.as_str())), text.starts_with(&prefix));
    }
}

#[test]
fn schema_config_round_trip_with_every_option() {
    let store = StoreSchema::new("events")
        .with_key_path("id")
        .with_auto_increment(true)
        .with_key_type(DataType::Integer)
        .with_fixed(true)
        .with_index(IndexSchema::new("at").with_type(DataType::Date))
        .with_index(IndexSchema::new("labels").with_multi_entry(true).with_unique(true))
        .with_index(
            IndexSchema::new(vec!["kind", "at"])
                .with_name("by_kind")
                .with_type(vec![DataType::Text, DataType::Date]),
        );
    let schema = DatabaseSchema::new(vec![store]).unwrap().with_version(4);
    let config = schema.to_config();
    let back = DatabaseSchema::from_config(&config).unwrap();
    assert_eq!(back, schema);
    assert_eq!(back.to_config(), config);

    let events = back.store("events").unwrap();
    let record = json!({"id": 2, "at": "2024-05-01T00:00:00Z", "kind": "k", "labels": ["x"]});
    assert_eq!(
        events.index("by_kind").unwrap().extract_key(&record),
        Some(Key::Array(vec![Key::from("k"), Key::Date(1_714_521_600_000)]))
    );
}
