//! Properties of the path layout every process must agree on.

use canopy::coordination::PathNamespace;
use canopy::coordination::escape_segment;
use canopy::coordination::unescape_segment;
use canopy::store::validate_path;
use proptest::prelude::*;

proptest! {
    #[test]
    fn escaped_names_are_single_valid_segments(name in ".{0,40}") {
        let segment = escape_segment(&name);
        prop_assert!(!segment.contains('/'));
        prop_assert!(segment != "." && segment != "..");
        prop_assert!(!segment.is_empty());
        validate_path(&format!("/{segment}")).unwrap();
        prop_assert_eq!(unescape_segment(&segment), Some(name));
    }

    #[test]
    fn distinct_names_never_collide(a in ".{0,20}", b in ".{0,20}") {
        prop_assume!(a != b);
        prop_assert_ne!(escape_segment(&a), escape_segment(&b));
        let ns = PathNamespace::new("canopy").unwrap();
        prop_assert_ne!(ns.lock_path(&a), ns.lock_path(&b));
        prop_assert_ne!(ns.map_entry_path("m", a.as_bytes()), ns.map_entry_path("m", b.as_bytes()));
    }

    #[test]
    fn derivation_is_deterministic(root in "[a-z]{1,8}(/[a-z]{1,8}){0,2}", name in ".{0,20}", key in prop::collection::vec(any::<u8>(), 0..64)) {
        let first = PathNamespace::new(&root).unwrap();
        let second = PathNamespace::new(&format!("/{root}/")).unwrap();
        prop_assert_eq!(first.map_entry_path(&name, &key), second.map_entry_path(&name, &key));
        prop_assert_eq!(first.multimap_value_path(&name, &key, b"v"), second.multimap_value_path(&name, &key, b"v"));
        prop_assert_eq!(first.counter_path(&name), second.counter_path(&name));
        let entry = first.map_entry_path(&name, &key);
        validate_path(&entry).unwrap();
        prop_assert!(entry.starts_with(&first.maps_path()));
    }
}
