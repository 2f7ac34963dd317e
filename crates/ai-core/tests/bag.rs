use ai_core::{PropKey, PropertyBag, Tag, Value, ValueKind};

#[test]
fn bag_keeps_declared_kind_per_slot() {
    let mut bag = PropertyBag::new().with("speed", 2.5f32).with("ammo", 12);

    assert_eq!(bag.index_of("ammo"), Some(1));
    assert!(bag.set(1, Value::Int(3)));
    assert!(!bag.set(1, Value::Float(3.0)));
    assert!(!bag.set(7, Value::Int(3)));
    assert_eq!(bag.int("ammo"), Some(3));
    assert_eq!(bag.kind_of(0), Some(ValueKind::Float));
}

#[test]
fn typed_keys_read_and_write() {
    let mut bag = PropertyBag::new().with("alert", false);
    let key: PropKey<bool> = bag.key("alert").unwrap();

    assert!(bag.key::<i64>("alert").is_none());
    assert!(bag.write(key, true));
    assert_eq!(bag.read(key), Some(true));
}

#[test]
fn schema_match_ignores_values() {
    let a = PropertyBag::new().with("a", 1).with("b", Tag::from_static("x"));
    let b = PropertyBag::new().with("a", 9).with("b", Tag::from_static("y"));
    let c = PropertyBag::new().with("b", Tag::from_static("y")).with("a", 9);

    assert!(a.matches_schema(&b));
    assert!(!a.matches_schema(&c));
}

#[test]
fn tags_match_hierarchically() {
    let spotted = Tag::from_static("enemy.spotted");

    assert!(spotted.matches(&Tag::from_static("enemy")));
    assert!(spotted.matches(&Tag::from_static("enemy.spotted")));
    assert!(!spotted.matches(&Tag::from_static("enemy.spot")));
    assert!(!Tag::from_static("enemy").matches(&spotted));
    assert_eq!(spotted.parent(), Some(Tag::from_static("enemy")));
}
