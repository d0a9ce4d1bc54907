//! End-to-end tests for node construction and property access.
//!
//! Each test builds a small graph through the `GraphWrite` factory and reads
//! it back through `NodeSource`.

use metagraph::{Error, GraphWrite, NodeId, NodeSource, PropertyPath, Repository, Tier};
use pretty_assertions::assert_eq;

fn class(repo: &mut Repository) -> NodeId {
    let class = repo.new_node("Class", None, None, true);
    repo.add_top_level(class).unwrap();
    class
}

// ============================================================================
// 1. To-one access fails loudly on more than one value
// ============================================================================

#[test]
fn test_to_one_with_two_values_then_remove() {
    let mut repo = Repository::new();
    let class = class(&mut repo);
    let a = repo.new_node("A", Some(class), None, true);
    let x = repo.new_node("x", Some(class), None, true);
    let y = repo.new_node("y", Some(class), None, true);
    let p = PropertyPath::from("p");
    repo.add_key_values(a, &p, &[x, y]).unwrap();

    let err = repo.get(a).unwrap().value_for_meta_property_to_one("p").unwrap_err();
    match &err {
        Error::OneValue { property, count, .. } => {
            assert_eq!(property, "p");
            assert_eq!(*count, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
    let expected = "\
More than one (2) result is returned for the key 'p' in CoreInstance:

   A instance Class
       p(null):
           x instance Class
           y instance Class

Values:

x instance Class
y instance Class";
    assert_eq!(err.to_string(), expected);

    assert!(repo.remove_value_for_meta_property_to_many(a, "p", y).unwrap());
    assert_eq!(repo.get(a).unwrap().value_for_meta_property_to_one("p").unwrap(), Some(x));
}

#[test]
fn test_value_dump_is_capped() {
    let config = metagraph::RepositoryConfig { max_dumped_values: 1, ..Default::default() };
    let mut repo = Repository::with_config(config).unwrap();
    let a = repo.new_node("A", None, None, true);
    let x = repo.new_node("x", None, None, true);
    let y = repo.new_node("y", None, None, true);
    repo.add_key_values(a, &PropertyPath::from("p"), &[x, y]).unwrap();

    let err = repo.get(a).unwrap().value_for_meta_property_to_one("p").unwrap_err();
    assert!(!err.to_string().contains("Values:"));
}

#[test]
fn test_absent_and_empty_properties() {
    let mut repo = Repository::new();
    let a = repo.new_node("A", None, None, true);
    repo.add_key_with_empty_list(a, &PropertyPath::from("empty")).unwrap();

    let node = repo.get(a).unwrap();
    assert_eq!(node.value_for_meta_property_to_one("missing").unwrap(), None);
    assert_eq!(node.value_for_meta_property_to_one("empty").unwrap(), None);
    assert!(node.values_for_meta_property_to_many("missing").is_empty());
    assert!(!node.is_value_defined_for_key("empty"));
    assert_eq!(node.keys().collect::<Vec<_>>(), vec!["empty"]);
}

// ============================================================================
// 2. Insertion order and positional edits
// ============================================================================

#[test]
fn test_insertion_order_across_tiers() {
    let mut repo = Repository::new();
    let a = repo.new_node("A", None, None, true);
    let p = PropertyPath::from("p");
    let values: Vec<NodeId> = (0..100).map(|i| repo.new_node(format!("v{i}"), None, None, true)).collect();
    for &v in &values {
        repo.add_key_value(a, &p, v).unwrap();
    }

    let node = repo.get(a).unwrap();
    assert_eq!(node.values_for_meta_property_to_many("p"), values.as_slice());
    assert_eq!(node.table().container("p").unwrap().tier(), Tier::Indexed);
}

#[test]
fn test_modify_value_patches_forward_reference() {
    let mut repo = Repository::new();
    let a = repo.new_node("A", None, None, true);
    let placeholder = repo.new_unknown_type_node(None, None, true);
    let other = repo.new_node("other", None, None, true);
    let resolved = repo.new_node("resolved", None, None, true);
    let p = PropertyPath::from("p");
    repo.add_key_values(a, &p, &[other, placeholder]).unwrap();

    repo.modify_value_for_to_many_meta_property(a, "p", 1, resolved).unwrap();
    assert_eq!(repo.get(a).unwrap().values_for_meta_property_to_many("p"), &[other, resolved]);

    let err = repo.modify_value_for_to_many_meta_property(a, "p", 2, resolved).unwrap_err();
    assert!(matches!(err, Error::OutOfBounds { offset: 2, len: 2 }));
}

#[test]
fn test_set_key_values_replaces_content() {
    let mut repo = Repository::new();
    let a = repo.new_node("A", None, None, true);
    let x = repo.new_node("x", None, None, true);
    let y = repo.new_node("y", None, None, true);
    let p = PropertyPath::from("p");
    repo.add_key_values(a, &p, &[x, x, y]).unwrap();
    repo.set_key_values(a, &p, &[y]).unwrap();
    assert_eq!(repo.get(a).unwrap().values_for_meta_property_to_many("p"), &[y]);

    assert!(repo.remove_property(a, "p").unwrap());
    assert!(repo.get(a).unwrap().keys().next().is_none());
}

// ============================================================================
// 3. Keys, key instances and path resolution
// ============================================================================

#[test]
fn test_key_resolves_through_real_key() {
    let mut repo = Repository::new();
    let class = class(&mut repo);
    let name_property = repo.new_node("name", Some(class), None, true);
    repo.add_key_value(class, &PropertyPath::from("properties"), name_property).unwrap();

    let a = repo.new_node("a", Some(class), None, true);
    let value = repo.new_string("hello").unwrap();
    repo.add_key_value(a, &PropertyPath::from(["Class", "properties", "name"]), value).unwrap();

    let node = repo.get(a).unwrap();
    assert_eq!(node.key_by_name("name").unwrap(), Some(name_property));
    assert_eq!(
        node.real_key_by_name("name").map(|k| k.segments().to_vec()),
        Some(vec!["Class".to_string(), "properties".into(), "name".into()])
    );
}

#[test]
fn test_bound_key_instance_wins() {
    let mut repo = Repository::new();
    let a = repo.new_node("a", None, None, true);
    let key_node = repo.new_node("p", None, None, true);
    let key = PropertyPath::from(["Nowhere", "properties", "p"]);
    repo.bind_key_instance(a, &key, key_node).unwrap();
    assert_eq!(repo.get(a).unwrap().key_by_name("p").unwrap(), Some(key_node));
}

#[test]
fn test_unknown_type_children_are_memoized_by_name() {
    let mut repo = Repository::new();
    let package = repo.new_node("meta", None, None, true);
    let children = PropertyPath::from("children");
    let first = repo.get_or_create_unknown_type_node(package, &children, "pure").unwrap();
    let second = repo.get_or_create_unknown_type_node(package, &children, "pure").unwrap();
    let other = repo.get_or_create_unknown_type_node(package, &children, "other").unwrap();
    assert_eq!(first, second);
    assert_ne!(first, other);
    assert_eq!(repo.get(package).unwrap().values_for_meta_property_to_many("children").len(), 2);
}

#[test]
fn test_display_names_node_and_classifier() {
    let mut repo = Repository::new();
    let class = class(&mut repo);
    let a = repo.new_node("a", Some(class), None, true);
    let loose = repo.new_node("loose", None, None, true);
    assert_eq!(repo.get(a).unwrap().to_string(), format!("a({}) instanceOf Class", a));
    assert_eq!(repo.get(loose).unwrap().to_string(), format!("loose({}) instanceOf null", loose));
}
