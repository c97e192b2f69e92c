use objmap::object::Object;
use objmap::{Kind, Value};

#[test]
fn scalar_coercion_and_defaults() {
    let mut count = Object::new(Kind::Integer);
    assert_eq!(count.get(), Value::Empty);
    assert_eq!(count.get_or(Value::Int(7)), Value::Int(7));
    count.set(Value::Text("13".to_string())).unwrap();
    assert_eq!(count.get(), Value::Int(13));

    let mut rate = Object::new(Kind::Float);
    rate.set(Value::Int(2)).unwrap();
    assert_eq!(rate.get(), Value::Float(2.0));
    rate.set(Value::Text("1.34".to_string())).unwrap();
    assert_eq!(rate.get(), Value::Float(1.34));

    let mut flag = Object::new(Kind::Boolean);
    flag.set(Value::Text("True".to_string())).unwrap();
    assert_eq!(flag.get(), Value::Bool(true));
    flag.set(Value::Int(0)).unwrap();
    assert_eq!(flag.get(), Value::Bool(false));
}

#[test]
fn csv_list_round_trips_through_joined_text() {
    let mut csv = Object::csv_list();
    csv.push_csv("one");
    csv.push_csv("two");
    csv.push_csv("three");
    // reading and storing both yield the joined text
    assert_eq!(csv.get(), Value::Text("one,two,three".to_string()));
    let stored = csv.stored_value().stored_text().unwrap();

    let mut reread = Object::csv_list();
    reread.set(Value::Text(stored)).unwrap();
    assert_eq!(reread.csv_items(), vec!["one", "two", "three"]);
    assert_eq!(reread.csv_len(), 3);
}

#[test]
fn pointer_follows_extended_path() {
    let mut volume = Object::compound("Volume");
    volume.set_attr("_size", Object::integer(64));
    let mut inner = Object::compound("Transform");
    inner.set_attr("_scale", Object::float(0.5));
    volume.set_attr("_transform", inner);
    let volume = volume.shared();

    let ptr = Object::pointer_with_extended(&volume, "_transform._scale");
    let resolved = ptr.follow().unwrap();
    assert_eq!(resolved.borrow().get(), Value::Float(0.5));

    let dangling = Object::pointer_with_extended(&volume, "_missing");
    assert!(dangling.points_none());
    assert!(dangling.follow().is_none());
}

#[test]
fn pointer_extended_resolves_into_list_items() {
    let mut list = Object::list();
    list.push(Object::text("first"));
    list.push(Object::text("second"));
    let list = list.shared();

    let ptr = Object::pointer_with_extended(&list, "1");
    let resolved = ptr.follow().unwrap();
    assert_eq!(resolved.borrow().get(), Value::Text("second".to_string()));
}

#[test]
fn setting_a_pointer_target_cleans_the_extended_path() {
    let a = Object::compound("A").shared();
    let b = Object::compound("B").shared();
    let mut ptr = Object::pointer_with_extended(&a, "_x");
    assert!(ptr.has_extended());
    ptr.set_target(Some(b));
    assert!(!ptr.has_extended());
}

#[test]
fn scalar_pointer_override_shadows_the_own_value() {
    let mut rate = Object::new(Kind::Float);
    rate.set(Value::Float(1.0)).unwrap();

    let shared_rate = Object::float(2.5).shared();
    rate.set_pointer(Some(Object::pointer_to(&shared_rate)));
    assert_eq!(rate.get(), Value::Float(2.5));

    rate.set_pointer(None);
    assert_eq!(rate.get(), Value::Float(1.0));
}

#[test]
fn pointer_list_coerces_plain_objects() {
    let mut ptrs = Object::pointer_list();
    ptrs.push(Object::integer(5));
    let first = ptrs.item(0).unwrap();
    assert!(first.borrow().is_pointer());
    let target = first.borrow().follow().unwrap();
    assert_eq!(target.borrow().get(), Value::Int(5));
}

#[test]
fn copy_rewrites_pointers_into_the_copied_subtree() {
    let mut original = Object::compound("Micrograph");
    let data = original.set_attr("_data", Object::integer(42));
    data.borrow_mut().set_id(Some(7));
    let ptr = Object::pointer_to(&data);
    original.set_attr("_ref", ptr);

    let mut copy = Object::compound("Micrograph");
    copy.copy_from(&original, true);

    let copied_data = copy.attr("_data").unwrap();
    let copied_ptr = copy.attr("_ref").unwrap();
    let target = copied_ptr.borrow().target().unwrap();
    assert!(std::rc::Rc::ptr_eq(&target, &copied_data));
    assert_eq!(copied_data.borrow().id(), Some(7));
    assert_eq!(copied_data.borrow().get(), Value::Int(42));
}

#[test]
fn copy_keeps_pointers_to_external_objects() {
    let external = Object::compound("External").shared();
    external.borrow_mut().set_id(Some(99));
    let mut original = Object::compound("Step");
    original.set_attr("_input", Object::pointer_to(&external));

    let mut copy = Object::compound("Step");
    copy.copy_from(&original, false);
    let copied_ptr = copy.attr("_input").unwrap();
    let target = copied_ptr.borrow().target().unwrap();
    assert!(std::rc::Rc::ptr_eq(&target, &external));
}

#[test]
fn equal_attributes_uses_a_float_epsilon() {
    let mut a = Object::compound("Acq");
    a.set_attr("_dose", Object::float(1.0004));
    a.set_attr("_count", Object::integer(3));
    let mut b = Object::compound("Acq");
    b.set_attr("_dose", Object::float(1.0));
    b.set_attr("_count", Object::integer(3));
    assert!(a.equal_attributes(&b, &[]));

    b.set_attr("_dose", Object::float(1.1));
    assert!(!a.equal_attributes(&b, &[]));
    assert!(a.equal_attributes(&b, &["_dose"]));
}

#[test]
fn clean_id_resets_the_whole_subtree() {
    let mut root = Object::compound("Root");
    root.set_id(Some(1));
    let child = root.set_attr("_c", Object::integer(5));
    child.borrow_mut().set_id(Some(2));
    root.clean_id();
    assert!(!root.has_id());
    assert!(!child.borrow().has_id());
}

#[test]
fn obj_dict_flattens_compounds_and_skips_pointers() {
    let target = Object::compound("Elsewhere").shared();
    let mut mic = Object::compound("Micrograph");
    mic.set_attr("_index", Object::integer(1));
    let mut acq = Object::compound("Acquisition");
    acq.set_attr("_voltage", Object::float(300.0));
    mic.set_attr("_acquisition", acq);
    mic.set_attr("_ref", Object::pointer_to(&target));

    let labels: Vec<String> = mic
        .obj_dict(true)
        .into_iter()
        .map(|e| e.label)
        .collect();
    assert_eq!(
        labels,
        vec!["self", "_index", "_acquisition", "_acquisition._voltage"]
    );
}

#[test]
fn non_storable_attributes_are_left_out() {
    let mut obj = Object::compound("Obj");
    obj.set_attr("_kept", Object::integer(1));
    let skipped = obj.set_attr("_skipped", Object::integer(2));
    skipped.borrow_mut().set_do_store(false);
    let stored: Vec<String> = obj
        .attributes_to_store()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(stored, vec!["_kept"]);
}
