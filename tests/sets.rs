use std::rc::Rc;

use objmap::object::Object;
use objmap::set::{Set, StreamState};
use objmap::{ClassRegistry, Query, Value};

fn temp_db(name: &str) -> String {
    let path = std::env::temp_dir().join(format!(
        "objmap_set_{}_{}.sqlite",
        std::process::id(),
        name
    ));
    let _ = std::fs::remove_file(&path);
    path.to_string_lossy().into_owned()
}

fn coordinate_registry() -> Rc<ClassRegistry> {
    let mut registry = ClassRegistry::with_basic();
    registry.register("Coordinate", || {
        let mut c = Object::compound("Coordinate");
        c.set_attr("_x", Object::integer(0));
        c.set_attr("_y", Object::integer(0));
        c
    });
    Rc::new(registry)
}

fn coordinate(x: i64, y: i64) -> Object {
    let mut c = Object::compound("Coordinate");
    c.set_attr("_x", Object::integer(x));
    c.set_attr("_y", Object::integer(y));
    c
}

#[test]
fn an_empty_set_writes_and_reopens_cleanly() {
    let path = temp_db("empty");
    {
        let mut set = Set::new(
            &path,
            "",
            "SetOfCoordinates",
            "Coordinate",
            coordinate_registry(),
        );
        // nothing appended, yet writing the header must not fail
        set.write(true).unwrap();
    }

    let mut set = Set::open(
        &path,
        "",
        "SetOfCoordinates",
        "Coordinate",
        coordinate_registry(),
    )
    .unwrap();
    assert_eq!(set.len(), 0);
    assert!(set.is_empty());
    assert!(set.items(&Query::default()).unwrap().is_empty());
    assert!(set.first_item().unwrap().is_none());
}

#[test]
fn appended_items_get_sequential_ids() {
    let path = temp_db("ids");
    let mut set = Set::new(
        &path,
        "",
        "SetOfCoordinates",
        "Coordinate",
        coordinate_registry(),
    );
    for i in 0..3 {
        let mut c = coordinate(i, i * 2);
        set.append(&mut c).unwrap();
        assert_eq!(c.id(), Some(i + 1));
    }
    assert_eq!(set.len(), 3);

    // an explicit id pushes the counter forward
    let mut jumper = coordinate(9, 9);
    jumper.set_id(Some(100));
    set.append(&mut jumper).unwrap();
    assert_eq!(set.id_count(), 100);

    let mut next = coordinate(10, 10);
    set.append(&mut next).unwrap();
    assert_eq!(next.id(), Some(101));
    assert_eq!(set.len(), 5);
}

#[test]
fn the_header_round_trips_through_properties() {
    let path = temp_db("header");
    {
        let mut set = Set::new(
            &path,
            "",
            "SetOfCoordinates",
            "Coordinate",
            coordinate_registry(),
        );
        for i in 0..4 {
            set.append(&mut coordinate(i, i)).unwrap();
        }
        set.set_stream_state(StreamState::Open);
        set.write(true).unwrap();
    }

    let set = Set::open(
        &path,
        "",
        "Set",
        "Coordinate",
        coordinate_registry(),
    )
    .unwrap();
    // class name, size and stream state come from the stored header
    assert_eq!(set.class_name(), "SetOfCoordinates");
    assert_eq!(set.len(), 4);
    assert_eq!(set.stream_state(), StreamState::Open);
    assert!(set.is_stream_open());
}

#[test]
fn the_representative_survives_a_reopen() {
    let path = temp_db("representative");
    {
        let mut set = Set::new(
            &path,
            "",
            "SetOfCoordinates",
            "Coordinate",
            coordinate_registry(),
        );
        set.append(&mut coordinate(1, 1)).unwrap();
        set.append(&mut coordinate(2, 2)).unwrap();
        set.set_representative(Some(coordinate(5, 6)));
        set.write(true).unwrap();
    }

    let set = Set::open(
        &path,
        "",
        "Set",
        "Coordinate",
        coordinate_registry(),
    )
    .unwrap();
    let rep = set.representative().unwrap();
    assert_eq!(rep.class_name(), "Coordinate");
    assert_eq!(rep.get_nested_value("_x"), Value::Int(5));
    assert_eq!(rep.get_nested_value("_y"), Value::Int(6));
}

#[test]
fn header_object_carries_the_mapper_path() {
    let path = temp_db("header_obj");
    let mut set = Set::new(
        &path,
        "Coords",
        "SetOfCoordinates",
        "Coordinate",
        coordinate_registry(),
    );
    set.append(&mut coordinate(1, 1)).unwrap();
    let header = set.header_object();
    assert_eq!(header.class_name(), "SetOfCoordinates");
    assert_eq!(header.get_nested_value("_size"), Value::Int(1));
    assert_eq!(
        header.get_nested_value("_mapperPath"),
        Value::Text(format!("{},Coords", path))
    );

    let mut other = Set::new("", "", "Set", "Coordinate", coordinate_registry());
    other.apply_header(&header);
    assert_eq!(other.file_name(), path);
    assert_eq!(other.class_name(), "SetOfCoordinates");
    assert_eq!(other.len(), 1);
}

#[test]
fn lookup_and_subsets() {
    let path = temp_db("lookup");
    let mut set = Set::new(
        &path,
        "",
        "SetOfCoordinates",
        "Coordinate",
        coordinate_registry(),
    );
    for i in 1..=10 {
        set.append(&mut coordinate(i, 100 - i)).unwrap();
    }

    assert!(set.contains(7).unwrap());
    assert!(!set.contains(77).unwrap());
    let item = set.get_by_id(7).unwrap().unwrap();
    assert_eq!(item.get_nested_value("_x"), Value::Int(7));

    let subset = set.take(3).unwrap();
    assert_eq!(subset.len(), 3);
    assert_eq!(subset[2].get_nested_value("_x"), Value::Int(3));

    let mut visited = 0;
    set.for_each(&Query::default(), |_| {
        visited += 1;
        Ok(())
    })
    .unwrap();
    assert_eq!(visited, 10);
}

#[test]
fn reopened_sets_append_only_after_enable_append() {
    let path = temp_db("reopen");
    {
        let mut set = Set::new(
            &path,
            "",
            "SetOfCoordinates",
            "Coordinate",
            coordinate_registry(),
        );
        set.append(&mut coordinate(1, 1)).unwrap();
        set.append(&mut coordinate(2, 2)).unwrap();
        set.write(true).unwrap();
    }

    let mut set = Set::open(
        &path,
        "",
        "SetOfCoordinates",
        "Coordinate",
        coordinate_registry(),
    )
    .unwrap();
    assert!(set.append(&mut coordinate(3, 3)).is_err());

    set.enable_append().unwrap();
    set.append(&mut coordinate(3, 3)).unwrap();
    // the id counter resumed from the stored maximum
    assert_eq!(set.id_count(), 3);
    assert!(set.contains(3).unwrap());

    // updating an existing item goes through the same commands
    let mut first = set.get_by_id(1).unwrap().unwrap();
    first.set_attribute_value("_y", Value::Int(42));
    set.update(&first).unwrap();
    let reread = set.get_by_id(1).unwrap().unwrap();
    assert_eq!(reread.get_nested_value("_y"), Value::Int(42));
}

#[test]
fn clear_empties_the_set() {
    let path = temp_db("clear");
    let mut set = Set::new(
        &path,
        "",
        "SetOfCoordinates",
        "Coordinate",
        coordinate_registry(),
    );
    for i in 1..=5 {
        set.append(&mut coordinate(i, i)).unwrap();
    }
    set.clear().unwrap();
    assert_eq!(set.len(), 0);
    assert_eq!(set.id_count(), 0);
    assert!(set.items(&Query::default()).unwrap().is_empty());

    set.append(&mut coordinate(1, 1)).unwrap();
    assert_eq!(set.len(), 1);
    assert_eq!(set.id_count(), 1);
}
