use std::rc::Rc;

use objmap::object::Object;
use objmap::{ClassRegistry, MapperError, SqliteMapper};

fn temp_db(name: &str) -> String {
    let path = std::env::temp_dir().join(format!(
        "objmap_relations_{}_{}.sqlite",
        std::process::id(),
        name
    ));
    let _ = std::fs::remove_file(&path);
    path.to_string_lossy().into_owned()
}

fn registry() -> Rc<ClassRegistry> {
    Rc::new(ClassRegistry::with_basic())
}

fn stored(mapper: &mut SqliteMapper, tag: i64) -> objmap::SharedObject {
    let mut obj = Object::compound("Object");
    obj.set_attr("_tag", Object::integer(tag));
    let obj = obj.shared();
    mapper.insert(&obj).unwrap();
    obj
}

#[test]
fn relations_are_symmetric() {
    let path = temp_db("symmetry");
    let mut mapper = SqliteMapper::open(&path, registry()).unwrap();
    let creator = stored(&mut mapper, 0);
    let micrographs = stored(&mut mapper, 1);
    let particles = stored(&mut mapper, 2);

    mapper
        .insert_relation("source", &creator, &micrographs, &particles, None, None)
        .unwrap();
    mapper.commit().unwrap();

    let children = mapper.get_relation_children("source", &micrographs).unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].borrow().id(), particles.borrow().id());

    let parents = mapper.get_relation_parents("source", &particles).unwrap();
    assert_eq!(parents.len(), 1);
    assert_eq!(parents[0].borrow().id(), micrographs.borrow().id());
}

#[test]
fn relations_carry_extended_endpoints() {
    let path = temp_db("extended");
    let mut mapper = SqliteMapper::open(&path, registry()).unwrap();
    let creator = stored(&mut mapper, 0);
    let parent = stored(&mut mapper, 1);
    let child = stored(&mut mapper, 2);

    mapper
        .insert_relation(
            "source",
            &creator,
            &parent,
            &child,
            Some("outputParticles"),
            None,
        )
        .unwrap();

    let rows = mapper.get_relations_by_name("source").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].parent_extended.as_deref(), Some("outputParticles"));
    assert_eq!(rows[0].child_extended, None);
    assert_eq!(rows[0].parent_object_id, parent.borrow().id());
    assert_eq!(rows[0].child_object_id, child.borrow().id());
}

#[test]
fn relations_are_scoped_to_their_creator() {
    let path = temp_db("creator");
    let mut mapper = SqliteMapper::open(&path, registry()).unwrap();
    let step_a = stored(&mut mapper, 0);
    let step_b = stored(&mut mapper, 1);
    let x = stored(&mut mapper, 2);
    let y = stored(&mut mapper, 3);

    mapper
        .insert_relation("source", &step_a, &x, &y, None, None)
        .unwrap();
    mapper
        .insert_relation("source", &step_b, &y, &x, None, None)
        .unwrap();

    assert_eq!(mapper.get_relations_by_creator(&step_a).unwrap().len(), 1);
    assert_eq!(mapper.get_relations_by_name("source").unwrap().len(), 2);

    mapper.delete_relations(&step_a).unwrap();
    assert_eq!(mapper.get_relations_by_creator(&step_a).unwrap().len(), 0);
    assert_eq!(mapper.get_relations_by_name("source").unwrap().len(), 1);
}

#[test]
fn relations_require_persisted_endpoints() {
    let path = temp_db("unsaved");
    let mut mapper = SqliteMapper::open(&path, registry()).unwrap();
    let creator = stored(&mut mapper, 0);
    let parent = stored(&mut mapper, 1);
    let unsaved = Object::compound("Object").shared();

    let err = mapper
        .insert_relation("source", &creator, &parent, &unsaved, None, None)
        .unwrap_err();
    assert!(matches!(err, MapperError::NotPersisted(_)));
}
