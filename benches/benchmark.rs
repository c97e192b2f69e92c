use std::rc::Rc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use objmap::object::Object;
use objmap::{ClassRegistry, FlatMapper, Query};

fn particle_registry() -> Rc<ClassRegistry> {
    let mut registry = ClassRegistry::with_basic();
    registry.register("Particle", || {
        let mut p = Object::compound("Particle");
        p.set_attr("_index", Object::integer(0));
        p.set_attr("_filename", Object::text(""));
        p.set_attr("_samplingRate", Object::float(0.0));
        p
    });
    Rc::new(registry)
}

fn particle(index: i64) -> Object {
    let mut p = Object::compound("Particle");
    p.set_attr("_index", Object::integer(index));
    p.set_attr(
        "_filename",
        Object::text(&format!("stack.mrcs:{}", index)),
    );
    p.set_attr("_samplingRate", Object::float(1.34));
    p
}

fn flat_insert(c: &mut Criterion) {
    c.bench_function("flat insert 1000", |b| {
        b.iter(|| {
            let mut mapper = FlatMapper::open(":memory:", "", particle_registry()).unwrap();
            for i in 1..=1000 {
                mapper.insert(black_box(&particle(i))).unwrap();
            }
            mapper.commit().unwrap();
        })
    });
}

fn flat_scan(c: &mut Criterion) {
    let mut mapper = FlatMapper::open(":memory:", "", particle_registry()).unwrap();
    for i in 1..=10_000 {
        mapper.insert(&particle(i)).unwrap();
    }
    mapper.commit().unwrap();
    c.bench_function("flat scan 10k", |b| {
        b.iter(|| {
            let mut total = 0i64;
            mapper
                .scan(&Query::default(), |item| {
                    if let objmap::Value::Int(i) = item.get_nested_value("_index") {
                        total += i;
                    }
                    Ok(())
                })
                .unwrap();
            black_box(total)
        })
    });
}

criterion_group!(benches, flat_insert, flat_scan);
criterion_main!(benches);
