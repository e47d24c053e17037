//! Binary-tree churn benchmark in the classic gcbench shape: build short
//! lived trees, keep one long-lived tree, measure allocation + collection.

use criterion::{criterion_group, criterion_main, Criterion};

use umbra::gc::cell::Gc;
use umbra::gc::cells::JsObject;
use umbra::gc::driver::GcReason;
use umbra::gc::kinds::TraceKind;
use umbra::gc::roots::PersistentRooted;
use umbra::gc::runtime::InitialHeap;
use umbra::gc::value::Value;
use umbra::gc::zone::{Compartment, ZoneSpec};
use umbra::{GcParams, GcRuntime};

fn make_tree(
    rt: &mut GcRuntime,
    compartment: *mut Compartment,
    depth: usize,
) -> Gc<JsObject> {
    let node = rt
        .allocate_object(compartment, 2, true, InitialHeap::Default)
        .expect("allocation");
    if depth > 0 {
        let left = make_tree(rt, compartment, depth - 1);
        JsObject::set_slot(node, 0, Value::cell(left.as_cell()));
        let right = make_tree(rt, compartment, depth - 1);
        JsObject::set_slot(node, 1, Value::cell(right.as_cell()));
    }
    node
}

fn gcbench(c: &mut Criterion) {
    c.bench_function("tree churn depth 8", |b| {
        let mut rt = GcRuntime::new(GcParams::default().with_nursery_bytes(4 * 1024 * 1024));
        let compartment = rt.new_compartment(ZoneSpec::System).expect("compartment");

        let long_lived = make_tree(&mut rt, compartment, 10);
        let root = Box::new(PersistentRooted::new(
            "long-lived",
            Value::cell(long_lived.as_cell()),
        ));
        rt.add_persistent(TraceKind::Object, &root);
        rt.evict_nursery(GcReason::Api);

        b.iter(|| {
            for _ in 0..4 {
                std::hint::black_box(make_tree(&mut rt, compartment, 8));
            }
            rt.gc(GcReason::Api);
        });

        rt.remove_persistent(TraceKind::Object, &root);
    });
}

criterion_group!(benches, gcbench);
criterion_main!(benches);
