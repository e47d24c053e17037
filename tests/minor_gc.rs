//! Nursery promotion and store-buffer behavior.

mod common;

use common::*;
use umbra::gc::cell::CellHeader;
use umbra::gc::cells::JsObject;
use umbra::gc::driver::GcReason;
use umbra::gc::kinds::{AllocKind, TraceKind};
use umbra::gc::region::in_nursery;
use umbra::gc::roots::PersistentRooted;
use umbra::gc::value::Value;
use umbra::GcParams;

/// Scenario: allocate 1000 objects in the nursery, keep half reachable from
/// a persistent root, evict, and check exactly the survivors moved.
#[test]
fn nursery_promotion_keeps_exactly_the_reachable_half() {
    let mut rt = runtime();
    let compartment = system_compartment(&mut rt);
    let zone = compartment_zone(compartment);

    let container = alloc_tenured(&mut rt, compartment, 0);
    rt.grow_object_slots(container, 500)
        .expect("slot growth must succeed");
    let root = Box::new(PersistentRooted::new(
        "container",
        Value::cell(container.as_cell()),
    ));
    rt.add_persistent(TraceKind::Object, &root);

    let baseline = unsafe { (*zone).live_cells(AllocKind::Object2Background) };

    for i in 0..1000 {
        let obj = alloc_young(&mut rt, compartment, 2);
        assert!(unsafe { in_nursery(obj.as_cell()) }, "object {} not young", i);
        JsObject::init_slot(obj, 0, Value::int32(i as i32));
        if i % 2 == 0 {
            JsObject::set_slot(container, i / 2, Value::cell(obj.as_cell()));
        }
    }

    rt.evict_nursery(GcReason::EvictNursery);

    let live = unsafe { (*zone).live_cells(AllocKind::Object2Background) };
    assert_eq!(
        live - baseline,
        500,
        "exactly the rooted half must have been tenured"
    );

    // The root now points at tenured copies with their payloads intact.
    for i in 0..500 {
        let value = container.slot(i);
        let cell = value.as_cell().expect("slot must still hold an object");
        assert!(
            !unsafe { in_nursery(cell) },
            "slot {} still points into the nursery",
            i
        );
        let obj = unsafe { umbra::gc::cell::Gc::<JsObject>::from_raw(cell as *mut JsObject) };
        assert_eq!(obj.slot(0).as_int32(), Some((i * 2) as i32));
    }

    rt.remove_persistent(TraceKind::Object, &root);
}

/// P2: after a minor GC no tenured cell reachable from roots points into
/// the nursery.
#[test]
fn no_nursery_pointers_survive_eviction() {
    let mut rt = runtime();
    let compartment = system_compartment(&mut rt);

    let holder = alloc_tenured(&mut rt, compartment, 4);
    let root = Box::new(PersistentRooted::new(
        "holder",
        Value::cell(holder.as_cell()),
    ));
    rt.add_persistent(TraceKind::Object, &root);

    for i in 0..4 {
        let young = alloc_young(&mut rt, compartment, 0);
        JsObject::set_slot(holder, i, Value::cell(young.as_cell()));
    }
    rt.evict_nursery(GcReason::EvictNursery);

    for i in 0..4 {
        let cell = holder.slot(i).as_cell().expect("slot must hold a cell");
        assert!(!unsafe { in_nursery(cell) });
    }
    rt.remove_persistent(TraceKind::Object, &root);
}

/// Nursery chains are promoted transitively, not just the buffered edge.
#[test]
fn promotion_follows_young_to_young_edges() {
    let mut rt = runtime();
    let compartment = system_compartment(&mut rt);

    let holder = alloc_tenured(&mut rt, compartment, 1);
    let root = Box::new(PersistentRooted::new(
        "holder",
        Value::cell(holder.as_cell()),
    ));
    rt.add_persistent(TraceKind::Object, &root);

    let a = alloc_young(&mut rt, compartment, 1);
    let b = alloc_young(&mut rt, compartment, 1);
    let c = alloc_young(&mut rt, compartment, 1);
    JsObject::init_slot(b, 0, Value::cell(c.as_cell()));
    JsObject::init_slot(a, 0, Value::cell(b.as_cell()));
    JsObject::init_slot(c, 0, Value::int32(7));
    JsObject::set_slot(holder, 0, Value::cell(a.as_cell()));

    rt.evict_nursery(GcReason::EvictNursery);

    let a = holder.slot(0).as_cell().expect("a survives");
    let a = unsafe { umbra::gc::cell::Gc::<JsObject>::from_raw(a as *mut JsObject) };
    let b = a.slot(0).as_cell().expect("b survives");
    assert!(!unsafe { in_nursery(b) });
    let b = unsafe { umbra::gc::cell::Gc::<JsObject>::from_raw(b as *mut JsObject) };
    let c = b.slot(0).as_cell().expect("c survives");
    assert!(!unsafe { in_nursery(c) });
    let c = unsafe { umbra::gc::cell::Gc::<JsObject>::from_raw(c as *mut JsObject) };
    assert_eq!(c.slot(0).as_int32(), Some(7));

    rt.remove_persistent(TraceKind::Object, &root);
}

/// With generational GC disabled every allocation is tenured and eviction
/// is a no-op.
#[test]
fn disabled_generational_gc_allocates_tenured() {
    let mut rt = runtime_with(GcParams::default().with_generational(false));
    let compartment = system_compartment(&mut rt);

    let obj = alloc_young(&mut rt, compartment, 2);
    assert!(!unsafe { in_nursery(obj.as_cell()) });

    let before = rt.stats().minor_collections;
    rt.evict_nursery(GcReason::EvictNursery);
    // Nothing to do: the nursery never held a cell.
    assert_eq!(rt.stats().minor_collections, before);
}

/// The store-buffer verifier walks the heap and finds every remembered
/// edge accounted for.
#[test]
fn store_buffer_verifier_passes_on_barriered_writes() {
    let mut rt = runtime();
    rt.set_zeal(umbra::ZealMode::CheckStoreBufferOnMinorGc, 100);
    let compartment = system_compartment(&mut rt);

    let holder = alloc_tenured(&mut rt, compartment, 8);
    let root = Box::new(PersistentRooted::new(
        "holder",
        Value::cell(holder.as_cell()),
    ));
    rt.add_persistent(TraceKind::Object, &root);

    for i in 0..8 {
        let young = alloc_young(&mut rt, compartment, 0);
        JsObject::set_slot(holder, i, Value::cell(young.as_cell()));
    }
    // Verifier runs inside the eviction; a missed barrier would panic.
    rt.evict_nursery(GcReason::EvictNursery);
    rt.remove_persistent(TraceKind::Object, &root);
}

/// Weak-map insertion with young keys evicts first so the map never holds
/// nursery pointers.
#[test]
fn weak_map_set_evicts_young_keys() {
    let mut rt = runtime();
    let compartment = system_compartment(&mut rt);
    let zone = compartment_zone(compartment);
    let map = rt.new_weak_map(zone);

    let holder = alloc_tenured(&mut rt, compartment, 1);
    let root = Box::new(PersistentRooted::new(
        "holder",
        Value::cell(holder.as_cell()),
    ));
    rt.add_persistent(TraceKind::Object, &root);

    let key = alloc_young(&mut rt, compartment, 0);
    JsObject::set_slot(holder, 0, Value::cell(key.as_cell()));
    rt.weak_map_set(map, key.as_cell(), Value::int32(11));

    // The key the map recorded is the tenured copy.
    let moved: *mut CellHeader = holder.slot(0).as_cell().expect("key survives");
    assert!(!unsafe { in_nursery(moved) });
    assert_eq!(map.get(moved).and_then(|v| v.as_int32()), Some(11));

    rt.remove_persistent(TraceKind::Object, &root);
}
