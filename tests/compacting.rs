//! Compaction: region reclamation and forwarding fidelity.

mod common;

use common::*;
use umbra::gc::cell::Gc;
use umbra::gc::cells::JsObject;
use umbra::gc::driver::GcReason;
use umbra::gc::kinds::{AllocKind, TraceKind};
use umbra::gc::roots::PersistentRooted;
use umbra::gc::value::Value;

/// Scenario: 1000 objects of one compactable kind, 900 freed, compaction
/// forced. The kind's region count drops and every held reference still
/// dereferences to the same logical object.
#[test]
fn compaction_reclaims_regions_and_forwards_references() {
    let mut rt = runtime();
    let compartment = system_compartment(&mut rt);
    let zone = compartment_zone(compartment);

    let container = alloc_tenured(&mut rt, compartment, 0);
    rt.grow_object_slots(container, 100)
        .expect("slot growth must succeed");
    let root = Box::new(PersistentRooted::new(
        "container",
        Value::cell(container.as_cell()),
    ));
    rt.add_persistent(TraceKind::Object, &root);

    // Plain (foreground) 4-slot objects: one kind, one region list.
    for i in 0..1000 {
        let obj = rt
            .allocate_object(
                compartment,
                4,
                false,
                umbra::gc::runtime::InitialHeap::Tenured,
            )
            .expect("allocation must succeed");
        JsObject::init_slot(obj, 0, Value::int32(i as i32));
        if i % 10 == 0 {
            JsObject::set_slot(container, (i / 10) as usize, Value::cell(obj.as_cell()));
        }
    }

    // Drop the 900: collect once so the regions are fragmented.
    rt.gc(GcReason::Api);
    let regions_before = unsafe { (*zone).region_count(AllocKind::Object4) };
    let live_before = unsafe { (*zone).live_cells(AllocKind::Object4) };
    assert_eq!(live_before, 100);
    assert!(regions_before >= 4, "1000 objects must span several regions");

    rt.compacting_gc(GcReason::Api);

    let regions_after = unsafe { (*zone).region_count(AllocKind::Object4) };
    assert!(
        regions_after < regions_before,
        "compaction must shrink the region count ({} -> {})",
        regions_before,
        regions_after
    );
    assert_eq!(unsafe { (*zone).live_cells(AllocKind::Object4) }, 100);

    // P3: identity and payload preserved through relocation.
    for i in 0..100 {
        let cell = container.slot(i).as_cell().expect("survivor lost");
        let obj = unsafe { Gc::<JsObject>::from_raw(cell as *mut JsObject) };
        assert_eq!(
            obj.slot(0).as_int32(),
            Some((i * 10) as i32),
            "survivor {} lost its payload after relocation",
            i
        );
    }

    rt.remove_persistent(TraceKind::Object, &root);
}

/// Graph edges between relocated cells are rewritten, not just root edges.
#[test]
fn compaction_updates_interior_edges() {
    let mut rt = runtime();
    let compartment = system_compartment(&mut rt);

    let container = alloc_tenured(&mut rt, compartment, 2);
    let root = Box::new(PersistentRooted::new(
        "container",
        Value::cell(container.as_cell()),
    ));
    rt.add_persistent(TraceKind::Object, &root);

    // A pair that references each other, plus heavy garbage around them so
    // their region gets picked for relocation.
    let a = alloc_tenured(&mut rt, compartment, 2);
    let b = alloc_tenured(&mut rt, compartment, 2);
    JsObject::set_slot(a, 0, Value::cell(b.as_cell()));
    JsObject::set_slot(b, 0, Value::cell(a.as_cell()));
    JsObject::init_slot(a, 1, Value::int32(1));
    JsObject::init_slot(b, 1, Value::int32(2));
    JsObject::set_slot(container, 0, Value::cell(a.as_cell()));
    for _ in 0..2000 {
        alloc_tenured(&mut rt, compartment, 2);
    }

    rt.gc(GcReason::Api);
    rt.compacting_gc(GcReason::Api);

    let a = container.slot(0).as_cell().expect("a survives");
    let a = unsafe { Gc::<JsObject>::from_raw(a as *mut JsObject) };
    assert_eq!(a.slot(1).as_int32(), Some(1));
    let b = a.slot(0).as_cell().expect("b survives");
    let b = unsafe { Gc::<JsObject>::from_raw(b as *mut JsObject) };
    assert_eq!(b.slot(1).as_int32(), Some(2));
    let back = b.slot(0).as_cell().expect("back edge survives");
    assert_eq!(back, a.as_cell(), "cycle must close on the moved copy");

    rt.remove_persistent(TraceKind::Object, &root);
}

/// Unique ids follow cells through relocation.
#[test]
fn unique_ids_survive_compaction() {
    let mut rt = runtime();
    let compartment = system_compartment(&mut rt);

    let container = alloc_tenured(&mut rt, compartment, 1);
    let root = Box::new(PersistentRooted::new(
        "container",
        Value::cell(container.as_cell()),
    ));
    rt.add_persistent(TraceKind::Object, &root);

    let obj = alloc_tenured(&mut rt, compartment, 1);
    JsObject::set_slot(container, 0, Value::cell(obj.as_cell()));
    let id = rt.get_unique_id(obj.as_cell());
    for _ in 0..1000 {
        alloc_tenured(&mut rt, compartment, 1);
    }

    rt.gc(GcReason::Api);
    rt.compacting_gc(GcReason::Api);

    let moved = container.slot(0).as_cell().expect("object survives");
    assert_eq!(
        rt.get_unique_id(moved),
        id,
        "a cell's unique id must be stable across relocation"
    );

    rt.remove_persistent(TraceKind::Object, &root);
}
