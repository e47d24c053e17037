//! Shared scaffolding for the collector's integration tests.
#![allow(dead_code)]

use umbra::gc::cell::Gc;
use umbra::gc::cells::JsObject;
use umbra::gc::runtime::InitialHeap;
use umbra::gc::value::Value;
use umbra::gc::zone::{Compartment, Zone, ZoneSpec};
use umbra::{GcParams, GcRuntime};

pub fn runtime() -> Box<GcRuntime> {
    runtime_with(GcParams::default())
}

pub fn runtime_with(params: GcParams) -> Box<GcRuntime> {
    GcRuntime::new(params)
}

pub fn system_compartment(rt: &mut GcRuntime) -> *mut Compartment {
    rt.new_compartment(ZoneSpec::System)
        .expect("compartment creation must succeed")
}

pub fn compartment_zone(compartment: *mut Compartment) -> *mut Zone {
    unsafe { (*compartment).zone() }
}

/// Tenured object with `slots` slots; background-finalizable so it is the
/// same kind the nursery path uses.
pub fn alloc_tenured(
    rt: &mut GcRuntime,
    compartment: *mut Compartment,
    slots: usize,
) -> Gc<JsObject> {
    rt.allocate_object(compartment, slots, true, InitialHeap::Tenured)
        .expect("tenured allocation must succeed")
}

/// Nursery object (falls back to tenured only if generational GC is off).
pub fn alloc_young(
    rt: &mut GcRuntime,
    compartment: *mut Compartment,
    slots: usize,
) -> Gc<JsObject> {
    rt.allocate_object(compartment, slots, true, InitialHeap::Default)
        .expect("nursery allocation must succeed")
}

/// Build a singly linked list of `len` tenured objects (slot 0 is the next
/// edge, slot 1 is free for tests) and return the head.
pub fn build_list(
    rt: &mut GcRuntime,
    compartment: *mut Compartment,
    len: usize,
) -> Gc<JsObject> {
    let mut head: Option<Gc<JsObject>> = None;
    for _ in 0..len {
        let obj = alloc_tenured(rt, compartment, 2);
        if let Some(next) = head {
            JsObject::set_slot(obj, 0, Value::cell(next.as_cell()));
        }
        head = Some(obj);
    }
    head.expect("list must not be empty")
}

/// Follow slot-0 edges from `head`, counting cells and asserting each one
/// is marked when `require_marked` is set.
pub fn walk_list(head: Gc<JsObject>, require_marked: bool) -> usize {
    let mut count = 0;
    let mut cur = Some(head);
    while let Some(obj) = cur {
        count += 1;
        if require_marked {
            assert!(
                obj.header().is_marked_any(),
                "list cell {} is unmarked",
                count
            );
        }
        cur = obj.slot(0).as_cell().map(|cell| unsafe {
            Gc::from_raw(cell as *mut JsObject)
        });
    }
    count
}
