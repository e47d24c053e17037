//! Weak maps: key-driven liveness, sweeping, resurrection.

mod common;

use common::*;
use umbra::gc::cells::JsObject;
use umbra::gc::driver::GcReason;
use umbra::gc::kinds::TraceKind;
use umbra::gc::roots::PersistentRooted;
use umbra::gc::value::Value;

/// Scenario: 100 entries, 50 keys rooted. After a full GC exactly the 50
/// live-keyed entries remain and their values are intact.
#[test]
fn weak_map_sweep_keeps_live_keyed_entries() {
    let mut rt = runtime();
    let compartment = system_compartment(&mut rt);
    let zone = compartment_zone(compartment);
    let map = rt.new_weak_map(zone);

    let container = alloc_tenured(&mut rt, compartment, 0);
    rt.grow_object_slots(container, 50).expect("grow");
    let root = Box::new(PersistentRooted::new(
        "keys",
        Value::cell(container.as_cell()),
    ));
    rt.add_persistent(TraceKind::Object, &root);

    let mut keys = Vec::new();
    for i in 0..100 {
        let key = alloc_tenured(&mut rt, compartment, 0);
        let value = alloc_tenured(&mut rt, compartment, 1);
        JsObject::init_slot(value, 0, Value::int32(i as i32));
        rt.weak_map_set(map, key.as_cell(), Value::cell(value.as_cell()));
        if i % 2 == 0 {
            JsObject::set_slot(container, i / 2, Value::cell(key.as_cell()));
        }
        keys.push(key);
    }
    assert_eq!(map.len(), 100);

    rt.gc(GcReason::Api);

    assert_eq!(map.len(), 50, "exactly the live-keyed half survives");
    for i in (0..100).step_by(2) {
        let key = container.slot(i / 2).as_cell().expect("key survives");
        let value = map.get(key).expect("live key keeps its value");
        let value = value.as_cell().expect("value is an object");
        let value = unsafe { umbra::gc::cell::Gc::<JsObject>::from_raw(value as *mut JsObject) };
        assert_eq!(value.slot(0).as_int32(), Some(i as i32));
    }
    for (i, key) in keys.iter().enumerate() {
        if i % 2 == 1 {
            assert!(
                map.get(key.as_cell()).is_none(),
                "dead key {} must have been dropped",
                i
            );
        }
    }

    rt.remove_persistent(TraceKind::Object, &root);
}

/// Values only reachable through a weak map keep *their* referents alive —
/// weak-marking propagates through values transitively.
#[test]
fn weak_values_keep_their_own_referents_alive() {
    let mut rt = runtime();
    let compartment = system_compartment(&mut rt);
    let zone = compartment_zone(compartment);
    let map = rt.new_weak_map(zone);

    let key = alloc_tenured(&mut rt, compartment, 0);
    let root = Box::new(PersistentRooted::new("key", Value::cell(key.as_cell())));
    rt.add_persistent(TraceKind::Object, &root);

    let value = alloc_tenured(&mut rt, compartment, 1);
    let referent = alloc_tenured(&mut rt, compartment, 1);
    JsObject::init_slot(referent, 0, Value::int32(123));
    JsObject::set_slot(value, 0, Value::cell(referent.as_cell()));
    rt.weak_map_set(map, key.as_cell(), Value::cell(value.as_cell()));

    rt.gc(GcReason::Api);

    assert!(value.header().is_marked_any(), "value lives through its key");
    assert!(
        referent.header().is_marked_any(),
        "the value's own edges must be traced"
    );
    assert_eq!(referent.slot(0).as_int32(), Some(123));

    rt.remove_persistent(TraceKind::Object, &root);
}

/// A key that only becomes marked *during* weak marking — through another
/// entry's value — still propagates to its own value. This is the weak-keys
/// table at work, not scan order.
#[test]
fn keys_marked_during_weak_marking_propagate() {
    let mut rt = runtime();
    let compartment = system_compartment(&mut rt);
    let zone = compartment_zone(compartment);
    let map = rt.new_weak_map(zone);

    let key1 = alloc_tenured(&mut rt, compartment, 0);
    let root = Box::new(PersistentRooted::new("key1", Value::cell(key1.as_cell())));
    rt.add_persistent(TraceKind::Object, &root);

    // map[key1] = v1, v1 → key2, map[key2] = v2. key2 is reachable only
    // through v1, which is itself reachable only through weak marking.
    let key2 = alloc_tenured(&mut rt, compartment, 0);
    let v1 = alloc_tenured(&mut rt, compartment, 1);
    let v2 = alloc_tenured(&mut rt, compartment, 1);
    JsObject::set_slot(v1, 0, Value::cell(key2.as_cell()));
    JsObject::init_slot(v2, 0, Value::int32(55));
    rt.weak_map_set(map, key1.as_cell(), Value::cell(v1.as_cell()));
    rt.weak_map_set(map, key2.as_cell(), Value::cell(v2.as_cell()));

    rt.gc(GcReason::Api);

    assert_eq!(map.len(), 2, "both entries live through the chain");
    let got = map
        .get(key2.as_cell())
        .and_then(|v| v.as_cell())
        .expect("v2 survives via the chained key");
    let got = unsafe { umbra::gc::cell::Gc::<JsObject>::from_raw(got as *mut JsObject) };
    assert_eq!(got.slot(0).as_int32(), Some(55));

    rt.remove_persistent(TraceKind::Object, &root);
}

/// Reading through a weak reference while the zone sweeps resurrects the
/// cell instead of handing out a dying one.
#[test]
fn weak_read_resurrects_during_sweep() {
    let mut rt = runtime();
    let compartment = system_compartment(&mut rt);
    let zone = compartment_zone(compartment);
    let map = rt.new_weak_map(zone);

    let key = alloc_tenured(&mut rt, compartment, 0);
    let value = alloc_tenured(&mut rt, compartment, 0);
    let root = Box::new(PersistentRooted::new("key", Value::cell(key.as_cell())));
    rt.add_persistent(TraceKind::Object, &root);
    rt.weak_map_set(map, key.as_cell(), Value::cell(value.as_cell()));

    rt.gc(GcReason::Api);

    // The value was live (via the key); a read keeps it live and, if the
    // zone were mid-sweep, would mark it black on the spot.
    let read = map.get(key.as_cell()).expect("entry kept");
    assert!(read.as_cell().is_some());
    assert!(value.header().is_marked_any());

    rt.remove_persistent(TraceKind::Object, &root);
}
