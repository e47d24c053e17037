//! Weak maps.
//!
//! A weak map holds its keys weakly and its values strongly *through* the
//! keys: a value stays alive iff its key is otherwise reachable. The marker
//! realizes this with weak-marking mode — visiting a key propagates to the
//! value — and sweep drops every entry whose key died.
//!
//! Maps are owned by their zone and swept with it.

use hashbrown::HashMap;

use super::cell::CellHeader;
use super::value::Value;
use super::zone::Zone;

pub struct WeakMap {
    pub(crate) zone: *mut Zone,
    /// Key cell → value. Keys are never nursery cells; insertion evicts the
    /// nursery first so minor GC cannot invalidate them behind our back.
    pub(crate) entries: HashMap<usize, Value>,
}

impl WeakMap {
    pub(crate) fn new(zone: *mut Zone) -> Box<WeakMap> {
        Box::new(WeakMap {
            zone,
            entries: HashMap::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn set(&mut self, key: *mut CellHeader, value: Value) {
        self.entries.insert(key as usize, value);
    }

    pub fn get(&self, key: *mut CellHeader) -> Option<Value> {
        self.entries.get(&(key as usize)).copied()
    }

    /// Drop entries whose keys did not survive. Runs while the owning zone
    /// sweeps.
    pub(crate) unsafe fn sweep(&mut self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|&key, _| (*(key as *mut CellHeader)).is_marked_any());
        before - self.entries.len()
    }

    /// Rewrite keys and values through forwarding overlays after relocation.
    pub(crate) unsafe fn update_after_compaction(&mut self) {
        let entries = std::mem::take(&mut self.entries);
        for (key, mut value) in entries {
            let key = super::cell::maybe_forwarded(key as *mut CellHeader);
            if let Some(cell) = value.as_cell() {
                let moved = super::cell::maybe_forwarded(cell);
                if moved != cell {
                    value = Value::cell(moved);
                }
            }
            self.entries.insert(key as usize, value);
        }
    }
}

/// Handle the embedding keeps for a weak map it created. The map lives and
/// dies with its zone.
#[derive(Copy, Clone)]
pub struct WeakMapRef(pub(crate) *mut WeakMap);

impl WeakMapRef {
    pub fn len(&self) -> usize {
        unsafe { (*self.0).len() }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: *mut CellHeader) -> Option<Value> {
        unsafe {
            let v = (*self.0).get(key);
            if let Some(value) = v {
                if let Some(cell) = value.as_cell() {
                    // Weak read: may resurrect mid-sweep.
                    super::barrier::read_barrier(cell);
                }
            }
            v
        }
    }
}
