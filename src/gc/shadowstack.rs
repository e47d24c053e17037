//! Shadow stack for stack rooting.
//!
//! A singly linked list of stack-allocated entries mirroring the machine
//! stack. Rooting a value pushes an entry; the entry's drop pops it. No heap
//! allocation, no reference counting, and the collector can walk every live
//! stack root by following the chain.
//!
//! Entries carry a monomorphized trace thunk instead of a trait-object
//! vtable, so anything implementing [`Trace`] can be rooted.

use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::ptr::null_mut;

use super::tracer::{Trace, Tracer};

pub struct ShadowStack {
    #[doc(hidden)]
    pub head: Cell<*mut RawShadowStackEntry>,
}

impl ShadowStack {
    pub fn new() -> ShadowStack {
        ShadowStack {
            head: Cell::new(null_mut()),
        }
    }

    /// Visit every rooted entry, newest first.
    pub fn trace(&self, trc: &mut dyn Tracer) {
        unsafe {
            let mut head = self.head.get();
            while !head.is_null() {
                let prev = (*head).prev;
                ((*head).trace_fn)((*head).data_start.as_mut_ptr(), trc);
                head = prev;
            }
        }
    }
}

impl Default for ShadowStack {
    fn default() -> Self {
        Self::new()
    }
}

#[repr(C)]
pub struct RawShadowStackEntry {
    stack: *mut ShadowStack,
    prev: *mut RawShadowStackEntry,
    trace_fn: unsafe fn(*mut u8, &mut dyn Tracer),
    data_start: [u8; 0],
}

unsafe fn trace_thunk<T: Trace>(data: *mut u8, trc: &mut dyn Tracer) {
    (*(data as *mut T)).trace(trc);
}

#[repr(C)]
pub struct RootedInternal<'a, T: Trace> {
    stack: &'a ShadowStack,
    prev: *mut RawShadowStackEntry,
    trace_fn: unsafe fn(*mut u8, &mut dyn Tracer),
    pub value: T,
}

impl<'a, T: Trace> RootedInternal<'a, T> {
    #[inline]
    pub unsafe fn construct(
        stack: &'a ShadowStack,
        prev: *mut RawShadowStackEntry,
        value: T,
    ) -> Self {
        Self {
            stack,
            prev,
            trace_fn: trace_thunk::<T>,
            value,
        }
    }
}

impl<T: Trace> Drop for RootedInternal<'_, T> {
    fn drop(&mut self) {
        self.stack.head.set(self.prev);
    }
}

/// A value rooted on the shadow stack. Constructed by [`letroot!`]; holding
/// one guarantees the collector sees the value on every root trace.
pub struct Rooted<'a, 'b, T: Trace> {
    #[doc(hidden)]
    pinned: Pin<&'a mut RootedInternal<'b, T>>,
}

impl<'a, 'b, T: Trace> Rooted<'a, 'b, T> {
    /// Only `letroot!` should call this.
    pub unsafe fn construct(pin: Pin<&'a mut RootedInternal<'b, T>>) -> Self {
        Self { pinned: pin }
    }

    pub fn get_copy(&self) -> T
    where
        T: Copy,
    {
        self.pinned.value
    }
}

impl<'a, T: Trace> Deref for Rooted<'a, '_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.pinned.value
    }
}

impl<'a, T: Trace> DerefMut for Rooted<'a, '_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut self.pinned.as_mut().get_unchecked_mut().value }
    }
}

/// Root a value on the shadow stack for the enclosing scope.
///
/// ```ignore
/// letroot!(obj = rt.shadow_stack(), rt.allocate_object(...)?);
/// ```
#[macro_export]
macro_rules! letroot {
    ($name:ident = $stack:expr, $value:expr) => {
        let stack: &$crate::gc::shadowstack::ShadowStack = $stack;
        let value = $value;
        #[allow(unused_mut)]
        let mut $name = unsafe {
            $crate::gc::shadowstack::RootedInternal::construct(stack, stack.head.get(), value)
        };
        stack.head.set(
            &mut $name as *mut _ as *mut $crate::gc::shadowstack::RawShadowStackEntry,
        );
        #[allow(unused_mut)]
        let mut $name =
            unsafe { $crate::gc::shadowstack::Rooted::construct(std::pin::Pin::new(&mut $name)) };
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::cell::CellHeader;
    use crate::gc::kinds::TraceKind;
    use crate::gc::tracer::TracerVariant;
    use crate::gc::value::Value;

    struct CountingTracer {
        cells: Vec<*mut CellHeader>,
    }

    impl Tracer for CountingTracer {
        fn variant(&self) -> TracerVariant {
            TracerVariant::Callback
        }
        fn on_edge(&mut self, slot: *mut *mut CellHeader, _kind: TraceKind, _name: &'static str) {
            unsafe { self.cells.push(*slot) }
        }
        // The fake cell pointers in these tests have no headers to inspect.
        fn on_value_edge(&mut self, slot: *mut Value, _name: &'static str) {
            unsafe {
                if let Some(cell) = (*slot).as_cell() {
                    self.cells.push(cell);
                }
            }
        }
    }

    #[test]
    fn rooted_values_are_traced_and_popped() {
        let stack = ShadowStack::new();
        let fake = 0x1000_0010 as *mut CellHeader;
        {
            letroot!(v = &stack, Value::cell(fake));
            let _ = &v;
            let mut trc = CountingTracer { cells: Vec::new() };
            stack.trace(&mut trc);
            assert_eq!(trc.cells, vec![fake]);
        }
        // Scope exit unroots.
        let mut trc = CountingTracer { cells: Vec::new() };
        stack.trace(&mut trc);
        assert!(trc.cells.is_empty());
    }

    #[test]
    fn nested_roots_trace_newest_first() {
        let stack = ShadowStack::new();
        let a = 0x1000_0010 as *mut CellHeader;
        let b = 0x1000_0020 as *mut CellHeader;
        letroot!(ra = &stack, Value::cell(a));
        letroot!(rb = &stack, Value::cell(b));
        let _ = (&ra, &rb);
        let mut trc = CountingTracer { cells: Vec::new() };
        stack.trace(&mut trc);
        assert_eq!(trc.cells, vec![b, a]);
    }

    #[test]
    fn non_cell_roots_are_skipped() {
        let stack = ShadowStack::new();
        letroot!(v = &stack, Value::int32(7));
        let _ = &v;
        let mut trc = CountingTracer { cells: Vec::new() };
        stack.trace(&mut trc);
        assert!(trc.cells.is_empty());
    }
}
