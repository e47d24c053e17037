//! Umbra is the garbage collector core of a JavaScript-like runtime: an
//! incremental, generational, compacting mark-and-sweep collector over a heap
//! of small fixed-kind cells.
//!
//! The embedding (interpreter, JIT, parser) is expected to:
//! - allocate through [`runtime::GcRuntime::allocate_object`] and friends;
//! - root every cell it holds across a possible GC with [`letroot!`] or a
//!   persistent root;
//! - invoke the write barriers on every slot write (the typed slot setters in
//!   [`gc::cells`] do this for you).
#![allow(clippy::missing_safety_doc)]

#[macro_use]
pub mod gc;
pub mod options;

pub use gc::runtime::GcRuntime;
pub use options::{GcParams, ZealMode};
