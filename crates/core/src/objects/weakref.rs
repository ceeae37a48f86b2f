//! Weak references (§3.2, §4.2, §4.3).
//!
//! A `WeakRefObj` is the only way one reference object weakly points to
//! another. It is uniqued per referent by [`WeakRefTable`]: asking for a
//! weak reference to an object that already has one returns the existing
//! `WeakRefObj` rather than allocating a second one.

use std::cell::Cell;
use std::collections::HashMap;

use crate::handle::GcRef;
use crate::value::Value;

#[derive(Debug)]
pub struct WeakRefObj {
    /// `None` once the GC has proven the referent unreachable (testable
    /// property 5d): `deref()` returns null thereafter.
    target: Cell<Option<Value>>,
}

impl WeakRefObj {
    pub(crate) fn new(target: Value) -> Self {
        WeakRefObj {
            target: Cell::new(Some(target)),
        }
    }

    pub fn deref(&self) -> Option<Value> {
        self.target.get()
    }

    /// Called by the GC after marking, before sweeping, for every weak ref
    /// whose referent turned out white (§4.2).
    pub(crate) fn clear(&self) {
        self.target.set(None);
    }

    pub(crate) fn is_live(&self) -> bool {
        self.target.get().is_some()
    }
}

/// Keys by referent identity (the referent's heap slot), independent of
/// which reference-type variant it is.
#[derive(Default)]
pub struct WeakRefTable {
    by_referent: HashMap<u32, GcRef<WeakRefObj>>,
}

impl WeakRefTable {
    pub fn new() -> Self {
        WeakRefTable::default()
    }

    pub fn lookup(&self, referent_slot: u32) -> Option<GcRef<WeakRefObj>> {
        self.by_referent.get(&referent_slot).copied()
    }

    pub(crate) fn register(&mut self, referent_slot: u32, handle: GcRef<WeakRefObj>) {
        self.by_referent.insert(referent_slot, handle);
    }

    pub(crate) fn remove(&mut self, referent_slot: u32) {
        self.by_referent.remove(&referent_slot);
    }

    pub fn len(&self) -> usize {
        self.by_referent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_referent.is_empty()
    }
}

/// Extract the referent's heap slot from a reference-typed `Value`, used
/// by the table above as the uniquing key. Returns `None` for value
/// types, which cannot be weakly referenced in the first place.
pub fn referent_slot(v: &Value) -> Option<u32> {
    use Value::*;
    match v {
        Null | Bool(_) | Int(_) | Float(_) => None,
        NativeObj(r) => Some(r.slot()),
        String(r) => Some(r.slot()),
        WeakRef(r) => Some(r.slot()),
        Table(r) => Some(r.slot()),
        Namespace(r) => Some(r.slot()),
        Array(r) => Some(r.slot()),
        Memblock(r) => Some(r.slot()),
        Function(r) => Some(r.slot()),
        FuncDef(r) => Some(r.slot()),
        Class(r) => Some(r.slot()),
        Instance(r) => Some(r.slot()),
        Thread(r) => Some(r.slot()),
        Upvalue(r) => Some(r.slot()),
    }
}
