//! The managed heap: a single arena of GC-owned objects, addressed by
//! typed [`GcRef`] handles (§4.1, §4.2).
//!
//! Grounded in loxido's `Allocator`/`Reference<T>` pair, generalized from
//! `Box<dyn Any>` + downcast to a single closed [`GcObject`] enum: every
//! heap kind Croc has is known ahead of time, so a closed enum gives us
//! exhaustive, panic-free access instead of a fallible downcast.

use crate::handle::GcRef;
use crate::objects::array::ArrayObj;
use crate::objects::class::ClassObj;
use crate::objects::function::{FuncDefObj, FunctionObj, UpvalueObj};
use crate::objects::instance::InstanceObj;
use crate::objects::memblock::MemblockObj;
use crate::objects::namespace::NamespaceObj;
use crate::objects::nativeobj::NativeObjData;
use crate::objects::strings::{self, StringObj, StringTable};
use crate::objects::table::TableObj;
use crate::objects::thread::ThreadObj;
use crate::objects::weakref::{self, WeakRefObj, WeakRefTable};
use crate::value::{Value, ValueTag};

/// Tri-color mark used by the incremental collector (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    White,
    Gray,
    Black,
}

/// Per-object bookkeeping the collector needs, stored alongside the
/// payload rather than inside it so tracing code doesn't need a method on
/// every object kind just to read its color.
#[derive(Debug)]
pub struct GcHeader {
    pub color: Color,
    /// Root reference count for objects pinned by the embedder's ref table
    /// (§6) — nonzero pins this object regardless of reachability.
    pub pin_count: u32,
    /// Set once this object has been queued for finalization; prevents a
    /// resurrected-then-unreachable-again object from finalizing twice
    /// (§4.2).
    pub finalized: bool,
}

impl GcHeader {
    fn new() -> Self {
        GcHeader {
            color: Color::White,
            pin_count: 0,
            finalized: false,
        }
    }
}

/// Every kind of object the heap can hold, closed over at compile time.
pub enum GcObject {
    String(StringObj),
    WeakRef(WeakRefObj),
    Table(TableObj),
    Namespace(NamespaceObj),
    Array(ArrayObj),
    Memblock(MemblockObj),
    Function(FunctionObj),
    FuncDef(FuncDefObj),
    Class(ClassObj),
    Instance(InstanceObj),
    Thread(ThreadObj),
    Upvalue(UpvalueObj),
    NativeObj(NativeObjData),
    /// A slot emptied by sweep, kept in the free list for reuse.
    Free { next_free: Option<u32> },
}

impl GcObject {
    pub fn tag(&self) -> Option<ValueTag> {
        match self {
            GcObject::String(_) => Some(ValueTag::String),
            GcObject::WeakRef(_) => Some(ValueTag::WeakRef),
            GcObject::Table(_) => Some(ValueTag::Table),
            GcObject::Namespace(_) => Some(ValueTag::Namespace),
            GcObject::Array(_) => Some(ValueTag::Array),
            GcObject::Memblock(_) => Some(ValueTag::Memblock),
            GcObject::Function(_) => Some(ValueTag::Function),
            GcObject::FuncDef(_) => Some(ValueTag::FuncDef),
            GcObject::Class(_) => Some(ValueTag::Class),
            GcObject::Instance(_) => Some(ValueTag::Instance),
            GcObject::Thread(_) => Some(ValueTag::Thread),
            GcObject::Upvalue(_) => Some(ValueTag::Upvalue),
            GcObject::NativeObj(_) => Some(ValueTag::NativeObj),
            GcObject::Free { .. } => None,
        }
    }
}

struct Slot {
    object: GcObject,
    header: GcHeader,
}

/// The managed heap. Owns every `GcObject`, the string intern table and
/// the weak-reference table (both of which only make sense relative to a
/// single heap's object identities).
#[derive(Default)]
pub struct Heap {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    pub strings: StringTable,
    pub weak_refs: WeakRefTable,
    pub bytes_allocated: usize,
    pub gc_threshold: usize,
}

impl Heap {
    pub fn new(gc_threshold: usize) -> Self {
        Heap {
            slots: Vec::new(),
            free_head: None,
            strings: StringTable::new(),
            weak_refs: WeakRefTable::new(),
            bytes_allocated: 0,
            gc_threshold,
        }
    }

    fn alloc_slot(&mut self, object: GcObject, size: usize) -> u32 {
        self.bytes_allocated += size;
        if let Some(free) = self.free_head {
            let slot = &mut self.slots[free as usize];
            let next_free = match slot.object {
                GcObject::Free { next_free } => next_free,
                _ => unreachable!("free list points at a live slot"),
            };
            self.free_head = next_free;
            slot.object = object;
            slot.header = GcHeader::new();
            free
        } else {
            self.slots.push(Slot {
                object,
                header: GcHeader::new(),
            });
            (self.slots.len() - 1) as u32
        }
    }

    pub fn alloc<T>(&mut self, object: GcObject, size: usize) -> GcRef<T> {
        GcRef::new(self.alloc_slot(object, size))
    }

    pub fn needs_collection(&self) -> bool {
        self.bytes_allocated >= self.gc_threshold
    }

    pub fn header(&self, slot: u32) -> &GcHeader {
        &self.slots[slot as usize].header
    }

    pub fn header_mut(&mut self, slot: u32) -> &mut GcHeader {
        &mut self.slots[slot as usize].header
    }

    pub fn object(&self, slot: u32) -> &GcObject {
        &self.slots[slot as usize].object
    }

    pub fn object_mut(&mut self, slot: u32) -> &mut GcObject {
        &mut self.slots[slot as usize].object
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Intern `s`, allocating a fresh `StringObj` only if no live string
    /// with this content exists yet (§3.2 "at most one live String").
    pub fn intern_string(&mut self, s: &str) -> GcRef<StringObj> {
        if let Some(existing) = self.strings.lookup(s) {
            return existing;
        }
        let size = s.len() + std::mem::size_of::<StringObj>();
        let obj = strings::build_string_obj(s.into());
        let handle = self.alloc(GcObject::String(obj), size);
        self.strings.register(s, handle);
        handle
    }

    pub fn get_string(&self, r: GcRef<StringObj>) -> &StringObj {
        match self.object(r.slot()) {
            GcObject::String(s) => s,
            _ => unreachable!("GcRef<StringObj> pointed at a non-string slot"),
        }
    }

    /// Return the existing weak ref to `target`'s referent, or allocate a
    /// fresh one (§4.3 uniquing).
    pub fn weak_ref_to(&mut self, target: Value) -> Option<GcRef<WeakRefObj>> {
        let slot = weakref::referent_slot(&target)?;
        if let Some(existing) = self.weak_refs.lookup(slot) {
            return Some(existing);
        }
        let obj = WeakRefObj::new(target);
        let handle = self.alloc(GcObject::WeakRef(obj), std::mem::size_of::<WeakRefObj>());
        self.weak_refs.register(slot, handle);
        Some(handle)
    }

    /// Free a slot, unlinking it into the free list. Callers (the sweep
    /// phase) are responsible for having already run finalizers and
    /// cleared any intern/weak-ref table entries pointing at it.
    pub(crate) fn free_slot(&mut self, slot_index: u32, size: usize) {
        let slot = &mut self.slots[slot_index as usize];
        slot.object = GcObject::Free {
            next_free: self.free_head,
        };
        self.free_head = Some(slot_index);
        self.bytes_allocated = self.bytes_allocated.saturating_sub(size);
    }
}

macro_rules! typed_accessors {
    ($get:ident, $get_mut:ident, $variant:ident, $ty:ty) => {
        impl Heap {
            pub fn $get(&self, r: GcRef<$ty>) -> &$ty {
                match self.object(r.slot()) {
                    GcObject::$variant(v) => v,
                    _ => unreachable!(concat!(
                        "GcRef<",
                        stringify!($ty),
                        "> pointed at a mismatched slot"
                    )),
                }
            }

            pub fn $get_mut(&mut self, r: GcRef<$ty>) -> &mut $ty {
                match self.object_mut(r.slot()) {
                    GcObject::$variant(v) => v,
                    _ => unreachable!(concat!(
                        "GcRef<",
                        stringify!($ty),
                        "> pointed at a mismatched slot"
                    )),
                }
            }
        }
    };
}

typed_accessors!(get_table, get_table_mut, Table, TableObj);
typed_accessors!(get_namespace, get_namespace_mut, Namespace, NamespaceObj);
typed_accessors!(get_array, get_array_mut, Array, ArrayObj);
typed_accessors!(get_memblock, get_memblock_mut, Memblock, MemblockObj);
typed_accessors!(get_function, get_function_mut, Function, FunctionObj);
typed_accessors!(get_funcdef, get_funcdef_mut, FuncDef, FuncDefObj);
typed_accessors!(get_class, get_class_mut, Class, ClassObj);
typed_accessors!(get_instance, get_instance_mut, Instance, InstanceObj);
typed_accessors!(get_thread, get_thread_mut, Thread, ThreadObj);
typed_accessors!(get_upvalue, get_upvalue_mut, Upvalue, UpvalueObj);
typed_accessors!(get_weak_ref, get_weak_ref_mut, WeakRef, WeakRefObj);
typed_accessors!(get_native_obj, get_native_obj_mut, NativeObj, NativeObjData);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_same_content_returns_same_handle() {
        let mut heap = Heap::new(1 << 20);
        let a = heap.intern_string("hello");
        let b = heap.intern_string("hello");
        assert_eq!(a, b);
        assert_eq!(heap.strings.len(), 1);
    }

    #[test]
    fn weak_ref_to_same_referent_is_uniqued() {
        let mut heap = Heap::new(1 << 20);
        let s = heap.intern_string("x");
        let w1 = heap.weak_ref_to(Value::String(s)).unwrap();
        let w2 = heap.weak_ref_to(Value::String(s)).unwrap();
        assert_eq!(w1, w2);
    }

    #[test]
    fn free_slot_is_reused_by_next_alloc() {
        let mut heap = Heap::new(1 << 20);
        let a: GcRef<TableObj> = heap.alloc(GcObject::Table(TableObj::new()), 8);
        heap.free_slot(a.slot(), 8);
        let b: GcRef<TableObj> = heap.alloc(GcObject::Table(TableObj::new()), 8);
        assert_eq!(a.slot(), b.slot());
    }
}
