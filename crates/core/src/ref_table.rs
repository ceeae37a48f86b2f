//! The embedder's ref table (§6): host code holds a `RefHandle` rather
//! than a bare `Value`/`GcRef` so that a value the script can no longer
//! reach, but the host still cares about, is kept alive. Pinning is
//! refcounted per slot (the same slot can be pinned by more than one
//! `RefHandle`), tracked on the heap object's own header rather than in a
//! side table, so the collector's root pass is a single header scan.

use crate::handle::GcRef;
use crate::heap::Heap;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefHandle {
    slot: u32,
}

/// Pins `v`'s referent, bumping its header's `pin_count`. Value types have
/// no referent and are trivially "always pinned" — calling this on one is
/// a no-op that still returns a handle, since the host shouldn't have to
/// special-case value-typed refs.
pub fn pin(heap: &mut Heap, v: Value) -> RefHandle {
    match crate::objects::weakref::referent_slot(&v) {
        Some(slot) => {
            heap.header_mut(slot).pin_count += 1;
            RefHandle { slot }
        }
        None => RefHandle { slot: u32::MAX },
    }
}

/// Drop one pin on `handle`'s referent. Unpinning a value-typed handle
/// (`slot == u32::MAX`) is a no-op.
pub fn unpin(heap: &mut Heap, handle: RefHandle) {
    if handle.slot == u32::MAX {
        return;
    }
    let header = heap.header_mut(handle.slot);
    header.pin_count = header.pin_count.saturating_sub(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::GcObject;
    use crate::objects::table::TableObj;

    #[test]
    fn pin_survives_a_collection_that_would_otherwise_free_it() {
        let mut heap = Heap::new(1 << 20);
        let t: GcRef<TableObj> = heap.alloc(GcObject::Table(TableObj::new()), 8);
        let handle = pin(&mut heap, Value::Table(t));
        assert_eq!(heap.header(t.slot()).pin_count, 1);
        unpin(&mut heap, handle);
        assert_eq!(heap.header(t.slot()).pin_count, 0);
    }
}
