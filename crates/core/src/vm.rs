//! `Vm`: the aggregate the embedding API opens and closes (§6). Bundles
//! the heap, collector, global/registry namespaces, per-type metatables
//! and the ref table — everything a native function or the interpreter
//! needs reach into that isn't specific to one executing thread.
//!
//! The bytecode dispatch loop, exception unwinding and coroutine
//! scheduling that drive a `Vm` forward live in `croc-runtime`; this type
//! is deliberately just the shared state they all operate on, so the
//! collector can be exercised and tested without a bytecode interpreter
//! in the loop.

use std::collections::HashMap;

use crate::allocator::{HostAlloc, SystemAlloc};
use crate::gc::{Collector, GcStats, Roots};
use crate::handle::GcRef;
use crate::heap::{GcObject, Heap};
use crate::objects::array::ArrayObj;
use crate::objects::class::ClassObj;
use crate::objects::instance::InstanceObj;
use crate::objects::namespace::NamespaceObj;
use crate::objects::nativeobj::NativeObjData;
use crate::objects::strings::StringObj;
use crate::objects::table::TableObj;
use crate::objects::thread::ThreadObj;
use crate::ref_table::{self, RefHandle};
use crate::value::{Value, ValueTag};

pub struct Vm {
    pub heap: Heap,
    collector: Collector,
    pub globals: GcRef<NamespaceObj>,
    pub registry: GcRef<NamespaceObj>,
    pub main_thread: GcRef<ThreadObj>,
    metatables: HashMap<ValueTag, GcRef<ClassObj>>,
    threads: Vec<GcRef<ThreadObj>>,
    alloc_hook: Box<dyn HostAlloc>,
    pub gc_stats: GcStatsSummary,
}

#[derive(Debug, Default, Clone)]
pub struct GcStatsSummary {
    pub collections: u64,
    pub slots_freed: usize,
    pub finalizers_pending: usize,
    pub fatal_finalizer_cycle: bool,
}

impl Vm {
    pub fn new(gc_threshold: usize) -> Self {
        Vm::with_alloc_hook(gc_threshold, Box::new(SystemAlloc::default()))
    }

    pub fn with_alloc_hook(gc_threshold: usize, alloc_hook: Box<dyn HostAlloc>) -> Self {
        let mut heap = Heap::new(gc_threshold);

        let root_name = heap.intern_string("");
        let globals_name = heap.intern_string("_G");
        let registry_name = heap.intern_string("_R");
        let globals = heap.alloc(
            GcObject::Namespace(NamespaceObj::new(globals_name, None)),
            64,
        );
        let registry = heap.alloc(
            GcObject::Namespace(NamespaceObj::new(registry_name, None)),
            64,
        );
        let main_thread = heap.alloc(GcObject::Thread(ThreadObj::new()), 256);
        let _ = root_name;

        Vm {
            heap,
            collector: Collector::new(),
            globals,
            registry,
            main_thread,
            metatables: HashMap::new(),
            threads: vec![main_thread],
            alloc_hook,
            gc_stats: GcStatsSummary::default(),
        }
    }

    pub fn alloc_table(&mut self) -> GcRef<TableObj> {
        self.heap.alloc(GcObject::Table(TableObj::new()), 32)
    }

    pub fn alloc_array(&mut self, values: Vec<Value>) -> GcRef<ArrayObj> {
        let size = 16 + values.len() * std::mem::size_of::<Value>();
        self.heap
            .alloc(GcObject::Array(ArrayObj::from_values(values)), size)
    }

    pub fn alloc_namespace(
        &mut self,
        name: GcRef<StringObj>,
        parent: Option<GcRef<NamespaceObj>>,
    ) -> GcRef<NamespaceObj> {
        self.heap
            .alloc(GcObject::Namespace(NamespaceObj::new(name, parent)), 64)
    }

    pub fn alloc_class(
        &mut self,
        name: GcRef<StringObj>,
        parent: Option<GcRef<ClassObj>>,
    ) -> GcRef<ClassObj> {
        self.heap
            .alloc(GcObject::Class(ClassObj::new(name, parent)), 96)
    }

    pub fn alloc_instance(&mut self, instance: InstanceObj) -> GcRef<InstanceObj> {
        self.heap.alloc(GcObject::Instance(instance), 64)
    }

    pub fn alloc_native_obj(&mut self, data: NativeObjData) -> GcRef<NativeObjData> {
        self.heap.alloc(GcObject::NativeObj(data), 32)
    }

    /// Spawn a fresh, unstarted coroutine thread and register it as a GC
    /// root (§4.5: a thread remains a root for as long as anything keeps
    /// resuming it, tracked here by simple membership rather than
    /// requiring every resumer to also hold a `Value::Thread`).
    pub fn spawn_thread(&mut self) -> GcRef<ThreadObj> {
        let handle = self.heap.alloc(GcObject::Thread(ThreadObj::new()), 256);
        self.threads.push(handle);
        handle
    }

    pub fn retire_thread(&mut self, thread: GcRef<ThreadObj>) {
        self.threads.retain(|t| *t != thread);
    }

    /// Live, GC-rooted thread count (§4.5), surfaced by the diagnostics
    /// dump rather than exposing the root set itself.
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn metatable(&self, tag: ValueTag) -> Option<GcRef<ClassObj>> {
        self.metatables.get(&tag).copied()
    }

    pub fn set_metatable(&mut self, tag: ValueTag, class: GcRef<ClassObj>) {
        self.metatables.insert(tag, class);
    }

    pub fn pin(&mut self, value: Value) -> RefHandle {
        ref_table::pin(&mut self.heap, value)
    }

    pub fn unpin(&mut self, handle: RefHandle) {
        ref_table::unpin(&mut self.heap, handle);
    }

    pub fn should_collect(&self) -> bool {
        self.heap.needs_collection()
    }

    /// Run one full collection (§4.2). Threads whose handle the embedder
    /// still wants alive must be registered via `spawn_thread`/tracked in
    /// `self.threads`; anything else is GC'd as expected.
    pub fn collect_garbage(&mut self) -> GcStats {
        let namespaces = [self.globals, self.registry];
        let classes: Vec<GcRef<ClassObj>> = self.metatables.values().copied().collect();
        let roots = Roots {
            namespaces: &namespaces,
            classes: &classes,
            threads: &self.threads,
        };
        let stats = self.collector.collect(&mut self.heap, &roots);
        self.gc_stats.collections = stats.collections;
        self.gc_stats.slots_freed += stats.slots_freed;
        self.gc_stats.finalizers_pending = stats.finalizers_queued;
        self.gc_stats.fatal_finalizer_cycle = stats.fatal_finalizer_cycle;
        self.alloc_hook.on_free(stats.slots_freed);
        stats
    }

    /// Mark an instance as having had its finalizer run (§4.2: "resurrected
    /// exactly once"); called by `croc-runtime`'s finalizer-queue drain
    /// after invoking the instance's `finalizer` method. A subsequent
    /// collection that finds it still unreachable frees it normally.
    pub fn mark_finalized(&mut self, instance: GcRef<InstanceObj>) {
        self.heap.get_instance_mut(instance).finalized = true;
    }

    pub fn collect_if_needed(&mut self) -> Option<GcStats> {
        if self.should_collect() {
            Some(self.collect_garbage())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_vm_has_distinct_globals_and_registry() {
        let vm = Vm::new(1 << 20);
        assert_ne!(vm.globals.slot(), vm.registry.slot());
    }

    #[test]
    fn unreachable_table_is_collected() {
        let mut vm = Vm::new(1 << 20);
        let t = vm.alloc_table();
        let before = vm.heap.len();
        let stats = vm.collect_garbage();
        assert!(stats.slots_freed >= 1);
        assert!(vm.heap.len() <= before);
        let _ = t;
    }

    #[test]
    fn pinned_table_survives_collection() {
        let mut vm = Vm::new(1 << 20);
        let t = vm.alloc_table();
        let handle = vm.pin(Value::Table(t));
        vm.collect_garbage();
        assert_eq!(vm.heap.get_table(t).len(), 0);
        vm.unpin(handle);
    }
}
