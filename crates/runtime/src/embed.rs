//! The embedding API (§6): how a host opens a VM, registers native
//! functions, reads and writes globals, and calls into script code — all
//! through the same slot-based stack a native function sees when the
//! interpreter calls *it*, so every entry point here is also safe to call
//! from inside one.
//!
//! No teacher file grounds this directly — `navicore-cem3` has no
//! embedding layer of its own (Seq is driven by its own REPL/compiler
//! crates, out of scope here) — so this is built from §6 directly,
//! reusing `croc-core::vm::Vm`'s existing `alloc_*`/`pin`/`collect_*`
//! methods and `interpreter::call_sync` rather than inventing parallel
//! machinery.

use croc_core::error::NativeError;
use croc_core::objects::function::{FunctionObj, NativeFn};
use croc_core::objects::thread::ThreadObj;
use croc_core::objects::namespace::NamespaceObj;
use croc_core::ref_table::RefHandle;
use croc_core::{GcRef, Value, Vm};

use crate::exceptions::{self, ExceptionClasses};
use crate::interpreter::{self, Outcome};

/// An open VM plus its bootstrapped exception-class table (§7) — the
/// embedder always needs both, since `call`'s error path hands back a
/// thrown `Instance` of one of these classes.
pub struct CrocVm {
    pub vm: Vm,
    pub classes: ExceptionClasses,
}

impl CrocVm {
    /// `openVM` (§6). `gc_threshold` is the same knob `VmConfig::gc_threshold`
    /// surfaces; pass `VmConfig::from_env().gc_threshold` to respect
    /// `CROC_GC_THRESHOLD`.
    pub fn open(gc_threshold: usize) -> CrocVm {
        let mut vm = Vm::new(gc_threshold);
        let classes = exceptions::bootstrap(&mut vm);
        CrocVm { vm, classes }
    }

    /// The handle `openVM` returns in §6's telling — the main thread, the
    /// implicit execution context every embedder call operates on unless
    /// it explicitly resumes a coroutine.
    pub fn main_thread(&self) -> GcRef<ThreadObj> {
        self.vm.main_thread
    }

    /// `closeVM` (§6): drain pending finalizers, then drop everything.
    /// Finalizable objects caught in an unresolved cycle are a fatal
    /// condition per §4.2, surfaced here as a returned error rather than a
    /// panic so the host can at least log before aborting.
    pub fn close(mut self) -> Result<(), &'static str> {
        let stats = self.vm.collect_garbage();
        if stats.fatal_finalizer_cycle {
            return Err("finalizable object caught in an unresolved cycle");
        }
        Ok(())
    }

    /// A slot-based view onto `thread`'s value stack (§6).
    pub fn stack(&mut self, thread: GcRef<ThreadObj>) -> Stack<'_> {
        Stack { vm: &mut self.vm, thread }
    }

    /// Trigger a full collection regardless of `Heap::needs_collection`
    /// (§6 "trigger GC").
    pub fn collect_garbage(&mut self) {
        self.vm.collect_garbage();
    }

    /// Pin a value so it survives collection independent of any script
    /// reference reaching it (§6 "pin/unpin objects via a ref table").
    pub fn pin(&mut self, value: Value) -> RefHandle {
        self.vm.pin(value)
    }

    pub fn unpin(&mut self, handle: RefHandle) {
        self.vm.unpin(handle)
    }

    /// Look up a global by name (§6 "get globals").
    pub fn get_global(&mut self, name: &str) -> Option<Value> {
        let key = self.vm.heap.intern_string(name);
        self.vm.heap.get_namespace(self.vm.globals).get(key)
    }

    /// Bind a global by name (§6 "set globals").
    pub fn set_global(&mut self, name: &str, value: Value) {
        let key = self.vm.heap.intern_string(name);
        self.vm.heap.get_namespace_mut(self.vm.globals).set(key, value);
    }

    /// Create a namespace parented under `parent` (`None` parents it under
    /// nothing, a free-standing namespace the host attaches wherever it
    /// likes) (§6 "create namespaces").
    pub fn create_namespace(&mut self, name: &str, parent: Option<GcRef<NamespaceObj>>) -> GcRef<NamespaceObj> {
        let key = self.vm.heap.intern_string(name);
        self.vm.alloc_namespace(key, parent)
    }

    /// Register a native function under `name` in `namespace` (§6
    /// "register native functions"). The function's own upvalues, if any,
    /// must be supplied up front — native closures have no open/closed
    /// upvalue machinery (§3.2).
    pub fn register_native(
        &mut self,
        namespace: GcRef<NamespaceObj>,
        name: &str,
        func: NativeFn,
        upvals: Vec<Value>,
    ) {
        let func_obj = FunctionObj::Native { name: name.into(), func, upvals };
        let size = 32 + func_obj_upval_bytes(&func_obj);
        let handle = self.vm.heap.alloc(croc_core::heap::GcObject::Function(func_obj), size);
        let key = self.vm.heap.intern_string(name);
        self.vm.heap.get_namespace_mut(namespace).set(key, Value::Function(handle));
    }

    /// Call `func` with `args` on `thread`, to completion (§6 "call with N
    /// args expecting M results"). `Ok` carries every result value the
    /// callee left regardless of how many the caller "expected" — trimming
    /// or padding to a fixed arity is the caller's job, matching
    /// `CallFrame::nresults`'s own `None` ("propagate however many")
    /// convention when called this way. `Err` carries the thrown value
    /// uncaught past `func`'s own frame (§6 "catch exceptions").
    ///
    /// A `func` that itself yields rather than returning or throwing is
    /// reported as `Err` wrapping a `StateError` instance — `call` is a
    /// synchronous entry point; resuming a coroutine started this way is
    /// the `scheduler`/`fiber` modules' job, not this one's.
    pub fn call(
        &mut self,
        thread: GcRef<ThreadObj>,
        func: GcRef<FunctionObj>,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, Value> {
        match interpreter::call_sync(&mut self.vm, &self.classes, thread, func, args) {
            Outcome::Returned(values) => Ok(values),
            Outcome::Threw(exc) => Err(exc),
            Outcome::Yielded(_) => {
                let err = exceptions::instantiate(
                    &mut self.vm,
                    &self.classes,
                    NativeError::new(croc_core::error::ErrorKind::StateError, "call: callee yielded instead of returning"),
                );
                Err(err)
            }
        }
    }
}

fn func_obj_upval_bytes(func: &FunctionObj) -> usize {
    match func {
        FunctionObj::Native { upvals, .. } => upvals.len() * std::mem::size_of::<Value>(),
        FunctionObj::Script { .. } => 0,
    }
}

/// The slot-based stack view a native function and an embedder both see
/// (§6). Indices are relative to the current call's base, matching the
/// `NativeFn` call convention in `croc-core::objects::function` — slot 0
/// is the first argument.
pub struct Stack<'a> {
    vm: &'a mut Vm,
    thread: GcRef<ThreadObj>,
}

impl Stack<'_> {
    fn base(&self) -> usize {
        self.vm
            .heap
            .get_thread(self.thread)
            .current_frame()
            .map(|f| f.base as usize)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.vm.heap.get_thread(self.thread).stack.len() - self.base()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&mut self, value: Value) {
        self.vm.heap.get_thread_mut(self.thread).stack.push(value);
    }

    pub fn pop(&mut self) -> Option<Value> {
        let base = self.base();
        let t = self.vm.heap.get_thread_mut(self.thread);
        if t.stack.len() > base {
            t.stack.pop()
        } else {
            None
        }
    }

    /// Read slot `index`, relative to the current call's base (§6 "read
    /// values by slot index").
    pub fn get(&self, index: u32) -> Option<Value> {
        let abs = self.base() + index as usize;
        self.vm.heap.get_thread(self.thread).stack.get(abs).copied()
    }

    pub fn set(&mut self, index: u32, value: Value) {
        let abs = self.base() + index as usize;
        let t = self.vm.heap.get_thread_mut(self.thread);
        if abs >= t.stack.len() {
            t.stack.resize(abs + 1, Value::Null);
        }
        t.stack[abs] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use croc_core::error::ErrorKind;

    #[test]
    fn open_bootstraps_exception_classes_and_globals_round_trip() {
        let mut croc = CrocVm::open(1 << 20);
        croc.set_global("answer", Value::Int(42));
        assert_eq!(croc.get_global("answer"), Some(Value::Int(42)));
        assert!(croc.get_global("missing").is_none());
    }

    fn native_identity(_vm: &mut Vm, thread: GcRef<ThreadObj>, nargs: u32) -> Result<u32, NativeError> {
        let _ = (thread, nargs);
        Ok(0)
    }

    #[test]
    fn register_native_installs_a_function_value_under_its_name() {
        let mut croc = CrocVm::open(1 << 20);
        let ns = croc.vm.globals;
        croc.register_native(ns, "identity", native_identity, Vec::new());
        let looked_up = croc.get_global("identity");
        assert!(matches!(looked_up, Some(Value::Function(_))));
    }

    #[test]
    fn calling_a_native_that_throws_surfaces_as_err() {
        let mut croc = CrocVm::open(1 << 20);
        fn native_fails(vm: &mut Vm, _thread: GcRef<ThreadObj>, _nargs: u32) -> Result<u32, NativeError> {
            let _ = vm;
            Err(NativeError::new(ErrorKind::ValueError, "always fails"))
        }
        let ns = croc.vm.globals;
        croc.register_native(ns, "boom", native_fails, Vec::new());
        let func = match croc.get_global("boom") {
            Some(Value::Function(f)) => f,
            _ => panic!("expected a registered function"),
        };
        let thread = croc.main_thread();
        let result = croc.call(thread, func, Vec::new());
        assert!(result.is_err());
    }
}
