//! `Function` / `FuncDef` / `Upvalue` (§3.2, §4.4).
//!
//! A `FuncDef` is the immutable compiled body the (out-of-scope) bytecode
//! emitter hands us. Closing it over a set of upvalues and an environment
//! produces a `Function`. Cacheable `FuncDef`s (no free upvalues) cache the
//! one `Function` they ever need to produce.

use std::cell::Cell;

use crate::bytecode::FuncDef;
use crate::error::NativeError;
use crate::handle::GcRef;
use crate::objects::namespace::NamespaceObj;
use crate::objects::thread::ThreadObj;
use crate::value::Value;
use crate::vm::Vm;

#[derive(Debug)]
pub struct FuncDefObj {
    pub def: FuncDef,
    /// Populated the first time a cacheable `FuncDef` is closed (§4.4:
    /// "closing a cacheable FuncDef a second time returns the cached
    /// Function").
    pub cached_closure: Cell<Option<GcRef<FunctionObj>>>,
    /// One slot per `def.inner` entry, populated the first time a
    /// `Closure` instruction materializes that inner `FuncDef` into a
    /// heap object. A `FuncDef`'s identity must be stable across repeated
    /// execution of the same `Closure` instruction (e.g. a closure
    /// created inside a loop body) for `cached_closure` above to ever
    /// observe a hit — allocating a fresh `FuncDefObj` on every visit, as
    /// an earlier version of this module did, defeats the cache before it
    /// can do anything.
    pub inner_handles: Vec<Cell<Option<GcRef<FuncDefObj>>>>,
}

impl FuncDefObj {
    pub fn new(def: FuncDef) -> Self {
        let inner_handles = (0..def.inner.len()).map(|_| Cell::new(None)).collect();
        FuncDefObj {
            def,
            cached_closure: Cell::new(None),
            inner_handles,
        }
    }

    pub fn is_cacheable(&self) -> bool {
        self.def.is_cacheable()
    }
}

/// A host function pointer taking the VM, the calling thread, and the
/// argument count (Glossary: "Native function"). Arguments live on the
/// thread's stack window above the call frame's base; the function
/// returns how many result values it pushed, or a raw error.
pub type NativeFn = fn(&mut Vm, GcRef<ThreadObj>, u32) -> Result<u32, NativeError>;

#[derive(Debug)]
pub enum FunctionObj {
    Native {
        name: Box<str>,
        func: NativeFn,
        /// Upvalues a native function closes over are stored inline as
        /// plain values (§3.2): natives have no open/closed distinction.
        upvals: Vec<Value>,
    },
    Script {
        funcdef: GcRef<FuncDefObj>,
        upvals: Vec<GcRef<UpvalueObj>>,
        env: GcRef<NamespaceObj>,
    },
}

impl FunctionObj {
    pub fn name<'a>(&'a self, funcdefs: impl FnOnce(GcRef<FuncDefObj>) -> &'a str) -> &'a str {
        match self {
            FunctionObj::Native { name, .. } => name,
            FunctionObj::Script { funcdef, .. } => funcdefs(*funcdef),
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, FunctionObj::Native { .. })
    }
}

/// A closed-over variable cell (§3.2, §4.4 Glossary).
///
/// Open: `slot` indexes into `thread`'s value stack at an absolute index.
/// Closed: the value has been copied out into `closed` and the upvalue no
/// longer depends on the owning thread's stack being alive.
#[derive(Debug)]
pub struct UpvalueObj {
    pub thread: GcRef<ThreadObj>,
    state: Cell<UpvalState>,
}

#[derive(Debug, Clone, Copy)]
enum UpvalState {
    Open(u32),
    Closed(Value),
}

impl UpvalueObj {
    pub fn open(thread: GcRef<ThreadObj>, stack_index: u32) -> Self {
        UpvalueObj {
            thread,
            state: Cell::new(UpvalState::Open(stack_index)),
        }
    }

    /// Build an already-closed cell, e.g. when the graph deserializer
    /// rebuilds a closure whose captured values came straight off the
    /// wire rather than out of a live stack. `thread` is never consulted
    /// for a closed cell, so the caller may pass any valid handle.
    pub fn closed(thread: GcRef<ThreadObj>, value: Value) -> Self {
        UpvalueObj {
            thread,
            state: Cell::new(UpvalState::Closed(value)),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state.get(), UpvalState::Open(_))
    }

    pub fn open_index(&self) -> Option<u32> {
        match self.state.get() {
            UpvalState::Open(i) => Some(i),
            UpvalState::Closed(_) => None,
        }
    }

    /// Read the cell's current value. For an open upvalue the caller must
    /// supply the thread's current stack (since the cell lives there).
    pub fn get(&self, stack: &[Value]) -> Value {
        match self.state.get() {
            UpvalState::Open(i) => stack[i as usize],
            UpvalState::Closed(v) => v,
        }
    }

    pub fn set(&self, stack: &mut [Value], value: Value) {
        match self.state.get() {
            UpvalState::Open(i) => stack[i as usize] = value,
            UpvalState::Closed(_) => self.state.set(UpvalState::Closed(value)),
        }
    }

    /// Detach from the stack, copying the current value into owned
    /// storage (§4.4: "closed by copying the pointed-to value").
    pub fn close(&self, stack: &[Value]) {
        if let UpvalState::Open(i) = self.state.get() {
            self.state.set(UpvalState::Closed(stack[i as usize]));
        }
    }
}
