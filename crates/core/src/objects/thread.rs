//! `Thread`: an execution context's data (§3.2, §4.5). The bytecode
//! dispatch loop, call/return logic and coroutine resume/yield control
//! transfer that operate on this data live in `croc-runtime`; this module
//! only owns the state they operate on, so it can be walked by the
//! collector (marking the value stack, frames, open upvalues) without
//! depending on the interpreter.

use crate::handle::GcRef;
use crate::objects::class::ClassObj;
use crate::objects::function::{FunctionObj, UpvalueObj};
use crate::value::Value;

/// §4.5: the five states a thread (coroutine) cycles through. A
/// freshly-created thread starts `Initial`; `Dead` is terminal (a thread
/// never becomes schedulable again after its body returns, throws an
/// uncaught exception, or is explicitly closed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Initial,
    Running,
    Waiting,
    Suspended,
    Dead,
}

/// One activation record (§4.3 "Call/return protocol"). `base` is the
/// value-stack index of local slot 0 for this call.
#[derive(Debug, Clone)]
pub struct CallFrame {
    pub func: GcRef<FunctionObj>,
    pub base: u32,
    pub pc: u32,
    /// `None` means "propagate however many the callee leaves" (a tail
    /// position call); `Some(n)` truncates/pads to exactly `n` on return.
    pub nresults: Option<u32>,
    /// Absolute stack index of the first vararg overflow slot (§4.5
    /// "vararg-base"), i.e. `base + num_params`. Meaningless (equal to
    /// `base` with `vararg_count` 0) for a non-vararg callee.
    pub vararg_base: u32,
    /// How many argument values landed in the vararg region above
    /// `num_params` (§4.6 "vararg overflow collected into the vararg
    /// region").
    pub vararg_count: u32,
}

/// A pending `catch`/`finally` handler (§4.7 "Exception propagation").
#[derive(Debug, Clone, Copy)]
pub struct TryRecord {
    /// Index into the frame stack this handler was pushed in.
    pub frame_index: u32,
    /// Value-stack depth to unwind to before running the handler.
    pub stack_depth: u32,
    pub handler_pc: u32,
    pub is_finally: bool,
    /// Slot the caught exception value is written to before resuming at
    /// `handler_pc` (unused for `finally` records).
    pub exc_slot: u32,
    /// `None` for a `finally` record (matches anything); `Some(class)` for
    /// a `catch` record, matched against the thrown value's class chain
    /// (§4.7).
    pub catch_class: Option<GcRef<ClassObj>>,
}

/// Where a thread's last `Yield` wrote its arguments and how many resume
/// values it expects back (§4.5, §4.6 "Yield"). The resume values are
/// written here — at the exact slot the `Yield` instruction itself used —
/// so execution picks up after the yield as if it were an ordinary call
/// that just returned.
#[derive(Debug, Clone, Copy)]
pub struct PendingYield {
    pub abs_slot: u32,
    pub nresults: Option<u32>,
}

/// Which hook events (§6 "Debug hooks") this thread currently has armed.
#[derive(Debug, Clone, Copy, Default)]
pub struct HookMask {
    pub call: bool,
    pub ret: bool,
    pub line: bool,
    /// Fire the line hook only every Nth instruction rather than every
    /// line change; 0 disables the count-based hook entirely.
    pub instruction_count: u32,
}

#[derive(Debug)]
pub struct ThreadObj {
    pub state: ThreadState,
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    pub try_stack: Vec<TryRecord>,
    /// Open upvalues pointing into `stack`, kept sorted by stack index so
    /// closing on return can binary-search the suffix being popped.
    pub open_upvalues: Vec<GcRef<UpvalueObj>>,
    /// Results of the most recently completed call or yield, read by the
    /// resumer (§4.3, §4.5).
    pub results: Vec<Value>,
    pub hooks: HookMask,
    /// A single installed hook function and the instruction counter it
    /// fires against (§6 "Hook protocol").
    pub hook_fn: Option<Value>,
    /// Set while a hook is running, so hook dispatch points skip
    /// re-entering it (§6: "runs with hooks disabled recursively").
    pub in_hook: bool,
    pub instructions_run: u64,
    /// Where this thread resumes from — `None` for the VM's implicit main
    /// thread, `Some` for a coroutine explicitly resumed by a caller
    /// (§4.5: resume/yield nest LIFO, so only the immediate resumer
    /// matters).
    pub resumer: Option<GcRef<ThreadObj>>,
    /// The function a freshly-created (`Initial`) coroutine will run on
    /// its first resume (§4.5).
    pub coro_func: Option<GcRef<FunctionObj>>,
    /// Set by `unwind` when a `finally` record is entered while a raise is
    /// in flight; `EndFinally` re-raises it unless the finally block threw
    /// a new exception first, which simply overwrites this slot (§4.7).
    pub pending_rethrow: Option<Value>,
    /// Set by the embedder to request cooperative cancellation (§5); the
    /// interpreter checks this at every back-branch and call/return
    /// boundary and raises the uncatchable halt exception.
    pub halt_requested: bool,
    /// Set once a halt exception starts propagating on this thread; while
    /// true, `unwind` skips every `catch` record (halt "cannot be caught
    /// except by the VM itself", §4.7) but still runs `finally` blocks.
    /// Never cleared — a halting thread only ever reaches `Dead`.
    pub halting: bool,
    /// Set when this thread suspends on `Yield`; cleared (and its slot
    /// filled in) by the scheduler's next `resume` (§4.5).
    pub pending_yield: Option<PendingYield>,
    /// How many native (host) call frames are currently on this thread's
    /// Rust call stack (§4.5 "native-call depth counter"). The portable
    /// coroutine variant refuses to `yield` while this is nonzero — it has
    /// no way to suspend a Rust call stack frame — and raises a `StateError`
    /// instead (§4.8 "a portable variant that limits coroutines to script
    /// frames"). The extended, `may`-fiber-backed variant runs each
    /// coroutine on its own stackful green thread precisely to lift this
    /// restriction.
    pub native_call_depth: u32,
}

impl ThreadObj {
    pub fn new() -> Self {
        ThreadObj {
            state: ThreadState::Initial,
            stack: Vec::new(),
            frames: Vec::new(),
            try_stack: Vec::new(),
            open_upvalues: Vec::new(),
            results: Vec::new(),
            hooks: HookMask::default(),
            hook_fn: None,
            in_hook: false,
            instructions_run: 0,
            resumer: None,
            coro_func: None,
            pending_rethrow: None,
            halt_requested: false,
            halting: false,
            pending_yield: None,
            native_call_depth: 0,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.state == ThreadState::Dead
    }

    pub fn current_frame(&self) -> Option<&CallFrame> {
        self.frames.last()
    }

    pub fn current_frame_mut(&mut self) -> Option<&mut CallFrame> {
        self.frames.last_mut()
    }

    /// Find the open upvalue for absolute stack index `index`, per the
    /// "one open upvalue per captured slot" invariant (§4.4). The caller
    /// supplies a heap lookup since resolving a handle to its `UpvalueObj`
    /// requires the heap, which this module doesn't have access to.
    pub fn find_open_upvalue(
        &self,
        index: u32,
        open_index: impl Fn(GcRef<UpvalueObj>) -> Option<u32>,
    ) -> Option<GcRef<UpvalueObj>> {
        self.open_upvalues
            .iter()
            .copied()
            .find(|&u| open_index(u) == Some(index))
    }
}

impl Default for ThreadObj {
    fn default() -> Self {
        ThreadObj::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_thread_starts_initial_and_empty() {
        let t = ThreadObj::new();
        assert_eq!(t.state, ThreadState::Initial);
        assert!(t.stack.is_empty());
        assert!(t.frames.is_empty());
        assert!(t.current_frame().is_none());
    }
}
