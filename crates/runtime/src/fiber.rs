//! The "extended" coroutine variant (§4.5, §4.8, §5): a `ThreadObj` whose
//! interpreter loop runs on its own stackful `may::coroutine` rather than
//! directly on the resumer's Rust call stack.
//!
//! `scheduler::resume` drives a target thread synchronously, on the
//! caller's own stack — fine as long as nothing a native function calls
//! ever blocks. A fiber-backed thread gets its own OS-level stack, so a
//! native function that parks on a `may`-aware primitive (a channel recv,
//! `may::coroutine::yield_now`) suspends the whole fiber without
//! unwinding back through `Outcome::Yielded` first. That's the one thing
//! the portable scheduler in `scheduler.rs` cannot do: yield to another
//! coroutine from underneath a native call frame.
//!
//! `Vm` is not `Sync` and nothing here makes it one — the handshake below
//! is strictly synchronous (the driver blocks on `outcome_rx.recv()`
//! immediately after every send), so exactly one fiber ever touches a
//! given `Vm` at a time, the same one-thread-running-at-once discipline
//! `scheduler::resume` enforces for the portable variant. `may`'s
//! work-stealing pool (`rand_work_steal`) may run fibers on any of its
//! worker threads, but never two at once against the same `Vm`.

use may::coroutine;
use may::sync::mpsc;

use croc_core::objects::function::FunctionObj;
use croc_core::objects::thread::ThreadObj;
use croc_core::{GcRef, Value, Vm};

use crate::exceptions::ExceptionClasses;
use crate::interpreter::{self, Outcome};

/// A message sent into a parked fiber to wake it back up.
enum Resume {
    Start(Vec<Value>),
    Continue(Vec<Value>),
}

/// A running or parked extended coroutine. Dropping a `Fiber` that hasn't
/// finished leaks its `may::coroutine` — callers are expected to drive it
/// to `Outcome::Returned`/`Outcome::Threw` or abandon the whole `Vm`.
pub struct Fiber {
    resume_tx: mpsc::Sender<Resume>,
    outcome_rx: mpsc::Receiver<Outcome>,
}

/// `Vm`/`GcRef` carry no thread-safety markers of their own; this wrapper
/// asserts the single-fiber-at-a-time discipline the module doc above
/// describes, which is what actually makes sending them across the fiber
/// boundary sound.
struct SendPtr<T>(*mut T);
unsafe impl<T> Send for SendPtr<T> {}

impl Fiber {
    /// Spawn `thread` (already created via `scheduler::create`) onto its
    /// own fiber, with `stack_size` bytes of stack (`VmConfig::stack_reserve`).
    /// The fiber parks immediately, waiting for the first `start` call.
    pub fn spawn(
        vm: *mut Vm,
        classes: ExceptionClasses,
        thread: GcRef<ThreadObj>,
        func: GcRef<FunctionObj>,
        stack_size: usize,
    ) -> Fiber {
        let (resume_tx, resume_rx) = mpsc::channel::<Resume>();
        let (outcome_tx, outcome_rx) = mpsc::channel::<Outcome>();
        let vm_ptr = SendPtr(vm);

        let builder = coroutine::Builder::new().stack_size(stack_size.max(4096));
        // Safety: `vm_ptr` is only dereferenced after `resume_rx.recv()`
        // returns, i.e. after the driver has sent a message and is
        // blocked on `outcome_rx.recv()` — it touches nothing on `vm`
        // concurrently with the fiber.
        let _ = builder.spawn(move || {
            let vm_ptr = vm_ptr;
            while let Ok(msg) = resume_rx.recv() {
                let vm = unsafe { &mut *vm_ptr.0 };
                match msg {
                    Resume::Start(args) => {
                        interpreter::start_coroutine(vm, thread, func, args);
                    }
                    Resume::Continue(args) => {
                        interpreter::prepare_resume(vm, thread, args);
                    }
                }
                let outcome = interpreter::run(vm, &classes, thread);
                let done = !matches!(outcome, Outcome::Yielded(_));
                if outcome_tx.send(outcome).is_err() || done {
                    break;
                }
            }
        });

        Fiber { resume_tx, outcome_rx }
    }

    /// Wake the fiber for its first run.
    pub fn start(&self, args: Vec<Value>) -> Outcome {
        let _ = self.resume_tx.send(Resume::Start(args));
        self.recv()
    }

    /// Wake a previously-yielded fiber back up with fresh resume
    /// arguments.
    pub fn resume(&self, args: Vec<Value>) -> Outcome {
        let _ = self.resume_tx.send(Resume::Continue(args));
        self.recv()
    }

    fn recv(&self) -> Outcome {
        self.outcome_rx
            .recv()
            .expect("fiber coroutine dropped its outcome sender without finishing")
    }
}
