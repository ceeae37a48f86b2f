//! Coroutine create/resume/yield (§4.5, §4.8).
//!
//! A Croc coroutine is a `ThreadObj` living on the heap; this module owns
//! the control-transfer protocol around it. Coroutines nest strictly
//! LIFO — a thread's `resumer` link *is* the nesting stack, so unlike the
//! teacher's `scheduler.rs` (independent CSP-style strands communicating
//! over channels) there is no independent strand registry or run queue
//! here: `resume` drives the target thread to completion or suspension
//! synchronously, on the caller's own call stack, via
//! `interpreter::{start_coroutine, prepare_resume, run}`.

use std::sync::atomic::{AtomicU64, Ordering};

use croc_core::objects::function::FunctionObj;
use croc_core::objects::thread::{ThreadObj, ThreadState};
use croc_core::{GcRef, Value, Vm};

use crate::exceptions::ExceptionClasses;
use crate::interpreter::{self, Outcome};

/// Lifetime counters surfaced by the diagnostics dump, mirroring the
/// teacher's `TOTAL_SPAWNED`/`TOTAL_COMPLETED` pair.
pub static TOTAL_SPAWNED: AtomicU64 = AtomicU64::new(0);
pub static TOTAL_COMPLETED: AtomicU64 = AtomicU64::new(0);

/// A snapshot for the SIGQUIT/`CROC_REPORT` dump (§6).
#[derive(Debug, Clone, Copy)]
pub struct SchedulerStats {
    pub total_spawned: u64,
    pub total_completed: u64,
    pub live_threads: usize,
}

pub fn stats(vm: &Vm) -> SchedulerStats {
    SchedulerStats {
        total_spawned: TOTAL_SPAWNED.load(Ordering::Relaxed),
        total_completed: TOTAL_COMPLETED.load(Ordering::Relaxed),
        live_threads: vm.thread_count(),
    }
}

/// What a `resume` call produced (§4.5, §4.8).
#[derive(Debug)]
pub enum ResumeOutcome {
    /// The coroutine yielded; it is now `Suspended` and may be resumed
    /// again with fresh arguments.
    Yielded(Vec<Value>),
    /// The coroutine's body returned to completion; it is now `Dead`.
    Returned(Vec<Value>),
    /// The coroutine raised an uncaught exception; it is now `Dead`.
    Threw(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeError {
    /// §4.5: `Dead` is terminal.
    AlreadyDead,
    /// Only a thread that isn't already `Running` or `Waiting` on someone
    /// else can be resumed; resuming it from two places at once would
    /// break the LIFO resumer chain (§4.8).
    NotResumable,
}

/// Create a fresh, unstarted coroutine bound to `func` (§4.5 `Initial`).
pub fn create(vm: &mut Vm, func: GcRef<FunctionObj>) -> GcRef<ThreadObj> {
    let thread = vm.spawn_thread();
    vm.heap.get_thread_mut(thread).coro_func = Some(func);
    TOTAL_SPAWNED.fetch_add(1, Ordering::Relaxed);
    thread
}

pub fn status(vm: &Vm, thread: GcRef<ThreadObj>) -> ThreadState {
    vm.heap.get_thread(thread).state
}

/// `resume(t, args...)` (§4.8): switch to `t` as `resumer`'s callee,
/// driving it to its next yield, return, or uncaught throw.
///
/// `resumer` becomes `Waiting` for the duration of the call (§4.5) and is
/// restored to `Running` once `t` suspends or finishes — matching the
/// transition table exactly: `Initial`/`Suspended` --resume--> `Running`,
/// `Running` --yield--> `Suspended`, `Running` --return/throw--> `Dead`.
pub fn resume(
    vm: &mut Vm,
    classes: &ExceptionClasses,
    resumer: GcRef<ThreadObj>,
    target: GcRef<ThreadObj>,
    args: Vec<Value>,
) -> Result<ResumeOutcome, ResumeError> {
    let state = vm.heap.get_thread(target).state;
    match state {
        ThreadState::Dead => return Err(ResumeError::AlreadyDead),
        ThreadState::Running | ThreadState::Waiting => return Err(ResumeError::NotResumable),
        ThreadState::Initial | ThreadState::Suspended => {}
    }

    vm.heap.get_thread_mut(target).resumer = Some(resumer);
    vm.heap.get_thread_mut(resumer).state = ThreadState::Waiting;

    if state == ThreadState::Initial {
        let func = vm
            .heap
            .get_thread(target)
            .coro_func
            .expect("an Initial coroutine always has coro_func set by create()");
        interpreter::start_coroutine(vm, target, func, args);
    } else {
        interpreter::prepare_resume(vm, target, args);
    }

    let outcome = interpreter::run(vm, classes, target);

    if !vm.heap.get_thread(resumer).is_dead() {
        vm.heap.get_thread_mut(resumer).state = ThreadState::Running;
    }

    Ok(match outcome {
        Outcome::Yielded(values) => ResumeOutcome::Yielded(values),
        Outcome::Returned(values) => {
            finish(vm, target);
            ResumeOutcome::Returned(values)
        }
        Outcome::Threw(exc) => {
            finish(vm, target);
            ResumeOutcome::Threw(exc)
        }
    })
}

/// Mark a coroutine `Dead` and drop it from the VM's thread root set
/// (§4.5: terminal, never resumable again). `run` leaves a non-yielding
/// outcome's thread state as `Suspended`, a placeholder accurate for
/// `call_sync`'s nested-frame-return case but not for a coroutine whose
/// very last frame just popped — the scheduler is what knows this thread
/// is finished for good, not the interpreter.
fn finish(vm: &mut Vm, target: GcRef<ThreadObj>) {
    vm.heap.get_thread_mut(target).state = ThreadState::Dead;
    TOTAL_COMPLETED.fetch_add(1, Ordering::Relaxed);
    vm.retire_thread(target);
}
