//! The bytecode dispatch loop (§4.3, §4.6, §4.7): call/return, arithmetic
//! and indexing with the operator-overload protocol, and `catch`/`finally`
//! unwinding. Coroutine `Yield`/resume control transfer is handled one
//! level up, in [`crate::scheduler`]; this module stops at the frame
//! boundary a yield crosses and hands control back to its caller.
//!
//! Grounded in the teacher's stack-machine call convention (`stack.rs`,
//! `tagged_stack.rs`): arguments and results live on one flat value stack
//! addressed by activation-record-relative slot, not on the Rust call
//! stack, so a `Call` never recurses through this function — it pushes a
//! `CallFrame` and the surrounding `while` loop picks the new frame up.

use croc_core::bytecode::{Constant, Instruction, UpvalSource};
use croc_core::error::{ErrorKind, NativeError};
use croc_core::handle::GcRef;
use croc_core::objects::function::{FuncDefObj, FunctionObj, UpvalueObj};
use croc_core::objects::thread::{CallFrame, PendingYield, ThreadObj, ThreadState, TryRecord};
use croc_core::value::{TableKey, Value};
use croc_core::Vm;

use crate::exceptions::{self, ExceptionClasses};

/// What happened when `run` returned control to its caller.
pub enum Outcome {
    Returned(Vec<Value>),
    /// A `Yield` instruction ran in the outermost frame of this call to
    /// `run`; `croc_core`'s thread state is left `Waiting` so the
    /// scheduler can resume it later with the values the eventual
    /// `resume` call supplies.
    Yielded(Vec<Value>),
    /// Propagated past every frame this call to `run` owns, uncaught.
    Threw(Value),
}

/// Drive `thread` forward until it returns from its outermost frame
/// (relative to this call), yields, or throws past its outermost frame.
pub fn run(vm: &mut Vm, classes: &ExceptionClasses, thread: GcRef<ThreadObj>) -> Outcome {
    let base_frame_depth = vm.heap.get_thread(thread).frames.len().saturating_sub(1);
    vm.heap.get_thread_mut(thread).state = ThreadState::Running;

    loop {
        if vm.heap.get_thread(thread).frames.len() <= base_frame_depth {
            let results = std::mem::take(&mut vm.heap.get_thread_mut(thread).results);
            return Outcome::Returned(results);
        }

        match step(vm, classes, thread) {
            Step::Continue => {}
            Step::Yield(values) => {
                // A `Yield` suspends the whole thread regardless of how
                // many frames are on top of the one this call to `run`
                // started at — the frame stack is left exactly as it was,
                // so the next `resume` (via `prepare_resume`) just fills
                // in the yield's destination slot and this same loop
                // picks up at the following instruction (§4.5).
                vm.heap.get_thread_mut(thread).state = ThreadState::Suspended;
                return Outcome::Yielded(values);
            }
            Step::Returned(depth) => {
                if depth <= base_frame_depth {
                    let results = std::mem::take(&mut vm.heap.get_thread_mut(thread).results);
                    vm.heap.get_thread_mut(thread).state = ThreadState::Suspended;
                    return Outcome::Returned(results);
                }
            }
            Step::Threw(exc) => {
                match unwind(vm, thread, exc) {
                    Some(leftover) if vm.heap.get_thread(thread).frames.len() <= base_frame_depth => {
                        vm.heap.get_thread_mut(thread).state = ThreadState::Dead;
                        return Outcome::Threw(leftover);
                    }
                    Some(_) => {}
                    None => {}
                }
            }
        }
    }
}

/// Fill in a suspended thread's pending yield slot with the values its
/// `resume` call is handing back (§4.5: "as if `t` was returning from its
/// last `yield`"). A no-op if the thread didn't actually yield (e.g. it's
/// `Initial` and about to run its `coro_func` for the first time).
pub fn prepare_resume(vm: &mut Vm, thread: GcRef<ThreadObj>, args: Vec<Value>) {
    let Some(pending) = vm.heap.get_thread_mut(thread).pending_yield.take() else {
        return;
    };
    let values = match pending.nresults {
        Some(n) => {
            let mut v = args;
            v.resize(n as usize, Value::Null);
            v
        }
        None => args,
    };
    let t = vm.heap.get_thread_mut(thread);
    let end = pending.abs_slot as usize + values.len();
    if end > t.stack.len() {
        t.stack.resize(end, Value::Null);
    }
    for (i, v) in values.into_iter().enumerate() {
        t.stack[pending.abs_slot as usize + i] = v;
    }
}

/// Push the first activation record onto a freshly-spawned (`Initial`)
/// thread, the way `do_call` would if an ordinary `Call` instruction had
/// targeted `func` — but there is no calling frame to borrow a slot from,
/// so this seeds the thread's (empty) stack directly.
pub fn start_coroutine(vm: &mut Vm, thread: GcRef<ThreadObj>, func: GcRef<FunctionObj>, args: Vec<Value>) {
    let nargs = args.len() as u32;
    let (vararg_base, vararg_count) = vararg_region(vm, func, 1, nargs);
    let t = vm.heap.get_thread_mut(thread);
    debug_assert!(t.stack.is_empty() && t.frames.is_empty());
    t.stack.push(Value::Function(func));
    t.stack.extend(args);
    t.frames.push(CallFrame { func, base: 1, pc: 0, nresults: None, vararg_base, vararg_count });
}

/// Call `func` to completion on `thread` and return its outcome, the way
/// the embedding API's `call`/`method_call` entry points and the graph
/// serializer's `opSerialize`/`opDeserialize` hook dispatch both need: a
/// one-shot invocation that runs until `func`'s own frame returns, throws
/// past it, or (if `func` itself yields) suspends the whole thread. Pushes
/// a `CallFrame` on top of whatever is already there rather than requiring
/// an empty thread, so it composes with a hook call made mid-interpretation
/// of another function.
pub fn call_sync(
    vm: &mut Vm,
    classes: &ExceptionClasses,
    thread: GcRef<ThreadObj>,
    func: GcRef<FunctionObj>,
    args: Vec<Value>,
) -> Outcome {
    let args_base = vm.heap.get_thread(thread).stack.len() as u32;
    let nargs = args.len() as u32;
    let (vararg_base, vararg_count) = vararg_region(vm, func, args_base, nargs);
    {
        let t = vm.heap.get_thread_mut(thread);
        t.stack.extend(args);
        t.frames.push(CallFrame {
            func,
            base: args_base,
            pc: 0,
            nresults: None,
            vararg_base,
            vararg_count,
        });
    }
    run(vm, classes, thread)
}

/// Where a callee's vararg overflow region starts and how many values
/// landed in it (§4.5 "vararg-base", §4.6 Call contract). `base` is the
/// absolute stack index the callee's activation record will use.
fn vararg_region(vm: &Vm, func: GcRef<FunctionObj>, base: u32, nargs: u32) -> (u32, u32) {
    match vm.heap.get_function(func) {
        FunctionObj::Script { funcdef, .. } => {
            let def = &vm.heap.get_funcdef(*funcdef).def;
            if def.is_vararg && nargs > def.num_params {
                (base + def.num_params, nargs - def.num_params)
            } else {
                (base + def.num_params.min(nargs), 0)
            }
        }
        FunctionObj::Native { .. } => (base, 0),
    }
}

enum Step {
    Continue,
    Yield(Vec<Value>),
    /// Carries the frame depth *after* the return, so `run` can tell
    /// whether it unwound past its own call boundary.
    Returned(usize),
    Threw(Value),
}

/// Pop `try_stack` entries down to (and including) the nearest handler
/// that accepts `exc` or is a `finally`, transferring control there. If
/// nothing in this thread catches it, returns `Some(exc)` to the caller
/// once the frame stack is exhausted; returns `None` once a handler has
/// taken over.
fn unwind(vm: &mut Vm, thread: GcRef<ThreadObj>, exc: Value) -> Option<Value> {
    loop {
        let try_record = vm.heap.get_thread_mut(thread).try_stack.pop();
        let Some(record) = try_record else {
            vm.heap.get_thread_mut(thread).frames.clear();
            return Some(exc);
        };

        let halting = vm.heap.get_thread(thread).halting;
        let matches = record.is_finally || (!halting && class_matches(vm, exc, &record));
        if !matches {
            continue;
        }

        let t = vm.heap.get_thread_mut(thread);
        t.frames.truncate(record.frame_index as usize + 1);
        t.stack.truncate(record.stack_depth as usize);
        if let Some(frame) = t.frames.last_mut() {
            frame.pc = record.handler_pc;
        }
        if !record.is_finally {
            let slot = record.stack_depth + record.exc_slot;
            if slot as usize >= t.stack.len() {
                t.stack.resize(slot as usize + 1, Value::Null);
            }
            t.stack[slot as usize] = exc;
        } else {
            // `finally` handlers re-throw on completion unless they
            // explicitly swallow; stash the in-flight exception so
            // `EndFinally` can resume unwinding it (§4.7).
            t.pending_rethrow = Some(exc);
        }
        return None;
    }
}

fn class_matches(vm: &Vm, exc: Value, record: &TryRecord) -> bool {
    match record.catch_class {
        Some(class) => exceptions::is_instance_of(vm, exc, class),
        None => true,
    }
}

fn throw_native(
    vm: &mut Vm,
    classes: &ExceptionClasses,
    thread: GcRef<ThreadObj>,
    err: NativeError,
) -> Step {
    let exc = exceptions::instantiate(vm, classes, err);
    raise(vm, classes, thread, exc)
}

/// Throw `exc`, chaining it to whatever exception is currently propagating
/// through an active `finally` on this thread (§4.7, §8 property 8: "an
/// exception raised in a `finally` that is executing because of a prior
/// in-flight exception must carry the prior as its `cause`"). A `finally`
/// block that completes normally instead re-raises the prior exception
/// itself, via `EndFinally`.
fn raise(vm: &mut Vm, classes: &ExceptionClasses, thread: GcRef<ThreadObj>, exc: Value) -> Step {
    let prior = vm.heap.get_thread_mut(thread).pending_rethrow.take();
    let exc = match prior {
        Some(cause) => {
            if let Value::Instance(handle) = exc {
                vm.heap.get_instance_mut(handle).set_field(classes.cause_field(), cause);
            }
            exc
        }
        None => exc,
    };
    match unwind(vm, thread, exc) {
        Some(leftover) => Step::Threw(leftover),
        None => Step::Continue,
    }
}

/// Raise the uncatchable halt exception (§4.7, §5): sets `halting` so
/// `unwind` skips every `catch` along the way, but still runs `finally`
/// blocks, matching "unwinds through finally blocks normally".
fn raise_halt(vm: &mut Vm, classes: &ExceptionClasses, thread: GcRef<ThreadObj>) -> Step {
    vm.heap.get_thread_mut(thread).halting = true;
    let exc = exceptions::instantiate(vm, classes, NativeError::new(ErrorKind::StateError, "halted"));
    raise(vm, classes, thread, exc)
}

fn step(vm: &mut Vm, classes: &ExceptionClasses, thread: GcRef<ThreadObj>) -> Step {
    // §5 cooperative cancellation: checked at every instruction boundary,
    // which subsumes "every back-branch and call/return boundary".
    if vm.heap.get_thread(thread).halt_requested {
        vm.heap.get_thread_mut(thread).halt_requested = false;
        return raise_halt(vm, classes, thread);
    }

    let (func, pc) = {
        let t = vm.heap.get_thread(thread);
        let frame = t.frames.last().expect("step called with no active frame");
        (frame.func, frame.pc)
    };

    let funcdef = match vm.heap.get_function(func) {
        FunctionObj::Script { funcdef, .. } => *funcdef,
        FunctionObj::Native { func, .. } => {
            let func = *func;
            return call_native(vm, classes, thread, func);
        }
    };

    let instr = vm.heap.get_funcdef(funcdef).def.code.get(pc as usize).cloned();
    let Some(instr) = instr else {
        return do_return(vm, thread, 0, Some(0));
    };

    vm.heap.get_thread_mut(thread).frames.last_mut().unwrap().pc = pc + 1;

    execute_one(vm, classes, thread, funcdef, instr)
}

fn base_of(vm: &Vm, thread: GcRef<ThreadObj>) -> u32 {
    vm.heap.get_thread(thread).frames.last().unwrap().base
}

fn slot(vm: &Vm, thread: GcRef<ThreadObj>, i: u32) -> Value {
    let base = base_of(vm, thread);
    vm.heap.get_thread(thread).stack[(base + i) as usize]
}

fn set_slot(vm: &mut Vm, thread: GcRef<ThreadObj>, i: u32, v: Value) {
    let base = base_of(vm, thread);
    let t = vm.heap.get_thread_mut(thread);
    let idx = (base + i) as usize;
    if idx >= t.stack.len() {
        t.stack.resize(idx + 1, Value::Null);
    }
    t.stack[idx] = v;
}

fn execute_one(
    vm: &mut Vm,
    classes: &ExceptionClasses,
    thread: GcRef<ThreadObj>,
    funcdef: GcRef<FuncDefObj>,
    instr: Instruction,
) -> Step {
    use Instruction::*;
    match instr {
        LoadConst { dst, konst } => {
            let c = vm.heap.get_funcdef(funcdef).def.constants[konst as usize].clone();
            let v = c.as_value(|s| Value::String(vm.heap.intern_string(s)));
            set_slot(vm, thread, dst, v);
            Step::Continue
        }
        LoadNull { dst } => {
            set_slot(vm, thread, dst, Value::Null);
            Step::Continue
        }
        LoadBool { dst, value } => {
            set_slot(vm, thread, dst, Value::Bool(value));
            Step::Continue
        }
        Move { dst, src } => {
            let v = slot(vm, thread, src);
            set_slot(vm, thread, dst, v);
            Step::Continue
        }
        MultiMove { dst, src, count } => {
            for i in 0..count {
                let v = slot(vm, thread, src + i);
                set_slot(vm, thread, dst + i, v);
            }
            Step::Continue
        }
        GetGlobal { dst, name } => {
            let name = intern_name(vm, funcdef, name);
            let v = vm.heap.get_namespace(vm.globals).get(name).unwrap_or(Value::Null);
            set_slot(vm, thread, dst, v);
            Step::Continue
        }
        SetGlobal { name, src } => {
            let name = intern_name(vm, funcdef, name);
            let v = slot(vm, thread, src);
            vm.heap.get_namespace_mut(vm.globals).set(name, v);
            Step::Continue
        }
        GetUpval { dst, upval } => {
            let v = read_upvalue(vm, thread, upval);
            set_slot(vm, thread, dst, v);
            Step::Continue
        }
        SetUpval { upval, src } => {
            let v = slot(vm, thread, src);
            write_upvalue(vm, thread, upval, v);
            Step::Continue
        }
        GetNamespace { dst, ns, name } => {
            let ns_v = slot(vm, thread, ns);
            let name = intern_name(vm, funcdef, name);
            match ns_v {
                Value::Namespace(n) => {
                    let v = vm.heap.get_namespace(n).get(name).unwrap_or(Value::Null);
                    set_slot(vm, thread, dst, v);
                    Step::Continue
                }
                _ => throw_native(
                    vm,
                    classes,
                    thread,
                    NativeError::type_error("cannot look up a field on a non-namespace value"),
                ),
            }
        }
        SetNamespace { ns, name, src } => {
            let ns_v = slot(vm, thread, ns);
            let name = intern_name(vm, funcdef, name);
            let v = slot(vm, thread, src);
            match ns_v {
                Value::Namespace(n) => {
                    vm.heap.get_namespace_mut(n).set(name, v);
                    Step::Continue
                }
                _ => throw_native(
                    vm,
                    classes,
                    thread,
                    NativeError::type_error("cannot assign a field on a non-namespace value"),
                ),
            }
        }
        Index { dst, container, key } => {
            let c = slot(vm, thread, container);
            let k = slot(vm, thread, key);
            match do_index(vm, c, k) {
                Ok(v) => {
                    set_slot(vm, thread, dst, v);
                    Step::Continue
                }
                Err(e) if matches!(c, Value::Instance(_)) => match resolve_metamethod(vm, c, "opIndex") {
                    Some(method) => dispatch_binary_metamethod(vm, classes, thread, dst, method, c, k),
                    None => throw_native(vm, classes, thread, e),
                },
                Err(e) => throw_native(vm, classes, thread, e),
            }
        }
        IndexAssign { container, key, src } => {
            let c = slot(vm, thread, container);
            let k = slot(vm, thread, key);
            let v = slot(vm, thread, src);
            match do_index_assign(vm, c, k, v) {
                Ok(()) => Step::Continue,
                Err(e) => throw_native(vm, classes, thread, e),
            }
        }
        Slice { dst, container, lo, hi } => {
            let c = slot(vm, thread, container);
            let lo = as_int(slot(vm, thread, lo)).unwrap_or(0);
            let hi = as_int(slot(vm, thread, hi)).unwrap_or(0);
            match do_slice(vm, c, lo, hi) {
                Ok(v) => {
                    set_slot(vm, thread, dst, v);
                    Step::Continue
                }
                Err(e) => throw_native(vm, classes, thread, e),
            }
        }
        Add { dst, lhs, rhs } => binop(vm, classes, thread, dst, lhs, rhs, "opAdd", |a, b| a.checked_add(b), |a, b| a + b),
        Sub { dst, lhs, rhs } => binop(vm, classes, thread, dst, lhs, rhs, "opSub", |a, b| a.checked_sub(b), |a, b| a - b),
        Mul { dst, lhs, rhs } => binop(vm, classes, thread, dst, lhs, rhs, "opMul", |a, b| a.checked_mul(b), |a, b| a * b),
        Div { dst, lhs, rhs } => {
            let a = slot(vm, thread, lhs);
            let b = slot(vm, thread, rhs);
            match (a, b) {
                (Value::Int(_), Value::Int(0)) => throw_native(
                    vm,
                    classes,
                    thread,
                    NativeError::new(ErrorKind::ValueError, "division by zero"),
                ),
                (Value::Int(x), Value::Int(y)) => {
                    set_slot(vm, thread, dst, Value::Int(x / y));
                    Step::Continue
                }
                (x, y) => match (as_float(x), as_float(y)) {
                    (Some(x), Some(y)) => {
                        set_slot(vm, thread, dst, Value::Float(x / y));
                        Step::Continue
                    }
                    _ => dispatch_arith_metamethod_or_error(vm, classes, thread, dst, x, y, "opDiv"),
                },
            }
        }
        Mod { dst, lhs, rhs } => {
            let a = slot(vm, thread, lhs);
            let b = slot(vm, thread, rhs);
            match (a, b) {
                (Value::Int(_), Value::Int(0)) => throw_native(
                    vm,
                    classes,
                    thread,
                    NativeError::new(ErrorKind::ValueError, "modulo by zero"),
                ),
                (Value::Int(x), Value::Int(y)) => {
                    set_slot(vm, thread, dst, Value::Int(x % y));
                    Step::Continue
                }
                (x, y) => match (as_float(x), as_float(y)) {
                    (Some(x), Some(y)) => {
                        set_slot(vm, thread, dst, Value::Float(x % y));
                        Step::Continue
                    }
                    _ => dispatch_arith_metamethod_or_error(vm, classes, thread, dst, x, y, "opMod"),
                },
            }
        }
        Neg { dst, src } => {
            let v = slot(vm, thread, src);
            match v {
                Value::Int(i) => {
                    set_slot(vm, thread, dst, Value::Int(-i));
                    Step::Continue
                }
                Value::Float(f) => {
                    set_slot(vm, thread, dst, Value::Float(-f));
                    Step::Continue
                }
                _ => match resolve_metamethod(vm, v, "opNeg") {
                    Some(method) => dispatch_unary_metamethod(vm, classes, thread, dst, method, v),
                    None => throw_native(vm, classes, thread, NativeError::type_error("cannot negate a non-numeric value")),
                },
            }
        }
        BitAnd { dst, lhs, rhs } => int_binop(vm, classes, thread, dst, lhs, rhs, |a, b| a & b),
        BitOr { dst, lhs, rhs } => int_binop(vm, classes, thread, dst, lhs, rhs, |a, b| a | b),
        BitXor { dst, lhs, rhs } => int_binop(vm, classes, thread, dst, lhs, rhs, |a, b| a ^ b),
        Shl { dst, lhs, rhs } => int_binop(vm, classes, thread, dst, lhs, rhs, |a, b| a.wrapping_shl(b as u32)),
        Shr { dst, lhs, rhs } => int_binop(vm, classes, thread, dst, lhs, rhs, |a, b| a.wrapping_shr(b as u32)),
        BitNot { dst, src } => {
            let v = slot(vm, thread, src);
            match v {
                Value::Int(i) => {
                    set_slot(vm, thread, dst, Value::Int(!i));
                    Step::Continue
                }
                _ => throw_native(vm, classes, thread, NativeError::type_error("bitwise not requires an int")),
            }
        }
        Cmp { dst, lhs, rhs } => {
            let a = slot(vm, thread, lhs);
            let b = slot(vm, thread, rhs);
            match compare(a, b) {
                Some(ord) => {
                    set_slot(vm, thread, dst, Value::Int(ord as i64));
                    Step::Continue
                }
                None => throw_native(vm, classes, thread, NativeError::type_error("values are not comparable")),
            }
        }
        Eq { dst, lhs, rhs } => {
            let a = slot(vm, thread, lhs);
            let b = slot(vm, thread, rhs);
            set_slot(vm, thread, dst, Value::Bool(a.raw_eq(&b)));
            Step::Continue
        }
        Not { dst, src } => {
            let v = slot(vm, thread, src);
            set_slot(vm, thread, dst, Value::Bool(!v.is_truthy()));
            Step::Continue
        }
        Cat { dst, base, count } => {
            // §4.6: N-ary, left-to-right. Any non-primitive operand tries
            // `opCat`/`opCat_r` pairwise against its immediate neighbor;
            // since that requires a real call (and thus pausing this
            // instruction mid-stream), the fallback is only wired up for
            // the common two-operand case — a chain of 3+ operands where
            // one isn't a primitive raises a type error instead of
            // threading a multi-step continuation through here.
            if count == 2 {
                let a = slot(vm, thread, base);
                let b = slot(vm, thread, base + 1);
                if !is_primitive_catable(a) || !is_primitive_catable(b) {
                    return dispatch_cat_metamethod(vm, classes, thread, dst, a, b);
                }
            }
            let mut out = String::new();
            for i in 0..count {
                let v = slot(vm, thread, base + i);
                out.push_str(&display_value(vm, v));
            }
            let s = vm.heap.intern_string(&out);
            set_slot(vm, thread, dst, Value::String(s));
            Step::Continue
        }
        Jmp { target } => {
            jump_to(vm, thread, target);
            Step::Continue
        }
        JmpIf { cond, target } => {
            if slot(vm, thread, cond).is_truthy() {
                jump_to(vm, thread, target);
            }
            Step::Continue
        }
        JmpIfNot { cond, target } => {
            if !slot(vm, thread, cond).is_truthy() {
                jump_to(vm, thread, target);
            }
            Step::Continue
        }
        ForPrep { base, target } => {
            let start = as_int(slot(vm, thread, base));
            let stop = as_int(slot(vm, thread, base + 1));
            let step_v = as_int(slot(vm, thread, base + 2));
            match (start, stop, step_v) {
                (Some(start), Some(_), Some(step_v)) if step_v != 0 => {
                    set_slot(vm, thread, base + 3, Value::Int(start));
                }
                _ => jump_to(vm, thread, target),
            }
            Step::Continue
        }
        ForLoop { base, target } => {
            let cur = as_int(slot(vm, thread, base + 3)).unwrap_or(0);
            let stop = as_int(slot(vm, thread, base + 1)).unwrap_or(0);
            let step_v = as_int(slot(vm, thread, base + 2)).unwrap_or(1);
            let continues = if step_v > 0 { cur < stop } else { cur > stop };
            if continues {
                set_slot(vm, thread, base + 3, Value::Int(cur + step_v));
                jump_to(vm, thread, target);
            }
            Step::Continue
        }
        ForeachPrep { base, target } => {
            // state/control/step occupy base..base+3; default iteration
            // uses the container's reflective field/element enumeration
            // (the opApply-style default iterator, §[EXPANSION]).
            let _ = (base, target);
            Step::Continue
        }
        ForeachLoop { base, target } => {
            let container = slot(vm, thread, base);
            let idx = as_int(slot(vm, thread, base + 1)).unwrap_or(-1) + 1;
            match next_foreach(vm, container, idx) {
                Some((k, v)) => {
                    set_slot(vm, thread, base + 1, Value::Int(idx));
                    set_slot(vm, thread, base + 3, k);
                    set_slot(vm, thread, base + 4, v);
                    jump_to(vm, thread, target);
                }
                None => {}
            }
            Step::Continue
        }
        Closure { dst, funcdef: inner_idx } => {
            let v = make_closure(vm, thread, funcdef, inner_idx);
            set_slot(vm, thread, dst, v);
            Step::Continue
        }
        Call { func, nargs, nresults } => do_call(vm, classes, thread, func, nargs, nresults),
        TailCall { func, nargs } => do_call(vm, classes, thread, func, nargs, None),
        Return { base, count } => {
            let depth = vm.heap.get_thread(thread).frames.len() - 1;
            let results = collect_args(vm, thread, base, count);
            return_from(vm, thread, results, depth)
        }
        Vararg { dst, count } => {
            let frame = vm.heap.get_thread(thread).frames.last().unwrap();
            let vararg_base = frame.vararg_base;
            let vararg_count = frame.vararg_count;
            let n = count.unwrap_or(vararg_count);
            for i in 0..n {
                let v = if i < vararg_count {
                    vm.heap
                        .get_thread(thread)
                        .stack
                        .get((vararg_base + i) as usize)
                        .copied()
                        .unwrap_or(Value::Null)
                } else {
                    Value::Null
                };
                set_slot(vm, thread, dst + i, v);
            }
            Step::Continue
        }
        NewClass { dst, name, parent } => {
            let name = intern_name(vm, funcdef, name);
            let parent_class = match parent {
                Some(p) => match slot(vm, thread, p) {
                    Value::Class(c) => Some(c),
                    _ => {
                        return throw_native(
                            vm,
                            classes,
                            thread,
                            NativeError::type_error("base must be a class"),
                        )
                    }
                },
                None => None,
            };
            let c = vm.alloc_class(name, parent_class);
            set_slot(vm, thread, dst, Value::Class(c));
            Step::Continue
        }
        NewInstance { dst, class } => match slot(vm, thread, class) {
            Value::Class(c) => {
                let inst = instantiate_fields(vm, c);
                let handle = vm.alloc_instance(inst);
                set_slot(vm, thread, dst, Value::Instance(handle));
                Step::Continue
            }
            _ => throw_native(vm, classes, thread, NativeError::type_error("cannot instantiate a non-class value")),
        },
        Method { dst, object, name } => {
            let obj = slot(vm, thread, object);
            let name = intern_name(vm, funcdef, name);
            match lookup_method(vm, obj, name) {
                Some(v) => {
                    set_slot(vm, thread, dst, v);
                    Step::Continue
                }
                None => throw_native(
                    vm,
                    classes,
                    thread,
                    NativeError::field_error(format!("no such method '{}'", vm.heap.get_string(name).as_str())),
                ),
            }
        }
        PushCatch { exc_slot, handler } => {
            push_try(vm, thread, handler, Some(classes.throwable), exc_slot, false);
            Step::Continue
        }
        PushFinally { handler } => {
            push_try(vm, thread, handler, None, 0, true);
            Step::Continue
        }
        PopHandler => {
            vm.heap.get_thread_mut(thread).try_stack.pop();
            Step::Continue
        }
        Throw { src } => {
            let exc = slot(vm, thread, src);
            raise(vm, classes, thread, exc)
        }
        EndFinally => {
            let pending = vm.heap.get_thread_mut(thread).pending_rethrow.take();
            match pending {
                Some(exc) => match unwind(vm, thread, exc) {
                    Some(leftover) => Step::Threw(leftover),
                    None => Step::Continue,
                },
                None => Step::Continue,
            }
        }
        Switch { src, table, default } => {
            let v = slot(vm, thread, src);
            let target = vm
                .heap
                .get_funcdef(funcdef)
                .def
                .switch_tables
                .get(table as usize)
                .and_then(|t| {
                    let want = match v {
                        Value::Int(i) => Some(i),
                        _ => None,
                    }?;
                    t.cases
                        .iter()
                        .find(|(konst, _)| {
                            matches!(
                                vm.heap.get_funcdef(funcdef).def.constants.get(*konst as usize),
                                Some(Constant::Int(c)) if *c == want
                            )
                        })
                        .map(|(_, target)| *target)
                })
                .unwrap_or(default);
            jump_to(vm, thread, target);
            Step::Continue
        }
        Yield { base, count, nresults } => {
            // §4.5/§4.8: the portable scheduler drives a coroutine by Rust
            // recursion through `call_native`, which cannot suspend a Rust
            // stack frame mid-call — so a `yield` while any native frame is
            // on this thread's stack is refused here rather than silently
            // corrupting control flow. The extended, fiber-backed scheduler
            // (see `crate::fiber`) runs coroutines on their own stackful
            // green thread precisely to lift this restriction.
            if vm.heap.get_thread(thread).native_call_depth > 0 {
                return throw_native(
                    vm,
                    classes,
                    thread,
                    NativeError::new(
                        ErrorKind::StateError,
                        "cannot yield across a native call frame in the portable coroutine scheduler",
                    ),
                );
            }
            let values = collect_args(vm, thread, base, count);
            let abs_slot = base_of(vm, thread) + base;
            vm.heap.get_thread_mut(thread).pending_yield = Some(PendingYield { abs_slot, nresults });
            Step::Yield(values)
        }
        Halt => raise_halt(vm, classes, thread),
    }
}

fn jump_to(vm: &mut Vm, thread: GcRef<ThreadObj>, target: u32) {
    vm.heap.get_thread_mut(thread).frames.last_mut().unwrap().pc = target;
}

fn intern_name(vm: &mut Vm, funcdef: GcRef<FuncDefObj>, idx: u32) -> GcRef<croc_core::objects::strings::StringObj> {
    match &vm.heap.get_funcdef(funcdef).def.constants[idx as usize] {
        Constant::String(s) => vm.heap.intern_string(s),
        _ => vm.heap.intern_string(""),
    }
}

fn as_int(v: Value) -> Option<i64> {
    match v {
        Value::Int(i) => Some(i),
        Value::Float(f) if f.fract() == 0.0 => Some(f as i64),
        _ => None,
    }
}

fn as_float(v: Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(i as f64),
        Value::Float(f) => Some(f),
        _ => None,
    }
}

fn binop(
    vm: &mut Vm,
    classes: &ExceptionClasses,
    thread: GcRef<ThreadObj>,
    dst: u32,
    lhs: u32,
    rhs: u32,
    op_name: &str,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    float_op: impl Fn(f64, f64) -> f64,
) -> Step {
    let a = slot(vm, thread, lhs);
    let b = slot(vm, thread, rhs);
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => match int_op(x, y) {
            Some(r) => {
                set_slot(vm, thread, dst, Value::Int(r));
                Step::Continue
            }
            None => throw_native(vm, classes, thread, NativeError::new(ErrorKind::RangeError, "integer overflow")),
        },
        (x, y) => match (as_float(x), as_float(y)) {
            (Some(x), Some(y)) => {
                set_slot(vm, thread, dst, Value::Float(float_op(x, y)));
                Step::Continue
            }
            _ => dispatch_arith_metamethod_or_error(vm, classes, thread, dst, x, y, op_name),
        },
    }
}

/// §4.6 "Metamethod lookup": primitive types consult their per-tag
/// metatable namespace; `Instance` consults its class chain. Resolution
/// is non-recursive — a miss here is a hard error, never another
/// metamethod search.
fn resolve_metamethod(vm: &mut Vm, value: Value, name: &str) -> Option<Value> {
    let name = vm.heap.intern_string(name);
    let class = match value {
        Value::Instance(i) => vm.heap.get_instance(i).class,
        other => vm.metatable(other.tag())?,
    };
    let mut cur = Some(class);
    while let Some(c) = cur {
        if let Some(m) = vm.heap.get_class(c).own_method(name) {
            return Some(m);
        }
        cur = vm.heap.get_class(c).parent;
    }
    None
}

/// §4.6 "Arithmetic contract": a non-numeric operand triggers a lookup of
/// `opName`/`opName_r` on the non-numeric side(s); a miss is a type error,
/// never a second metamethod search.
fn dispatch_arith_metamethod_or_error(
    vm: &mut Vm,
    classes: &ExceptionClasses,
    thread: GcRef<ThreadObj>,
    dst: u32,
    lhs: Value,
    rhs: Value,
    op_name: &str,
) -> Step {
    if let Some(method) = resolve_metamethod(vm, lhs, op_name) {
        return dispatch_binary_metamethod(vm, classes, thread, dst, method, lhs, rhs);
    }
    let rname = format!("{op_name}_r");
    if let Some(method) = resolve_metamethod(vm, rhs, &rname) {
        return dispatch_binary_metamethod(vm, classes, thread, dst, method, rhs, lhs);
    }
    throw_native(vm, classes, thread, NativeError::type_error("arithmetic requires numeric operands"))
}

/// Invoke a resolved metamethod as if it were called in tail position of
/// the current instruction, writing its single result to `dst`. Pushes a
/// `CallFrame` the same way `do_call` does for an ordinary `Call`
/// instruction rather than recursing through Rust, so the surrounding
/// `step`/`run` loop drives it like any other call (including further
/// yields or throws inside the metamethod body).
fn call_metamethod(
    vm: &mut Vm,
    classes: &ExceptionClasses,
    thread: GcRef<ThreadObj>,
    dst: u32,
    method: Value,
    args: Vec<Value>,
) -> Step {
    let Value::Function(func) = method else {
        return throw_native(vm, classes, thread, NativeError::type_error("metamethod is not callable"));
    };
    let dst_abs = base_of(vm, thread) + dst;
    let args_base = dst_abs + 1;
    let nargs = args.len() as u32;
    let (vararg_base, vararg_count) = vararg_region(vm, func, args_base, nargs);
    let t = vm.heap.get_thread_mut(thread);
    t.stack.resize((dst_abs + 1) as usize, Value::Null);
    t.stack.truncate(dst_abs as usize + 1);
    t.stack.extend(args);
    t.frames.push(CallFrame {
        func,
        base: args_base,
        pc: 0,
        nresults: Some(1),
        vararg_base,
        vararg_count,
    });
    Step::Continue
}

fn dispatch_binary_metamethod(
    vm: &mut Vm,
    classes: &ExceptionClasses,
    thread: GcRef<ThreadObj>,
    dst: u32,
    method: Value,
    a: Value,
    b: Value,
) -> Step {
    call_metamethod(vm, classes, thread, dst, method, vec![a, b])
}

/// Whether `display_value`'s default formatting applies (§4.6 "Cat"
/// needs a base case for concatenation without a metamethod).
fn is_primitive_catable(v: Value) -> bool {
    matches!(v, Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::String(_))
}

fn dispatch_cat_metamethod(
    vm: &mut Vm,
    classes: &ExceptionClasses,
    thread: GcRef<ThreadObj>,
    dst: u32,
    a: Value,
    b: Value,
) -> Step {
    if let Some(method) = resolve_metamethod(vm, a, "opCat") {
        return dispatch_binary_metamethod(vm, classes, thread, dst, method, a, b);
    }
    if let Some(method) = resolve_metamethod(vm, b, "opCat_r") {
        return dispatch_binary_metamethod(vm, classes, thread, dst, method, b, a);
    }
    throw_native(vm, classes, thread, NativeError::type_error("value does not support concatenation"))
}

fn dispatch_unary_metamethod(
    vm: &mut Vm,
    classes: &ExceptionClasses,
    thread: GcRef<ThreadObj>,
    dst: u32,
    method: Value,
    a: Value,
) -> Step {
    call_metamethod(vm, classes, thread, dst, method, vec![a])
}

fn int_binop(
    vm: &mut Vm,
    classes: &ExceptionClasses,
    thread: GcRef<ThreadObj>,
    dst: u32,
    lhs: u32,
    rhs: u32,
    op: impl Fn(i64, i64) -> i64,
) -> Step {
    let a = slot(vm, thread, lhs);
    let b = slot(vm, thread, rhs);
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => {
            set_slot(vm, thread, dst, Value::Int(op(x, y)));
            Step::Continue
        }
        _ => throw_native(vm, classes, thread, NativeError::type_error("bitwise operators require ints")),
    }
}

fn compare(a: Value, b: Value) -> Option<i64> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some((x.cmp(&y) as i8) as i64),
        (x, y) => {
            let (x, y) = (as_float(x)?, as_float(y)?);
            x.partial_cmp(&y).map(|o| (o as i8) as i64)
        }
    }
}

fn display_value(vm: &Vm, v: Value) -> String {
    match v {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::String(s) => vm.heap.get_string(s).as_str().to_string(),
        other => format!("{}(0x{:x})", other.tag().name(), other_slot(other)),
    }
}

fn other_slot(v: Value) -> u32 {
    croc_core::objects::weakref::referent_slot(&v).unwrap_or(0)
}

fn do_index(vm: &mut Vm, container: Value, key: Value) -> Result<Value, NativeError> {
    match container {
        Value::Array(a) => {
            let idx = as_int(key).ok_or_else(|| NativeError::type_error("array index must be an int"))?;
            vm.heap
                .get_array(a)
                .get(idx)
                .map_err(|_| NativeError::bounds_error("array index out of bounds"))
        }
        Value::Table(t) => {
            let k = TableKey::try_new(key).map_err(|_| NativeError::type_error("invalid table key"))?;
            Ok(vm.heap.get_table(t).get(&k).unwrap_or(Value::Null))
        }
        Value::Namespace(n) => {
            let Value::String(s) = key else {
                return Err(NativeError::type_error("namespace key must be a string"));
            };
            Ok(vm.heap.get_namespace(n).get(s).unwrap_or(Value::Null))
        }
        Value::Instance(i) => {
            let Value::String(s) = key else {
                return Err(NativeError::type_error("instance field key must be a string"));
            };
            vm.heap
                .get_instance(i)
                .get_field(s)
                .ok_or_else(|| NativeError::field_error("no such field"))
        }
        Value::String(s) => {
            let idx = as_int(key).ok_or_else(|| NativeError::type_error("string index must be an int"))?;
            let text = vm.heap.get_string(s).as_str();
            let ch = index_char(text, idx).ok_or_else(|| NativeError::bounds_error("string index out of bounds"))?;
            Ok(Value::String(vm.heap.intern_string(&ch.to_string())))
        }
        _ => Err(NativeError::type_error("value is not indexable")),
    }
}

fn index_char(s: &str, idx: i64) -> Option<char> {
    let len = s.chars().count() as i64;
    let i = if idx < 0 { idx + len } else { idx };
    if i < 0 || i >= len {
        return None;
    }
    s.chars().nth(i as usize)
}

fn do_index_assign(vm: &mut Vm, container: Value, key: Value, value: Value) -> Result<(), NativeError> {
    match container {
        Value::Array(a) => {
            let idx = as_int(key).ok_or_else(|| NativeError::type_error("array index must be an int"))?;
            vm.heap
                .get_array_mut(a)
                .set(idx, value)
                .map_err(|_| NativeError::bounds_error("array index out of bounds"))
        }
        Value::Table(t) => {
            let k = TableKey::try_new(key).map_err(|_| NativeError::type_error("invalid table key"))?;
            vm.heap.get_table_mut(t).insert(k, value);
            Ok(())
        }
        Value::Namespace(n) => {
            let Value::String(s) = key else {
                return Err(NativeError::type_error("namespace key must be a string"));
            };
            vm.heap.get_namespace_mut(n).set(s, value);
            Ok(())
        }
        Value::Instance(i) => {
            let Value::String(s) = key else {
                return Err(NativeError::type_error("instance field key must be a string"));
            };
            if vm.heap.get_instance_mut(i).set_field(s, value) {
                Ok(())
            } else {
                Err(NativeError::field_error("no such field"))
            }
        }
        _ => Err(NativeError::type_error("value does not support index assignment")),
    }
}

fn do_slice(vm: &mut Vm, container: Value, lo: i64, hi: i64) -> Result<Value, NativeError> {
    match container {
        Value::Array(a) => {
            let values = vm
                .heap
                .get_array(a)
                .slice(lo, hi)
                .map_err(|_| NativeError::bounds_error("slice out of bounds"))?;
            Ok(Value::Array(vm.alloc_array(values)))
        }
        Value::String(s) => {
            let text = vm.heap.get_string(s).as_str().to_string();
            let chars: Vec<char> = text.chars().collect();
            let len = chars.len() as i64;
            let lo = if lo < 0 { lo + len } else { lo }.clamp(0, len);
            let hi = if hi < 0 { hi + len } else { hi }.clamp(0, len);
            if lo > hi {
                return Err(NativeError::bounds_error("slice out of bounds"));
            }
            let slice: String = chars[lo as usize..hi as usize].iter().collect();
            Ok(Value::String(vm.heap.intern_string(&slice)))
        }
        _ => Err(NativeError::type_error("value is not sliceable")),
    }
}

/// Default reflective iterator (the opApply-style supplement): arrays
/// enumerate by index, tables/namespaces/instances by an arbitrary but
/// stable key order.
fn next_foreach(vm: &Vm, container: Value, idx: i64) -> Option<(Value, Value)> {
    match container {
        Value::Array(a) => {
            let v = vm.heap.get_array(a).get(idx).ok()?;
            Some((Value::Int(idx), v))
        }
        Value::Table(t) => vm.heap.get_table(t).iter().nth(idx as usize).map(|(k, v)| (k.0, *v)),
        Value::Namespace(n) => vm
            .heap
            .get_namespace(n)
            .iter()
            .nth(idx as usize)
            .map(|(k, v)| (Value::String(*k), *v)),
        _ => None,
    }
}

pub(crate) fn lookup_method(
    vm: &Vm,
    obj: Value,
    name: GcRef<croc_core::objects::strings::StringObj>,
) -> Option<Value> {
    let class = match obj {
        Value::Instance(i) => vm.heap.get_instance(i).class,
        Value::Class(c) => c,
        _ => return None,
    };
    let mut cur = Some(class);
    while let Some(c) = cur {
        if let Some(m) = vm.heap.get_class(c).own_method(name) {
            return Some(m);
        }
        cur = vm.heap.get_class(c).parent;
    }
    None
}

fn instantiate_fields(vm: &mut Vm, class: GcRef<croc_core::objects::class::ClassObj>) -> croc_core::objects::instance::InstanceObj {
    use std::collections::HashMap;
    let mut fields = HashMap::new();
    let mut hidden = HashMap::new();
    let mut cur = Some(class);
    while let Some(c) = cur {
        for (&k, &v) in vm.heap.get_class(c).fields_iter() {
            fields.entry(k).or_insert(v);
        }
        for (&k, &v) in vm.heap.get_class(c).hidden_iter() {
            hidden.entry(k).or_insert(v);
        }
        cur = vm.heap.get_class(c).parent;
    }
    croc_core::objects::instance::InstanceObj::new(class, fields, hidden)
}

fn read_upvalue(vm: &Vm, thread: GcRef<ThreadObj>, idx: u32) -> Value {
    let func = vm.heap.get_thread(thread).frames.last().unwrap().func;
    match vm.heap.get_function(func) {
        FunctionObj::Native { upvals, .. } => upvals[idx as usize],
        FunctionObj::Script { upvals, .. } => {
            let uv = upvals[idx as usize];
            let owner = vm.heap.get_upvalue(uv).thread;
            vm.heap.get_upvalue(uv).get(&vm.heap.get_thread(owner).stack)
        }
    }
}

fn write_upvalue(vm: &mut Vm, thread: GcRef<ThreadObj>, idx: u32, value: Value) {
    let func = vm.heap.get_thread(thread).frames.last().unwrap().func;
    match vm.heap.get_function(func) {
        FunctionObj::Native { .. } => {}
        FunctionObj::Script { upvals, .. } => {
            let uv = upvals[idx as usize];
            let owner = vm.heap.get_upvalue(uv).thread;
            let owner_stack_ptr: *mut Vec<Value> = &mut vm.heap.get_thread_mut(owner).stack;
            // Safety: `owner` and the upvalue handle are distinct heap
            // slots from `uv` itself; we only ever hold one `&mut Heap`
            // borrow at a time via raw pointer indirection here because
            // `get_upvalue`/`get_thread_mut` can't be expressed as two
            // simultaneous borrows through the typed accessors.
            let stack = unsafe { &mut *owner_stack_ptr };
            vm.heap.get_upvalue(uv).set(stack, value);
        }
    }
}

/// Close every open upvalue pointing at `from_index` or later in
/// `thread`'s stack (§4.4, run when a scope or the whole frame whose
/// locals they captured is popped).
fn close_upvalues_from(vm: &mut Vm, thread: GcRef<ThreadObj>, from_index: u32) {
    let open: Vec<_> = vm
        .heap
        .get_thread(thread)
        .open_upvalues
        .iter()
        .copied()
        .filter(|&u| vm.heap.get_upvalue(u).open_index().is_some_and(|i| i >= from_index))
        .collect();
    for uv in &open {
        let stack = vm.heap.get_thread(thread).stack.clone();
        vm.heap.get_upvalue(*uv).close(&stack);
    }
    vm.heap
        .get_thread_mut(thread)
        .open_upvalues
        .retain(|u| vm.heap.get_upvalue(*u).is_open());
}

fn make_closure(vm: &mut Vm, thread: GcRef<ThreadObj>, outer_funcdef: GcRef<FuncDefObj>, inner_idx: u32) -> Value {
    // The inner `FuncDef` needs stable heap identity across every
    // `Closure` execution that targets it (§4.4) — allocate it once per
    // outer `FuncDefObj` and remember the handle, rather than a fresh
    // `FuncDefObj` per visit.
    let inner_handle = match vm.heap.get_funcdef(outer_funcdef).inner_handles[inner_idx as usize].get() {
        Some(handle) => handle,
        None => {
            let inner_def = vm.heap.get_funcdef(outer_funcdef).def.inner[inner_idx as usize].clone();
            let handle = vm
                .heap
                .alloc::<FuncDefObj>(croc_core::heap::GcObject::FuncDef(FuncDefObj::new(inner_def)), 128);
            vm.heap.get_funcdef(outer_funcdef).inner_handles[inner_idx as usize].set(Some(handle));
            handle
        }
    };
    let cacheable = vm.heap.get_funcdef(inner_handle).is_cacheable();

    if cacheable {
        if let Some(cached) = vm.heap.get_funcdef(inner_handle).cached_closure.get() {
            return Value::Function(cached);
        }
    }

    let inner_def = vm.heap.get_funcdef(inner_handle).def.clone();
    // Inherit the enclosing function's own environment namespace (§3.2:
    // Function "carries an environment Namespace") rather than hardcoding
    // the globals — a closure created inside another closure's body lives
    // in that closure's environment, not necessarily the VM's root.
    let env = match vm.heap.get_function(vm.heap.get_thread(thread).frames.last().unwrap().func) {
        FunctionObj::Script { env, .. } => *env,
        FunctionObj::Native { .. } => vm.globals,
    };
    let base = base_of(vm, thread);
    let upvals: Vec<GcRef<UpvalueObj>> = inner_def
        .upvals
        .iter()
        .map(|desc| match desc {
            UpvalSource::ParentLocal(i) => open_upvalue(vm, thread, base + i),
            UpvalSource::ParentUpval(i) => {
                let func = vm.heap.get_thread(thread).frames.last().unwrap().func;
                match vm.heap.get_function(func) {
                    FunctionObj::Script { upvals, .. } => upvals[*i as usize],
                    FunctionObj::Native { .. } => unreachable!("native functions have no ParentUpval captures"),
                }
            }
        })
        .collect();

    let closure = FunctionObj::Script {
        funcdef: inner_handle,
        upvals,
        env,
    };
    let handle = vm.heap.alloc(croc_core::heap::GcObject::Function(closure), 64);
    if cacheable {
        vm.heap.get_funcdef(inner_handle).cached_closure.set(Some(handle));
    }
    Value::Function(handle)
}

fn open_upvalue(vm: &mut Vm, thread: GcRef<ThreadObj>, stack_index: u32) -> GcRef<UpvalueObj> {
    if let Some(existing) = vm
        .heap
        .get_thread(thread)
        .find_open_upvalue(stack_index, |u| vm.heap.get_upvalue(u).open_index())
    {
        return existing;
    }
    let uv = vm.heap.alloc(
        croc_core::heap::GcObject::Upvalue(UpvalueObj::open(thread, stack_index)),
        24,
    );
    vm.heap.get_thread_mut(thread).open_upvalues.push(uv);
    uv
}

fn collect_args(vm: &Vm, thread: GcRef<ThreadObj>, base: u32, count: Option<u32>) -> Vec<Value> {
    let b = base_of(vm, thread);
    let t = vm.heap.get_thread(thread);
    let n = count.unwrap_or((t.stack.len() as u32).saturating_sub(b + base));
    (0..n).map(|i| t.stack[(b + base + i) as usize]).collect()
}

fn do_call(
    vm: &mut Vm,
    classes: &ExceptionClasses,
    thread: GcRef<ThreadObj>,
    func_slot: u32,
    nargs: u32,
    nresults: Option<u32>,
) -> Step {
    let callee = slot(vm, thread, func_slot);
    let Value::Function(func) = callee else {
        return throw_native(vm, classes, thread, NativeError::type_error("value is not callable"));
    };

    let args_base = base_of(vm, thread) + func_slot + 1;
    let arity_ok = match vm.heap.get_function(func) {
        FunctionObj::Script { funcdef, .. } => {
            let def = &vm.heap.get_funcdef(*funcdef).def;
            nargs >= def.num_params && (def.is_vararg || nargs <= def.max_params)
        }
        FunctionObj::Native { .. } => true,
    };
    if !arity_ok {
        return throw_native(vm, classes, thread, NativeError::new(ErrorKind::ValueError, "wrong number of arguments"));
    }

    let (vararg_base, vararg_count) = vararg_region(vm, func, args_base, nargs);
    vm.heap.get_thread_mut(thread).frames.push(CallFrame {
        func,
        base: args_base,
        pc: 0,
        nresults,
        vararg_base,
        vararg_count,
    });
    Step::Continue
}

fn return_from(vm: &mut Vm, thread: GcRef<ThreadObj>, results: Vec<Value>, depth: usize) -> Step {
    let frame_base = vm.heap.get_thread(thread).frames[depth].base;
    close_upvalues_from(vm, thread, frame_base);
    vm.heap.get_thread_mut(thread).frames.truncate(depth);
    vm.heap.get_thread_mut(thread).stack.truncate(frame_base as usize);
    vm.heap.get_thread_mut(thread).results = results.clone();

    if let Some(caller) = vm.heap.get_thread(thread).frames.last() {
        let want = caller.nresults;
        let dst = frame_base.saturating_sub(1);
        let trimmed = match want {
            Some(n) => {
                let mut r = results;
                r.resize(n as usize, Value::Null);
                r
            }
            None => results,
        };
        for (i, v) in trimmed.into_iter().enumerate() {
            set_slot_absolute(vm, thread, dst + i as u32, v);
        }
    }
    Step::Returned(depth)
}

fn set_slot_absolute(vm: &mut Vm, thread: GcRef<ThreadObj>, abs: u32, v: Value) {
    let t = vm.heap.get_thread_mut(thread);
    if abs as usize >= t.stack.len() {
        t.stack.resize(abs as usize + 1, Value::Null);
    }
    t.stack[abs as usize] = v;
}

fn do_return(vm: &mut Vm, thread: GcRef<ThreadObj>, base: u32, count: Option<u32>) -> Step {
    let depth = vm.heap.get_thread(thread).frames.len() - 1;
    let results = collect_args(vm, thread, base, count);
    return_from(vm, thread, results, depth)
}

fn push_try(
    vm: &mut Vm,
    thread: GcRef<ThreadObj>,
    handler_pc: u32,
    catch_class: Option<GcRef<croc_core::objects::class::ClassObj>>,
    exc_slot: u32,
    is_finally: bool,
) {
    let t = vm.heap.get_thread(thread);
    let frame_index = (t.frames.len() - 1) as u32;
    let stack_depth = t.stack.len() as u32;
    vm.heap.get_thread_mut(thread).try_stack.push(TryRecord {
        frame_index,
        stack_depth,
        handler_pc,
        is_finally,
        exc_slot,
        catch_class,
    });
}

fn call_native(
    vm: &mut Vm,
    classes: &ExceptionClasses,
    thread: GcRef<ThreadObj>,
    func: croc_core::objects::function::NativeFn,
) -> Step {
    let nargs = {
        let t = vm.heap.get_thread(thread);
        (t.stack.len() as u32).saturating_sub(t.frames.last().unwrap().base)
    };
    vm.heap.get_thread_mut(thread).native_call_depth += 1;
    let result = func(vm, thread, nargs);
    vm.heap.get_thread_mut(thread).native_call_depth -= 1;
    match result {
        Ok(nresults) => {
            let depth = vm.heap.get_thread(thread).frames.len() - 1;
            let base = vm.heap.get_thread(thread).frames[depth].base;
            let results = (0..nresults)
                .map(|i| vm.heap.get_thread(thread).stack[(base + i) as usize])
                .collect();
            return_from(vm, thread, results, depth)
        }
        Err(e) => {
            let exc = exceptions::instantiate(vm, classes, e);
            raise(vm, classes, thread, exc)
        }
    }
}

/// End-to-end scenarios driven straight off hand-assembled `FuncDef`s — the
/// bytecode emitter is out of scope here, so these stand in for what would
/// otherwise be compiled source (§8's testable properties).
#[cfg(test)]
mod scenario_tests {
    use super::*;
    use croc_core::bytecode::{DebugInfo, FuncDef};
    use croc_core::heap::GcObject;

    fn setup() -> (Vm, ExceptionClasses, GcRef<ThreadObj>) {
        let mut vm = Vm::new(1 << 20);
        let classes = exceptions::bootstrap(&mut vm);
        let thread = vm.main_thread;
        (vm, classes, thread)
    }

    fn alloc_script_fn(vm: &mut Vm, def: FuncDef) -> GcRef<FunctionObj> {
        let funcdef = vm.heap.alloc(GcObject::FuncDef(FuncDefObj::new(def)), 128);
        vm.heap.alloc(
            GcObject::Function(FunctionObj::Script { funcdef, upvals: Vec::new(), env: vm.globals }),
            64,
        )
    }

    fn bare_def(name: &str, num_params: u32, num_locals: u32, constants: Vec<Constant>, code: Vec<Instruction>) -> FuncDef {
        FuncDef {
            name: name.into(),
            num_params,
            max_params: num_params,
            is_vararg: false,
            num_locals,
            constants,
            code,
            upvals: Vec::new(),
            inner: Vec::new(),
            param_type_masks: Vec::new(),
            switch_tables: Vec::new(),
            debug: DebugInfo::default(),
        }
    }

    /// S1: recursive fibonacci, called through a global binding so the
    /// recursive leg exercises `GetGlobal` + `Call` rather than just
    /// straight-line arithmetic.
    #[test]
    fn recursive_fibonacci_through_a_global_binding() {
        let (mut vm, classes, thread) = setup();

        let def = bare_def(
            "fib",
            1,
            13,
            vec![
                Constant::Int(2),
                Constant::Int(-1),
                Constant::String("fib".into()),
                Constant::Int(1),
            ],
            vec![
                Instruction::LoadConst { dst: 1, konst: 0 },
                Instruction::Cmp { dst: 2, lhs: 0, rhs: 1 },
                Instruction::LoadConst { dst: 3, konst: 1 },
                Instruction::Eq { dst: 4, lhs: 2, rhs: 3 },
                Instruction::JmpIfNot { cond: 4, target: 7 },
                Instruction::Move { dst: 5, src: 0 },
                Instruction::Return { base: 5, count: Some(1) },
                Instruction::GetGlobal { dst: 6, name: 2 },
                Instruction::LoadConst { dst: 8, konst: 3 },
                Instruction::Sub { dst: 7, lhs: 0, rhs: 8 },
                Instruction::Call { func: 6, nargs: 1, nresults: Some(1) },
                Instruction::GetGlobal { dst: 9, name: 2 },
                Instruction::LoadConst { dst: 11, konst: 0 },
                Instruction::Sub { dst: 10, lhs: 0, rhs: 11 },
                Instruction::Call { func: 9, nargs: 1, nresults: Some(1) },
                Instruction::Add { dst: 12, lhs: 6, rhs: 9 },
                Instruction::Return { base: 12, count: Some(1) },
            ],
        );
        let func = alloc_script_fn(&mut vm, def);
        let name = vm.heap.intern_string("fib");
        vm.heap.get_namespace_mut(vm.globals).set(name, Value::Function(func));

        let outcome = call_sync(&mut vm, &classes, thread, func, vec![Value::Int(20)]);
        match outcome {
            Outcome::Returned(results) => assert_eq!(results, vec![Value::Int(6765)]),
            _ => panic!("expected fib(20) to return"),
        }
    }

    /// S2: two closures over the same outer local share one upvalue cell
    /// (§4.4) — incrementing through one is visible through the other,
    /// even after the outer frame that created them has returned.
    #[test]
    fn two_closures_share_one_captured_upvalue_cell() {
        let (mut vm, classes, thread) = setup();

        let mut inc_def = bare_def(
            "inc",
            0,
            2,
            vec![Constant::Int(1)],
            vec![
                Instruction::GetUpval { dst: 0, upval: 0 },
                Instruction::LoadConst { dst: 1, konst: 0 },
                Instruction::Add { dst: 0, lhs: 0, rhs: 1 },
                Instruction::SetUpval { upval: 0, src: 0 },
                Instruction::Return { base: 0, count: Some(0) },
            ],
        );
        inc_def.upvals.push(UpvalSource::ParentLocal(0));

        let mut get_def = bare_def(
            "get",
            0,
            1,
            vec![],
            vec![
                Instruction::GetUpval { dst: 0, upval: 0 },
                Instruction::Return { base: 0, count: Some(1) },
            ],
        );
        get_def.upvals.push(UpvalSource::ParentLocal(0));

        let mut make_def = bare_def(
            "make",
            0,
            3,
            vec![Constant::Int(0)],
            vec![
                Instruction::LoadConst { dst: 0, konst: 0 },
                Instruction::Closure { dst: 1, funcdef: 0 },
                Instruction::Closure { dst: 2, funcdef: 1 },
                Instruction::Return { base: 1, count: Some(2) },
            ],
        );
        make_def.inner = vec![inc_def, get_def];

        let make_func = alloc_script_fn(&mut vm, make_def);
        let results = match call_sync(&mut vm, &classes, thread, make_func, vec![]) {
            Outcome::Returned(r) => r,
            _ => panic!("expected make() to return a pair of closures"),
        };
        let (Value::Function(inc_func), Value::Function(get_func)) = (results[0], results[1]) else {
            panic!("expected two closures back");
        };

        call_sync(&mut vm, &classes, thread, inc_func, vec![]);
        call_sync(&mut vm, &classes, thread, inc_func, vec![]);
        let counted = match call_sync(&mut vm, &classes, thread, get_func, vec![]) {
            Outcome::Returned(r) => r,
            _ => panic!("expected get() to return"),
        };
        assert_eq!(counted, vec![Value::Int(2)]);
    }

    /// S3: a coroutine that yields three values in turn, driven by
    /// `scheduler::resume` through `Initial` -> `Suspended` (x3) -> `Dead`.
    #[test]
    fn coroutine_yields_in_sequence_then_returns() {
        let (mut vm, classes, thread) = setup();

        let def = bare_def(
            "producer",
            0,
            1,
            vec![Constant::Int(1), Constant::Int(2), Constant::Int(3)],
            vec![
                Instruction::LoadConst { dst: 0, konst: 0 },
                Instruction::Yield { base: 0, count: Some(1), nresults: Some(0) },
                Instruction::LoadConst { dst: 0, konst: 1 },
                Instruction::Yield { base: 0, count: Some(1), nresults: Some(0) },
                Instruction::LoadConst { dst: 0, konst: 2 },
                Instruction::Yield { base: 0, count: Some(1), nresults: Some(0) },
                Instruction::Return { base: 0, count: Some(0) },
            ],
        );
        let func = alloc_script_fn(&mut vm, def);
        let coro = crate::scheduler::create(&mut vm, func);

        for expected in [1i64, 2, 3] {
            match crate::scheduler::resume(&mut vm, &classes, thread, coro, vec![]) {
                Ok(crate::scheduler::ResumeOutcome::Yielded(values)) => {
                    assert_eq!(values, vec![Value::Int(expected)]);
                }
                other => panic!("expected a yield of {expected}, got {other:?}"),
            }
            assert_eq!(crate::scheduler::status(&vm, coro), croc_core::objects::thread::ThreadState::Suspended);
        }

        match crate::scheduler::resume(&mut vm, &classes, thread, coro, vec![]) {
            Ok(crate::scheduler::ResumeOutcome::Returned(values)) => assert!(values.is_empty()),
            other => panic!("expected the coroutine to return, got {other:?}"),
        }
        assert_eq!(crate::scheduler::status(&vm, coro), croc_core::objects::thread::ThreadState::Dead);
    }

    /// S4: an exception thrown while a `finally` block is unwinding from a
    /// prior one carries that prior exception as its `cause` (§4.7, §8
    /// property 8).
    #[test]
    fn exception_from_a_finally_block_chains_the_prior_as_its_cause() {
        let (mut vm, classes, thread) = setup();

        let def = bare_def(
            "tryFinally",
            2,
            2,
            vec![],
            vec![
                Instruction::PushFinally { handler: 2 },
                Instruction::Throw { src: 0 },
                Instruction::Throw { src: 1 },
            ],
        );
        let func = alloc_script_fn(&mut vm, def);

        let first = exceptions::instantiate(&mut vm, &classes, NativeError::new(ErrorKind::ValueError, "first"));
        let second = exceptions::instantiate(&mut vm, &classes, NativeError::new(ErrorKind::StateError, "second"));

        let outcome = call_sync(&mut vm, &classes, thread, func, vec![first, second]);
        let escaped = match outcome {
            Outcome::Threw(exc) => exc,
            _ => panic!("expected the finally block's throw to escape uncaught"),
        };
        assert_eq!(escaped, second);
        let Value::Instance(handle) = escaped else {
            panic!("expected an instance");
        };
        assert_eq!(vm.heap.get_instance(handle).get_field(classes.cause_field()), Some(first));
    }

    /// S5: a weak reference observes its referent being collected once
    /// nothing else roots it, but survives the same collection itself by
    /// being pinned directly.
    #[test]
    fn weak_reference_is_cleared_once_its_referent_is_collected() {
        let (mut vm, classes, thread) = setup();
        let _ = (classes, thread);

        let table = vm.alloc_table();
        let weak = vm.heap.weak_ref_to(Value::Table(table)).expect("table is a reference type");
        let pin = vm.pin(Value::WeakRef(weak));

        vm.collect_garbage();

        assert_eq!(vm.heap.get_weak_ref(weak).deref(), None);
        vm.unpin(pin);
    }

    /// §4.6 arithmetic contract: Int/Int division stays Int (wraps, no
    /// promotion to Float), distinct from Int/Float division.
    #[test]
    fn integer_division_stays_integer() {
        let (mut vm, classes, thread) = setup();

        let def = bare_def(
            "divide",
            2,
            1,
            vec![],
            vec![
                Instruction::Div { dst: 2, lhs: 0, rhs: 1 },
                Instruction::Return { base: 2, count: Some(1) },
            ],
        );
        let func = alloc_script_fn(&mut vm, def);
        let result = match call_sync(&mut vm, &classes, thread, func, vec![Value::Int(7), Value::Int(2)]) {
            Outcome::Returned(r) => r,
            _ => panic!("expected 7 / 2 to return"),
        };
        assert_eq!(result, vec![Value::Int(3)]);
    }

    /// §4.6 vararg handling / Call contract: arguments beyond a vararg
    /// function's declared parameters land in the vararg region and are
    /// readable back out through the `Vararg` instruction.
    #[test]
    fn vararg_instruction_reads_overflow_arguments() {
        let (mut vm, classes, thread) = setup();

        let mut def = bare_def(
            "sumExtra",
            1,
            4,
            vec![],
            vec![
                Instruction::Vararg { dst: 1, count: Some(2) },
                Instruction::Add { dst: 3, lhs: 1, rhs: 2 },
                Instruction::Return { base: 3, count: Some(1) },
            ],
        );
        def.is_vararg = true;
        def.max_params = 1;
        let func = alloc_script_fn(&mut vm, def);

        let result = match call_sync(
            &mut vm,
            &classes,
            thread,
            func,
            vec![Value::Int(100), Value::Int(4), Value::Int(5)],
        ) {
            Outcome::Returned(r) => r,
            _ => panic!("expected sumExtra(100, 4, 5) to return"),
        };
        assert_eq!(result, vec![Value::Int(9)]);
    }

    /// A vararg read past the actual number of supplied overflow
    /// arguments pads with `Null` rather than reading stale stack slots.
    #[test]
    fn vararg_instruction_pads_missing_values_with_null() {
        let (mut vm, classes, thread) = setup();

        let mut def = bare_def(
            "firstExtra",
            0,
            3,
            vec![],
            vec![
                Instruction::Vararg { dst: 0, count: Some(2) },
                Instruction::Return { base: 0, count: Some(2) },
            ],
        );
        def.is_vararg = true;
        let func = alloc_script_fn(&mut vm, def);

        let result = match call_sync(&mut vm, &classes, thread, func, vec![Value::Int(9)]) {
            Outcome::Returned(r) => r,
            _ => panic!("expected firstExtra(9) to return"),
        };
        assert_eq!(result, vec![Value::Int(9), Value::Null]);
    }

    /// §4.4: closing a cacheable `FuncDef` a second time returns the same
    /// `Function` instead of allocating a fresh one.
    #[test]
    fn cacheable_closure_is_reused_across_repeated_closure_instructions() {
        let (mut vm, classes, thread) = setup();

        let inner_def = bare_def("callee", 0, 1, vec![Constant::Int(1)], vec![
            Instruction::LoadConst { dst: 0, konst: 0 },
            Instruction::Return { base: 0, count: Some(1) },
        ]);

        let mut outer_def = bare_def(
            "makeTwice",
            0,
            3,
            vec![],
            vec![
                Instruction::Closure { dst: 0, funcdef: 0 },
                Instruction::Closure { dst: 1, funcdef: 0 },
                Instruction::Return { base: 0, count: Some(2) },
            ],
        );
        outer_def.inner = vec![inner_def];
        let outer_func = alloc_script_fn(&mut vm, outer_def);

        let results = match call_sync(&mut vm, &classes, thread, outer_func, vec![]) {
            Outcome::Returned(r) => r,
            _ => panic!("expected makeTwice() to return a pair of closures"),
        };
        let (Value::Function(a), Value::Function(b)) = (results[0], results[1]) else {
            panic!("expected two closures back");
        };
        assert_eq!(a.slot(), b.slot(), "a cacheable FuncDef's closure must be reused, not reallocated");
    }
}
