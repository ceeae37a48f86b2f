//! Bytecode dispatch, exception unwinding, coroutine scheduling, and the
//! wire formats built on top of `croc-core`'s value representation and
//! heap.
//!
//! `croc-core` owns what every consumer of a [`croc_core::vm::Vm`] must
//! agree on; this crate is the thing that actually drives one forward —
//! [`interpreter::run`] for bytecode dispatch, [`scheduler`] for
//! cooperative coroutines on top of it, [`exceptions`] for the built-in
//! error class hierarchy, and [`serialize`]/[`module_format`] for the two
//! wire formats a host needs (arbitrary object graphs, and compiled
//! module bodies).

pub mod config;
pub mod embed;
pub mod exceptions;
pub mod fiber;
pub mod funcdef_wire;
pub mod interpreter;
pub mod module_format;
pub mod scheduler;
pub mod serialize;
pub mod wire;

#[cfg(feature = "diagnostics")]
pub mod diagnostics;

pub use config::VmConfig;
pub use embed::{CrocVm, Stack};
pub use exceptions::ExceptionClasses;
pub use fiber::Fiber;
pub use interpreter::Outcome;
pub use module_format::ModuleFormatError;
pub use scheduler::{ResumeError, ResumeOutcome, SchedulerStats};
pub use serialize::{NoTransients, SerializeError, Transients};
pub use wire::{Reader, Truncated, Writer};
