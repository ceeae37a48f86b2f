//! Production diagnostics: a SIGQUIT (`kill -3`) handler that dumps heap,
//! GC and scheduler statistics to stderr, the same JVM-thread-dump-style
//! escape hatch the teacher's `diagnostics.rs`/`watchdog.rs` give a
//! running process without stopping it. `CROC_REPORT=json` additionally
//! switches the dump to a `serde_json` object instead of the default
//! human-readable text, mirroring the teacher's `report.rs` format switch.

#![cfg(feature = "diagnostics")]

use std::io::Write;
use std::sync::{Mutex, Once, OnceLock};

use croc_core::Vm;

use crate::scheduler::{self, SchedulerStats};

static SIGNAL_HANDLER_INIT: Once = Once::new();

/// The `Vm` the signal handler dumps on, registered once by the embedder
/// via [`install`]. A `Mutex<*const Vm>` rather than a safe reference
/// because the handler fires from signal context on whatever thread
/// happened to be running — the embedder is responsible for only calling
/// [`install`] on a `Vm` it will keep alive for the rest of the process.
///
/// Safety: the pointee is only ever dereferenced from `dump`, while the
/// `Vm` `install`'s caller registered is still alive, per its contract.
struct VmPtr(*const Vm);
unsafe impl Send for VmPtr {}
static TARGET: OnceLock<Mutex<VmPtr>> = OnceLock::new();

/// Register `vm` as the target of SIGQUIT dumps and install the signal
/// handler (Unix only; a no-op elsewhere). Idempotent — safe to call more
/// than once, though only the first `vm` registered is ever used.
pub fn install(vm: &Vm) {
    TARGET.get_or_init(|| Mutex::new(VmPtr(vm as *const Vm)));

    SIGNAL_HANDLER_INIT.call_once(|| {
        #[cfg(unix)]
        {
            unsafe {
                let _ = signal_hook::low_level::register(signal_hook::consts::SIGQUIT, || {
                    dump();
                });
            }
        }
    });
}

/// Dump diagnostics for the registered `Vm` to stderr. A no-op if
/// [`install`] was never called. Safe to call directly as well as from
/// the signal handler.
pub fn dump() {
    let Some(target) = TARGET.get() else { return };
    let Ok(guard) = target.lock() else { return };
    // Safety: `install`'s contract guarantees the pointee outlives us.
    let vm = unsafe { &*guard.0 };

    let report = collect(vm);
    let mut out = std::io::stderr().lock();
    let text = if use_json() { format_json(&report) } else { format_human(&report) };
    let _ = out.write_all(text.as_bytes());
}

fn use_json() -> bool {
    std::env::var("CROC_REPORT").map(|v| v == "json").unwrap_or(false)
}

#[derive(Debug, Clone)]
struct Report {
    heap_slots: usize,
    heap_bytes: usize,
    gc_collections: u64,
    gc_slots_freed: usize,
    gc_finalizers_pending: usize,
    threads_live: usize,
    scheduler: SchedulerStats,
}

fn collect(vm: &Vm) -> Report {
    Report {
        heap_slots: vm.heap.len(),
        heap_bytes: vm.heap.bytes_allocated,
        gc_collections: vm.gc_stats.collections,
        gc_slots_freed: vm.gc_stats.slots_freed,
        gc_finalizers_pending: vm.gc_stats.finalizers_pending,
        threads_live: vm.thread_count(),
        scheduler: scheduler::stats(vm),
    }
}

fn format_human(r: &Report) -> String {
    let mut out = String::new();
    out.push_str("\n=== Croc Runtime Diagnostics ===\n");
    out.push_str("[Heap]\n");
    out.push_str(&format!("  Slots:       {}\n", r.heap_slots));
    out.push_str(&format!("  Bytes:       {}\n", r.heap_bytes));
    out.push_str("[GC]\n");
    out.push_str(&format!("  Collections: {}\n", r.gc_collections));
    out.push_str(&format!("  Slots freed: {}\n", r.gc_slots_freed));
    out.push_str(&format!("  Finalizers pending: {}\n", r.gc_finalizers_pending));
    out.push_str("[Threads]\n");
    out.push_str(&format!("  Live:        {}\n", r.threads_live));
    out.push_str(&format!("  Spawned:     {}\n", r.scheduler.total_spawned));
    out.push_str(&format!("  Completed:   {}\n", r.scheduler.total_completed));
    out.push_str("=== End Diagnostics ===\n");
    out
}

#[cfg(feature = "report-json")]
fn format_json(r: &Report) -> String {
    let obj = serde_json::json!({
        "heap": { "slots": r.heap_slots, "bytes": r.heap_bytes },
        "gc": {
            "collections": r.gc_collections,
            "slots_freed": r.gc_slots_freed,
            "finalizers_pending": r.gc_finalizers_pending,
        },
        "threads": {
            "live": r.threads_live,
            "spawned": r.scheduler.total_spawned,
            "completed": r.scheduler.total_completed,
        },
    });
    serde_json::to_string(&obj).unwrap_or_else(|_| "{}".into())
}

#[cfg(not(feature = "report-json"))]
fn format_json(r: &Report) -> String {
    format_human(r)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_on_a_fresh_vm_does_not_panic() {
        let vm = Vm::new(1 << 20);
        install(&vm);
        dump();
    }

    #[test]
    fn human_report_mentions_every_section() {
        let vm = Vm::new(1 << 20);
        let text = format_human(&collect(&vm));
        assert!(text.contains("[Heap]"));
        assert!(text.contains("[GC]"));
        assert!(text.contains("[Threads]"));
    }
}
