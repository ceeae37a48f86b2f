//! VM tuning knobs (§5 "Resource model"): the GC threshold, the value
//! stack's reserved capacity and a watchdog deadline, all overridable from
//! the environment the way the teacher's own `Config` reads
//! `CEM3_*`-prefixed variables at startup rather than requiring a config
//! file for the common case.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Bytes allocated before `Vm::collect_if_needed` triggers a pass
    /// (§4.2).
    pub gc_threshold: usize,
    /// Stack slots reserved up front on a freshly spawned thread, purely
    /// an allocation-avoidance hint — `ThreadObj::stack` still grows past
    /// this if a call nests deeper. Also handed to `fiber::spawn` as the
    /// backing `may::coroutine`'s stack size in bytes when a coroutine
    /// runs under the extended scheduler variant.
    pub stack_reserve: usize,
    /// If set, a background watchdog raises the uncatchable halt (§4.7,
    /// §5) on any thread still running after this many seconds —
    /// embedding hosts that can't trust script authors to terminate.
    pub watchdog: Option<Duration>,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            gc_threshold: 1 << 20,
            stack_reserve: 256,
            watchdog: None,
        }
    }
}

impl VmConfig {
    /// Start from defaults, then apply `CROC_GC_THRESHOLD` (bytes),
    /// `CROC_STACK_SIZE` (slots) and `CROC_WATCHDOG_SECS` (seconds, `0`
    /// disables) if set. An unparseable value is ignored rather than
    /// rejected outright — a typo'd env var shouldn't stop the VM from
    /// opening at all.
    pub fn from_env() -> Self {
        let mut cfg = VmConfig::default();
        if let Some(v) = env_usize("CROC_GC_THRESHOLD") {
            cfg.gc_threshold = v;
        }
        if let Some(v) = env_usize("CROC_STACK_SIZE") {
            cfg.stack_reserve = v;
        }
        if let Some(v) = env_usize("CROC_WATCHDOG_SECS") {
            cfg.watchdog = if v == 0 { None } else { Some(Duration::from_secs(v as u64)) };
        }
        cfg
    }
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_nonzero_and_watchdog_off() {
        let cfg = VmConfig::default();
        assert!(cfg.gc_threshold > 0);
        assert!(cfg.stack_reserve > 0);
        assert_eq!(cfg.watchdog, None);
    }

    #[test]
    fn unparseable_env_value_is_ignored() {
        // SAFETY: test-only env mutation, single-threaded within this test.
        unsafe { env::set_var("CROC_GC_THRESHOLD", "not-a-number") };
        let cfg = VmConfig::from_env();
        assert_eq!(cfg.gc_threshold, VmConfig::default().gc_threshold);
        unsafe { env::remove_var("CROC_GC_THRESHOLD") };
    }

    #[test]
    fn watchdog_secs_zero_disables() {
        unsafe { env::set_var("CROC_WATCHDOG_SECS", "0") };
        let cfg = VmConfig::from_env();
        assert_eq!(cfg.watchdog, None);
        unsafe { env::remove_var("CROC_WATCHDOG_SECS") };
    }
}
