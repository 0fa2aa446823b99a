//! Guarded regions for synchronous memory faults
//!
//! Test programs routinely hand bogus pointers to syscalls, and some of
//! those pointers are dereferenced in user space (helper path construction,
//! mount option assembly). A guarded region converts SIGSEGV/SIGBUS inside
//! it from process termination into a non-local exit just past the region;
//! a fault outside any region still terminates the process with the signal
//! number as exit code.

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::cell::UnsafeCell;
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::types::{HarnessError, Result};

/// Oversized for any libc's jmp_buf (glibc x86_64 needs 200 bytes,
/// aarch64 312); 16-byte alignment satisfies every ABI the harness runs on.
#[repr(C, align(16))]
struct JmpBuf([u64; 64]);

extern "C" {
    fn _setjmp(env: *mut JmpBuf) -> libc::c_int;
    fn _longjmp(env: *mut JmpBuf, val: libc::c_int) -> !;
}

thread_local! {
    // Const-initialized so the fault handler never triggers lazy TLS setup.
    static GUARD_DEPTH: AtomicU32 = const { AtomicU32::new(0) };
    static RECOVERY: UnsafeCell<JmpBuf> = const { UnsafeCell::new(JmpBuf([0; 64])) };
}

/// Handler for SIGSEGV and SIGBUS. Atomic load and jump only; no
/// allocation, no locking. The signal is synchronous, so the handler runs
/// on the thread whose guard state it inspects.
extern "C" fn fault_handler(sig: libc::c_int, _info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    let depth = GUARD_DEPTH.with(|d| d.load(Ordering::Relaxed));
    if depth > 0 {
        let env = RECOVERY.with(|r| r.get());
        unsafe { _longjmp(env, 1) };
    }
    unsafe { libc::_exit(sig) };
}

/// Install the process-wide fault handler for SIGSEGV and SIGBUS.
///
/// SA_NODEFER keeps the signals unmasked during handling so a fault raised
/// while recovering is not silently queued.
pub fn install_handler() -> Result<()> {
    let action = SigAction::new(
        SigHandler::SigAction(fault_handler),
        SaFlags::SA_NODEFER | SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGSEGV, &action)
            .map_err(|e| HarnessError::Setup(format!("sigaction(SIGSEGV) failed: {}", e)))?;
        sigaction(Signal::SIGBUS, &action)
            .map_err(|e| HarnessError::Setup(format!("sigaction(SIGBUS) failed: {}", e)))?;
    }
    Ok(())
}

/// Current nesting depth of guarded regions on this thread. Zero whenever
/// the thread is outside every guarded region.
pub fn guard_depth() -> u32 {
    GUARD_DEPTH.with(|d| d.load(Ordering::SeqCst))
}

/// Run `f`; if a synchronous memory fault is raised during its execution,
/// abandon the rest of `f` and return as if it had completed. Work done by
/// `f` before the fault stays committed. Nested guards are supported: the
/// innermost recovery point wins, and the enclosing guard's point is
/// restored when the inner region exits.
pub fn guard<F: FnOnce()>(f: F) {
    // Counter first, recovery point second: the handler treats a positive
    // counter as permission to use the recovery point.
    GUARD_DEPTH.with(|d| d.fetch_add(1, Ordering::SeqCst));
    let env: *mut JmpBuf = RECOVERY.with(|r| r.get());
    let outer = JmpBuf(unsafe { (*env).0 });

    // On a fault the closure is abandoned mid-flight, so its eventual drop
    // cannot be allowed to run twice; leak it on the recovery path instead.
    let mut body = ManuallyDrop::new(f);

    // The save must happen in this frame: it stays live while `f` runs,
    // which is what makes the jump target valid.
    if unsafe { _setjmp(env) } == 0 {
        let body = unsafe { ManuallyDrop::take(&mut body) };
        body();
    }

    unsafe { (*env).0 = outer.0 };
    GUARD_DEPTH.with(|d| d.fetch_sub(1, Ordering::SeqCst));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Once;

    static INSTALL: Once = Once::new();

    fn ensure_handler() {
        INSTALL.call_once(|| install_handler().expect("fault handler install failed"));
    }

    fn fault_now() {
        unsafe { std::ptr::read_volatile(0x1 as *const u8) };
    }

    // State observed after a recovered fault lives in atomics: the jump
    // restores registers, so only stores that reached memory count.

    #[test]
    fn test_guard_recovers_from_fault() {
        ensure_handler();
        let before = AtomicBool::new(false);
        let after = AtomicBool::new(false);
        guard(|| {
            before.store(true, Ordering::SeqCst);
            fault_now();
            after.store(true, Ordering::SeqCst);
        });
        assert!(before.load(Ordering::SeqCst), "work before the fault must be committed");
        assert!(!after.load(Ordering::SeqCst), "work after the fault must be skipped");
        assert_eq!(guard_depth(), 0);
    }

    #[test]
    fn test_guard_without_fault_runs_to_completion() {
        ensure_handler();
        let ran = AtomicBool::new(false);
        guard(|| ran.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(guard_depth(), 0);
    }

    #[test]
    fn test_nested_guard_inner_fault_leaves_outer_armed() {
        ensure_handler();
        let outer_tail = AtomicBool::new(false);
        guard(|| {
            guard(|| fault_now());
            // The inner fault must not unwind past the inner region.
            outer_tail.store(true, Ordering::SeqCst);
            // The outer region must still recover its own faults.
            fault_now();
        });
        assert!(outer_tail.load(Ordering::SeqCst));
        assert_eq!(guard_depth(), 0);
    }

    #[test]
    fn test_counter_balanced_across_nesting() {
        ensure_handler();
        assert_eq!(guard_depth(), 0);
        guard(|| {
            assert_eq!(guard_depth(), 1);
            guard(|| {
                assert_eq!(guard_depth(), 2);
                fault_now();
            });
            assert_eq!(guard_depth(), 1);
        });
        assert_eq!(guard_depth(), 0);
    }

    #[test]
    fn test_sequential_guards_after_fault() {
        ensure_handler();
        guard(|| fault_now());
        let second = AtomicBool::new(false);
        guard(|| second.store(true, Ordering::SeqCst));
        assert!(second.load(Ordering::SeqCst));
        assert_eq!(guard_depth(), 0);
    }
}
