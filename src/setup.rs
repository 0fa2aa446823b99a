//! One-shot main-process setup
//!
//! Runs once in the harness parent before any sandbox profile: signal
//! policy, the fault handler, and a private scratch directory the whole
//! process tree works under.

use crate::fault;
use crate::types::{HarnessError, Result};
use nix::unistd::{chdir, mkdtemp};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

/// Install signal policy, arm the fault handler, and move into a fresh
/// randomised scratch directory. Everything the run creates lives under
/// the scratch tree.
pub fn setup_main_process() -> Result<PathBuf> {
    reset_internal_signals();
    fault::install_handler()?;

    let scratch = mkdtemp("./syzkaller.XXXXXX")
        .map_err(|e| HarnessError::Setup(format!("failed to mkdtemp: {}", e)))?;
    fs::set_permissions(&scratch, fs::Permissions::from_mode(0o777))
        .map_err(|e| HarnessError::Setup(format!("failed to chmod: {}", e)))?;
    chdir(&scratch).map_err(|e| HarnessError::Setup(format!("failed to chdir: {}", e)))?;
    Ok(scratch)
}

/// Reset glibc's internal cancellation/setxid signals (0x20/0x21) to
/// ignore. A stray cancellation signal delivered to the main thread makes
/// it exit without bringing the group down. The numbers sit outside the
/// portable signal range, so registration goes through the raw syscall;
/// the kernel only reads the handler and flag words it needs.
fn reset_internal_signals() {
    let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
    sa.sa_sigaction = libc::SIG_IGN;
    for sig in [0x20, 0x21] {
        unsafe {
            libc::syscall(
                libc::SYS_rt_sigaction,
                sig,
                &sa as *const libc::sigaction,
                std::ptr::null_mut::<libc::sigaction>(),
                8usize,
            );
        }
    }
}
