/// Failure and exit discipline shared by every harness component
///
/// Three fatal operations map to the three supervisor-visible exit classes;
/// the non-fatal debug channel mirrors harness activity to stdout when
/// enabled. Ambient `log` output is separate from the debug channel: the
/// debug channel is part of the harness contract, `log` is operator
/// tooling.
use crate::types::{ExitClass, HarnessError};
use std::fmt;
use std::io::{self, Write};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide debug switch. Set once at startup, read-only afterwards.
static DEBUG: AtomicBool = AtomicBool::new(false);

pub fn set_debug(enabled: bool) {
    DEBUG.store(enabled, Ordering::SeqCst);
}

pub fn debug_enabled() -> bool {
    DEBUG.load(Ordering::SeqCst)
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Logical harness error: invalid input or failed setup. Never returns.
pub fn fail(args: fmt::Arguments<'_>) -> ! {
    let errno = last_errno();
    let _ = io::stdout().flush();
    eprintln!("{} (errno {})", args, errno);
    process::exit(ExitClass::Fail.code())
}

/// Illegal kernel response observed by the executor. Never returns.
///
/// Only the executor variant carries this; standalone reproducers have no
/// result validator and must not report code 68.
#[cfg(feature = "executor")]
pub fn kernel_error(args: fmt::Arguments<'_>) -> ! {
    let _ = io::stdout().flush();
    eprintln!("{}", args);
    process::exit(ExitClass::KernelError.code())
}

/// Transient condition (e.g. ENOMEM during setup). Never returns; the
/// supervisor is expected to relaunch the harness.
pub fn retry(args: fmt::Arguments<'_>) -> ! {
    let errno = last_errno();
    let _ = io::stdout().flush();
    eprintln!("{} (errno {})", args, errno);
    process::exit(ExitClass::Retry.code())
}

/// Debug channel: stdout, flushed, gated by the process-wide flag.
pub fn debug(args: fmt::Arguments<'_>) {
    if !debug_enabled() {
        return;
    }
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let _ = out.write_fmt(args);
    let _ = out.write_all(b"\n");
    let _ = out.flush();
}

/// Funnel from `Result`-based plumbing to the exit discipline: terminate
/// with the exit class the error maps to.
pub fn exit_with(err: &HarnessError) -> ! {
    match err.exit_class() {
        ExitClass::Retry => retry(format_args!("{}", err)),
        _ => fail(format_args!("{}", err)),
    }
}

#[macro_export]
macro_rules! fail {
    ($($arg:tt)*) => {
        $crate::diag::fail(format_args!($($arg)*))
    };
}

#[cfg(feature = "executor")]
#[macro_export]
macro_rules! kernel_error {
    ($($arg:tt)*) => {
        $crate::diag::kernel_error(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! retry {
    ($($arg:tt)*) => {
        $crate::diag::retry(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! harness_debug {
    ($($arg:tt)*) => {
        $crate::diag::debug(format_args!($($arg)*))
    };
}
