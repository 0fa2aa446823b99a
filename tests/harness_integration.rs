//! Integration tests for the harness process tree
//!
//! Everything that terminates a process or rearranges its filesystem view
//! runs in a forked child so the test runner itself stays intact. Children
//! report through exit codes only; assertions live on the parent side.

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult};
use std::path::Path;
use std::time::{Duration, Instant};
use syzbox::repeat::{self, RepeatConfig};
use syzbox::types::SandboxKind;
use syzbox::{fault, sandbox};

/// Run `f` in a forked child and return its wait status. `f` must leave
/// the process via `libc::_exit`; falling through exits 0.
fn run_in_child(f: impl FnOnce()) -> WaitStatus {
    match unsafe { fork() }.expect("fork failed") {
        ForkResult::Child => {
            f();
            unsafe { libc::_exit(0) };
        }
        ForkResult::Parent { child } => waitpid(child, None).expect("waitpid failed"),
    }
}

fn exit_code(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        other => panic!("child did not exit normally: {:?}", other),
    }
}

fn noop_test() {}

fn marker_test() {
    let _ = std::fs::write("marker", b"x");
}

fn slow_test() {
    std::thread::sleep(Duration::from_secs(10));
}

#[test]
fn test_fail_exit_class() {
    let status = run_in_child(|| syzbox::diag::fail(format_args!("induced failure")));
    assert_eq!(exit_code(status), 67);
}

#[test]
fn test_retry_exit_class_from_remove_dir() {
    let status = run_in_child(|| {
        repeat::remove_dir(Path::new("/nonexistent-syzbox-integration-dir"));
    });
    assert_eq!(exit_code(status), 69);
}

#[cfg(feature = "executor")]
#[test]
fn test_kernel_error_exit_class() {
    let status = run_in_child(|| syzbox::diag::kernel_error(format_args!("induced anomaly")));
    assert_eq!(exit_code(status), 68);
}

#[test]
fn test_unguarded_fault_exits_with_signal_number() {
    let status = run_in_child(|| {
        fault::install_handler().expect("install");
        unsafe { std::ptr::read_volatile(0x1 as *const u8) };
    });
    assert_eq!(exit_code(status), libc::SIGSEGV);
}

#[test]
fn test_iteration_reclaims_working_directory() {
    let status = run_in_child(|| {
        let base = std::env::temp_dir().join(format!("syzbox-it-{}", std::process::id()));
        if std::fs::create_dir(&base).is_err() {
            unsafe { libc::_exit(2) };
        }
        if std::env::set_current_dir(&base).is_err() {
            unsafe { libc::_exit(3) };
        }
        repeat::run_iteration(&RepeatConfig::default(), 0, marker_test);
        if Path::new("./0").exists() {
            unsafe { libc::_exit(1) };
        }
        unsafe { libc::_exit(0) };
    });
    assert_eq!(exit_code(status), 0, "iteration cwd must be gone after reclamation");
}

#[test]
fn test_iteration_timeout_kills_slow_child() {
    let status = run_in_child(|| {
        let base = std::env::temp_dir().join(format!("syzbox-to-{}", std::process::id()));
        if std::fs::create_dir(&base).is_err() {
            unsafe { libc::_exit(2) };
        }
        if std::env::set_current_dir(&base).is_err() {
            unsafe { libc::_exit(3) };
        }
        let config = RepeatConfig {
            timeout: Duration::from_millis(300),
            poll_interval: Duration::from_millis(1),
        };
        let started = Instant::now();
        repeat::run_iteration(&config, 0, slow_test);
        // The 10 s body must have been killed around the 300 ms bound.
        if started.elapsed() > Duration::from_secs(5) {
            unsafe { libc::_exit(1) };
        }
        if Path::new("./0").exists() {
            unsafe { libc::_exit(4) };
        }
        unsafe { libc::_exit(0) };
    });
    assert_eq!(exit_code(status), 0, "slow child must be killed and its cwd reclaimed");
}

#[test]
fn test_sandbox_none_hosts_repeat_loop() {
    let status = run_in_child(|| {
        let base = std::env::temp_dir().join(format!("syzbox-sb-{}", std::process::id()));
        if std::fs::create_dir(&base).is_err() {
            unsafe { libc::_exit(2) };
        }
        if std::env::set_current_dir(&base).is_err() {
            unsafe { libc::_exit(3) };
        }
        match sandbox::enter(SandboxKind::None, noop_test) {
            Err(_) => unsafe { libc::_exit(1) },
            Ok(pid) => {
                // Let a few iterations run, then tear the sandbox down.
                std::thread::sleep(Duration::from_millis(300));
                let _ = kill(pid, Signal::SIGKILL);
                let _ = waitpid(pid, Some(WaitPidFlag::__WALL));
                unsafe { libc::_exit(0) };
            }
        }
    });
    assert_eq!(exit_code(status), 0);
}

#[test]
fn test_sandbox_namespace_smoke() {
    let status = run_in_child(|| {
        let base = std::env::temp_dir().join(format!("syzbox-ns-{}", std::process::id()));
        if std::fs::create_dir(&base).is_err() {
            unsafe { libc::_exit(2) };
        }
        if std::env::set_current_dir(&base).is_err() {
            unsafe { libc::_exit(3) };
        }
        match sandbox::enter(SandboxKind::Namespace, noop_test) {
            // Unprivileged user namespaces may be disabled on the host;
            // that is an environment limit, not a harness defect.
            Err(_) => unsafe { libc::_exit(42) },
            Ok(pid) => {
                std::thread::sleep(Duration::from_millis(500));
                let _ = kill(pid, Signal::SIGKILL);
                let _ = waitpid(pid, Some(WaitPidFlag::__WALL));
                unsafe { libc::_exit(0) };
            }
        }
    });
    let code = exit_code(status);
    if code == 42 {
        println!("namespace sandbox unavailable on this host, skipping");
        return;
    }
    assert_eq!(code, 0);
}
