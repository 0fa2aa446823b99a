//! Per-iteration execution driver
//!
//! Forks one child per test invocation, bounds its wall time, reaps it,
//! and reclaims the per-iteration working directory. A test program can
//! leave behind bind mounts, nested mounts, multiply-mounted paths, and
//! read-only mounts; a single-pass removal is insufficient, so
//! [`remove_dir`] iterates unlink/detach-unmount/rescan to a fixed point.

use crate::{fail, harness_debug, retry};
use nix::mount::{umount2, MntFlags};
use nix::sys::prctl;
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, fork, mkdir, setpgid, ForkResult, Pid};
use std::fs;
use std::path::Path;
use std::process;
use std::thread;
use std::time::{Duration, Instant};

/// Attempt caps for the unlink and rmdir retry loops.
const REMOVE_RETRIES: usize = 100;

/// Per-iteration bounds. The defaults are the production values: an
/// absolute 5 second wall-clock budget per test invocation, polled at
/// ~1 ms granularity.
#[derive(Debug, Clone, Copy)]
pub struct RepeatConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for RepeatConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            poll_interval: Duration::from_millis(1),
        }
    }
}

/// Book-keeping for one live iteration. The working directory is unique
/// across live iterations of a sandbox process; after the child is reaped
/// the directory is removed and the context is dropped.
#[derive(Debug)]
pub struct IterationContext {
    pub iter: u64,
    pub cwd: String,
    pub child: Pid,
    pub started: Instant,
}

/// Run iterations forever with the production bounds. The sandbox process
/// lives here until it is killed or a fatal exit fires.
pub fn run(test: fn()) -> ! {
    run_with(RepeatConfig::default(), test)
}

pub fn run_with(config: RepeatConfig, test: fn()) -> ! {
    let mut iter: u64 = 0;
    loop {
        run_iteration(&config, iter, test);
        iter += 1;
    }
}

/// One full iteration: fresh working directory, forked child running the
/// test body, timeout-bounded reap, directory reclamation.
pub fn run_iteration(config: &RepeatConfig, iter: u64, test: fn()) {
    let cwd = format!("./{}", iter);
    if let Err(e) = mkdir(cwd.as_str(), Mode::from_bits_truncate(0o777)) {
        fail!("failed to mkdir: {}", e);
    }
    match unsafe { fork() } {
        Err(e) => fail!("fork failed: {}", e),
        Ok(ForkResult::Child) => {
            let _ = prctl::set_pdeathsig(Signal::SIGKILL);
            let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
            if let Err(e) = chdir(cwd.as_str()) {
                fail!("failed to chdir: {}", e);
            }
            test();
            process::exit(0);
        }
        Ok(ForkResult::Parent { child }) => {
            let ctx = IterationContext {
                iter,
                cwd,
                child,
                started: Instant::now(),
            };
            wait_iteration(config, &ctx);
            remove_dir(Path::new(&ctx.cwd));
        }
    }
}

/// Poll-reap the iteration child; past the wall-clock budget, SIGKILL its
/// process group and the pid itself, then reap it for real. The bound is
/// absolute: no grace period after the kill.
fn wait_iteration(config: &RepeatConfig, ctx: &IterationContext) {
    loop {
        if let Ok(status) = waitpid(ctx.child, Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL)) {
            if !matches!(status, WaitStatus::StillAlive) {
                return;
            }
        }
        thread::sleep(config.poll_interval);
        if ctx.started.elapsed() > config.timeout {
            harness_debug!("iteration {}: killing child {} on timeout", ctx.iter, ctx.child);
            let _ = kill(Pid::from_raw(-ctx.child.as_raw()), Signal::SIGKILL);
            let _ = kill(ctx.child, Signal::SIGKILL);
            let _ = waitpid(ctx.child, Some(WaitPidFlag::__WALL));
            return;
        }
    }
}

/// Remove a working directory a test program may have turned into a mount
/// stack. Unlink failures with EBUSY get a detach-unmount and a retry;
/// EROFS entries are abandoned; a directory that refills after unmounting
/// is rescanned. Persistent failure is a transient exit: the next harness
/// launch starts from a fresh scratch tree.
pub fn remove_dir(dir: &Path) {
    let mut rescans = 0;
    'rescan: loop {
        let entries = match fs::read_dir(dir) {
            Err(e) if e.raw_os_error() == Some(libc::EMFILE) => {
                // The test process cast prlimit(NOFILE) on us. Preventing
                // that needs full sandboxing, which costs more throughput
                // than tolerating the restart.
                retry!("opendir({}) failed due to NOFILE, exiting", dir.display())
            }
            Err(e) => retry!("opendir({}) failed: {}", dir.display(), e),
            Ok(entries) => entries,
        };
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => retry!("readdir({}) failed: {}", dir.display(), e),
            };
            let path = entry.path();
            let meta = match fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(e) => retry!("lstat({}) failed: {}", path.display(), e),
            };
            if meta.is_dir() {
                remove_dir(&path);
                continue;
            }
            for i in 0.. {
                harness_debug!("unlink({})", path.display());
                match fs::remove_file(&path) {
                    Ok(()) => break,
                    Err(e) if e.raw_os_error() == Some(libc::EROFS) => {
                        harness_debug!("ignoring EROFS");
                        break;
                    }
                    Err(e)
                        if e.raw_os_error() != Some(libc::EBUSY) || i > REMOVE_RETRIES =>
                    {
                        retry!("unlink({}) failed: {}", path.display(), e)
                    }
                    Err(_) => {
                        harness_debug!("umount({})", path.display());
                        if umount2(&path, MntFlags::MNT_DETACH).is_err() {
                            retry!("umount({}) failed", path.display());
                        }
                    }
                }
            }
        }
        for i in 0.. {
            harness_debug!("rmdir({})", dir.display());
            match fs::remove_dir(dir) {
                Ok(()) => return,
                Err(e) => {
                    if i < REMOVE_RETRIES {
                        match e.raw_os_error() {
                            Some(libc::EROFS) => {
                                harness_debug!("ignoring EROFS");
                                return;
                            }
                            Some(libc::EBUSY) => {
                                harness_debug!("umount({})", dir.display());
                                if umount2(dir, MntFlags::MNT_DETACH).is_err() {
                                    retry!("umount({}) failed", dir.display());
                                }
                                continue;
                            }
                            Some(libc::ENOTEMPTY) if rescans < REMOVE_RETRIES => {
                                rescans += 1;
                                continue 'rescan;
                            }
                            _ => {}
                        }
                    }
                    retry!("rmdir({}) failed: {}", dir.display(), e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_config_defaults_are_production_bounds() {
        let config = RepeatConfig::default();
        assert_eq!(config.timeout, Duration::from_millis(5000));
        assert_eq!(config.poll_interval, Duration::from_millis(1));
    }

    #[test]
    fn test_remove_dir_empty() {
        let base = tempfile::tempdir().expect("tempdir");
        let target = base.path().join("victim");
        fs::create_dir(&target).unwrap();
        remove_dir(&target);
        assert!(!target.exists());
        assert!(base.path().exists());
    }

    #[test]
    fn test_remove_dir_plain_files_single_pass() {
        let base = tempfile::tempdir().expect("tempdir");
        let target = base.path().join("victim");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("a"), b"1").unwrap();
        fs::write(target.join("b"), b"2").unwrap();
        remove_dir(&target);
        assert!(!target.exists());
    }

    #[test]
    fn test_remove_dir_recurses_into_subtrees() {
        let base = tempfile::tempdir().expect("tempdir");
        let target = base.path().join("victim");
        fs::create_dir_all(target.join("x/y/z")).unwrap();
        fs::write(target.join("x/y/z/file"), b"deep").unwrap();
        fs::write(target.join("top"), b"shallow").unwrap();
        remove_dir(&target);
        assert!(!target.exists());
    }

    #[test]
    fn test_remove_dir_keeps_symlink_targets() {
        let base = tempfile::tempdir().expect("tempdir");
        let outside = base.path().join("outside");
        fs::write(&outside, b"keep me").unwrap();
        let target = base.path().join("victim");
        fs::create_dir(&target).unwrap();
        std::os::unix::fs::symlink(&outside, target.join("link")).unwrap();
        remove_dir(&target);
        assert!(!target.exists());
        assert!(outside.exists(), "symlink target must not be followed");
    }
}
