//! Sandbox profiles
//!
//! Each profile forks (or clones) the sandbox process, applies a
//! privilege-dropping prelude, and enters the repeat loop. The parent side
//! gets the sandbox pid back; the child side never returns. Full isolation
//! is deliberately traded for throughput: these namespaces contain one
//! short-lived test program, they do not host services.

use crate::types::{HarnessError, Result, SandboxKind};
use crate::{fail, harness_debug, repeat};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{clone, unshare, CloneFlags};
use nix::sys::prctl;
use nix::sys::signal::Signal;
use nix::sys::stat::Mode;
use nix::unistd::{chdir, chroot, fork, getgid, getpid, getuid, mkdir, pivot_root, setgroups, setpgid, setsid, ForkResult, Pid};
use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;

/// Conventional unprivileged uid/gid for the setuid profile.
const NOBODY: libc::uid_t = 65534;

/// The namespace profile's child runs on this pre-allocated stack.
const SANDBOX_STACK_SIZE: usize = 1 << 20;

const CAP_SYS_PTRACE: u32 = 19;
const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

/// Fork the sandbox process for the selected profile. Returns the sandbox
/// pid to the caller; the sandbox process itself applies its privilege
/// drops and runs the repeat loop until it is killed or exits fatally.
pub fn enter(kind: SandboxKind, test: fn()) -> Result<Pid> {
    match kind {
        SandboxKind::None => sandbox_none(test),
        SandboxKind::Setuid => sandbox_setuid(test),
        SandboxKind::Namespace => sandbox_namespace(test),
    }
}

/// Prelude shared by every profile, run in the sandbox process before the
/// profile-specific tail. All results are ignored the way the original
/// harness ignores them: a prelude step that does not apply on this kernel
/// must not cost the run.
fn sandbox_common() {
    let _ = prctl::set_pdeathsig(Signal::SIGKILL);
    let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
    // Fails with EPERM once setpgid made us a group leader; harmless.
    let _ = setsid();

    apply_rlimit("RLIMIT_AS", libc::RLIMIT_AS, 128 << 20);
    apply_rlimit("RLIMIT_FSIZE", libc::RLIMIT_FSIZE, 1 << 20);
    apply_rlimit("RLIMIT_STACK", libc::RLIMIT_STACK, 1 << 20);
    apply_rlimit("RLIMIT_CORE", libc::RLIMIT_CORE, 0);

    // CLONE_NEWIPC/CLONE_IO fail with EINVAL when unshared jointly on some
    // kernels, so the three calls stay separate.
    let _ = unshare(CloneFlags::CLONE_NEWNS);
    let _ = unshare(CloneFlags::CLONE_NEWIPC);
    let _ = unshare(CloneFlags::CLONE_IO);
}

fn apply_rlimit(name: &str, resource: libc::__rlimit_resource_t, limit: u64) {
    let rlim = libc::rlimit {
        rlim_cur: limit,
        rlim_max: limit,
    };
    let rc = unsafe { libc::setrlimit(resource, &rlim) };
    if rc != 0 {
        log::warn!(
            "setrlimit({}={}) failed: {}",
            name,
            limit,
            std::io::Error::last_os_error()
        );
    }
}

fn sandbox_none(test: fn()) -> Result<Pid> {
    match unsafe { fork() }
        .map_err(|e| HarnessError::Sandbox(format!("sandbox fork failed: {}", e)))?
    {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            sandbox_common();
            repeat::run(test)
        }
    }
}

fn sandbox_setuid(test: fn()) -> Result<Pid> {
    match unsafe { fork() }
        .map_err(|e| HarnessError::Sandbox(format!("sandbox fork failed: {}", e)))?
    {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            sandbox_common();

            // Groups first, gid before uid: once the uid drops, the other
            // two transitions are no longer permitted.
            if let Err(e) = setgroups(&[]) {
                fail!("failed to setgroups: {}", e);
            }
            if unsafe { libc::setresgid(NOBODY, NOBODY, NOBODY) } != 0 {
                fail!("failed to setresgid");
            }
            if unsafe { libc::setresuid(NOBODY, NOBODY, NOBODY) } != 0 {
                fail!("failed to setresuid");
            }
            repeat::run(test)
        }
    }
}

fn sandbox_namespace(test: fn()) -> Result<Pid> {
    // Captured before the clone: inside the new user namespace the real
    // ids are gone, and the uid/gid maps need the outer values.
    let real_uid = getuid().as_raw();
    let real_gid = getgid().as_raw();

    let mut stack = vec![0u8; SANDBOX_STACK_SIZE];
    let flags = CloneFlags::CLONE_NEWUSER
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWNET;
    unsafe {
        clone(
            Box::new(move || namespace_sandbox_proc(real_uid, real_gid, test)),
            &mut stack,
            flags,
            None,
        )
    }
    .map_err(|e| HarnessError::Sandbox(format!("sandbox clone failed: {}", e)))
}

fn namespace_sandbox_proc(real_uid: libc::uid_t, real_gid: libc::gid_t, test: fn()) -> isize {
    sandbox_common();

    // /proc/self/setgroups is absent on some kernels; the write is policy,
    // not a prerequisite.
    let _ = write_file("/proc/self/setgroups", "deny");
    if !write_file("/proc/self/uid_map", &format!("0 {} 1\n", real_uid)) {
        fail!("write of /proc/self/uid_map failed");
    }
    if !write_file("/proc/self/gid_map", &format!("0 {} 1\n", real_gid)) {
        fail!("write of /proc/self/gid_map failed");
    }

    if let Err(e) = mkdir("./syz-tmp", Mode::from_bits_truncate(0o777)) {
        fail!("mkdir(syz-tmp) failed: {}", e);
    }
    if let Err(e) = mount(
        Some(""),
        "./syz-tmp",
        Some("tmpfs"),
        MsFlags::empty(),
        None::<&str>,
    ) {
        fail!("mount(tmpfs) failed: {}", e);
    }
    if let Err(e) = mkdir("./syz-tmp/newroot", Mode::from_bits_truncate(0o777)) {
        fail!("mkdir failed: {}", e);
    }
    if let Err(e) = mkdir("./syz-tmp/newroot/dev", Mode::from_bits_truncate(0o700)) {
        fail!("mkdir failed: {}", e);
    }
    if let Err(e) = mount(
        Some("/dev"),
        "./syz-tmp/newroot/dev",
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    ) {
        fail!("mount(dev) failed: {}", e);
    }
    if let Err(e) = mkdir("./syz-tmp/pivot", Mode::from_bits_truncate(0o777)) {
        fail!("mkdir failed: {}", e);
    }

    // The pivot is best-effort: kernels without pivot_root for this
    // filesystem combination still get the chroot below.
    match pivot_root("./syz-tmp", "./syz-tmp/pivot") {
        Err(e) => {
            harness_debug!("pivot_root failed: {}", e);
            if let Err(e) = chdir("./syz-tmp") {
                fail!("chdir failed: {}", e);
            }
        }
        Ok(()) => {
            if let Err(e) = chdir("/") {
                fail!("chdir failed: {}", e);
            }
            if let Err(e) = umount2("./pivot", MntFlags::MNT_DETACH) {
                fail!("umount failed: {}", e);
            }
        }
    }
    if let Err(e) = chroot("./newroot") {
        fail!("chroot failed: {}", e);
    }
    if let Err(e) = chdir("/") {
        fail!("chdir failed: {}", e);
    }

    drop_ptrace_capability();

    repeat::run(test)
}

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: libc::c_int,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

/// Clear CAP_SYS_PTRACE from the sandbox process. A test could otherwise
/// ptrace its ancestors, and a SIGSTOP delivered that way hangs the loop
/// process. A process can still ptrace its own descendants, which is all
/// the fuzzer needs.
fn drop_ptrace_capability() {
    let mut hdr = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: getpid().as_raw(),
    };
    let mut data = [CapUserData::default(); 2];
    let rc = unsafe {
        libc::syscall(
            libc::SYS_capget,
            &mut hdr as *mut CapUserHeader,
            data.as_mut_ptr(),
        )
    };
    if rc != 0 {
        fail!("capget failed");
    }
    data[0].effective &= !(1 << CAP_SYS_PTRACE);
    data[0].permitted &= !(1 << CAP_SYS_PTRACE);
    data[0].inheritable &= !(1 << CAP_SYS_PTRACE);
    let rc = unsafe {
        libc::syscall(
            libc::SYS_capset,
            &hdr as *const CapUserHeader,
            data.as_ptr(),
        )
    };
    if rc != 0 {
        fail!("capset failed");
    }
}

/// Single-shot write of a small proc-style file. False on any failure;
/// callers decide whether that is fatal.
fn write_file(path: &str, contents: &str) -> bool {
    let file = fs::OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_CLOEXEC)
        .open(path);
    match file {
        Ok(mut f) => f.write_all(contents.as_bytes()).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_file_existing_target() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("map");
        fs::write(&path, b"").unwrap();
        assert!(write_file(path.to_str().unwrap(), "0 1000 1\n"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "0 1000 1\n");
    }

    #[test]
    fn test_write_file_missing_target_reports_false() {
        // No create flag: a proc file that does not exist on this kernel
        // must read as "not supported", not spring into existence.
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent");
        assert!(!write_file(path.to_str().unwrap(), "deny"));
        assert!(!path.exists());
    }

    #[test]
    fn test_ptrace_capability_mask() {
        let mut data = CapUserData {
            effective: u32::MAX,
            permitted: u32::MAX,
            inheritable: u32::MAX,
        };
        data.effective &= !(1 << CAP_SYS_PTRACE);
        data.permitted &= !(1 << CAP_SYS_PTRACE);
        data.inheritable &= !(1 << CAP_SYS_PTRACE);
        assert_eq!(data.effective & (1 << CAP_SYS_PTRACE), 0);
        assert_eq!(data.permitted & (1 << CAP_SYS_PTRACE), 0);
        assert_eq!(data.inheritable & (1 << CAP_SYS_PTRACE), 0);
        // Only the ptrace bit is touched.
        assert_eq!(data.effective.count_zeros(), 1);
    }
}
