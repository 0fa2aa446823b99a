//! Pseudo-syscall dispatch
//!
//! A test program reaches the kernel exclusively through
//! [`execute_syscall`]: either a raw syscall forwarded verbatim, or one of
//! a small closed set of composite helpers that need user-space glue (path
//! construction, option-string assembly) to reach resources a single kernel
//! entry cannot. Helpers return a file descriptor or -1; raw calls return
//! whatever the kernel returned. No helper terminates the harness.

use std::ffi::CString;

/// Reserved opcode numbers, wire-stable: standalone reproducers emitted by
/// the external tooling invoke the same values.
pub const SYZ_TEST: u64 = 1_000_001;
pub const SYZ_OPEN_DEV: u64 = 1_000_002;
pub const SYZ_OPEN_PTS: u64 = 1_000_003;
pub const SYZ_FUSE_MOUNT: u64 = 1_000_004;
pub const SYZ_FUSEBLK_MOUNT: u64 = 1_000_005;

/// Bounded buffer sizes for path assembly.
const SMALL_PATH: usize = 128;
const TEMPLATE_BUF: usize = 1024;

/// The closed opcode set. Every number outside the reserved range is a raw
/// kernel syscall; unknown reserved-looking numbers also fall through to
/// the raw path rather than failing the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudoOpcode {
    Raw(u64),
    Test,
    OpenDev,
    OpenPts,
    FuseMount,
    FuseblkMount,
}

impl PseudoOpcode {
    pub fn from_nr(nr: u64) -> Self {
        match nr {
            SYZ_TEST => PseudoOpcode::Test,
            SYZ_OPEN_DEV => PseudoOpcode::OpenDev,
            SYZ_OPEN_PTS => PseudoOpcode::OpenPts,
            SYZ_FUSE_MOUNT => PseudoOpcode::FuseMount,
            SYZ_FUSEBLK_MOUNT => PseudoOpcode::FuseblkMount,
            other => PseudoOpcode::Raw(other),
        }
    }
}

/// Execute one test syscall: a raw kernel entry or a composite helper.
/// Raw calls take six arguments; the extra slots exist for helpers.
pub fn execute_syscall(nr: u64, a: [u64; 9]) -> i64 {
    match PseudoOpcode::from_nr(nr) {
        PseudoOpcode::Raw(n) => unsafe {
            libc::syscall(n as libc::c_long, a[0], a[1], a[2], a[3], a[4], a[5]) as i64
        },
        PseudoOpcode::Test => 0,
        PseudoOpcode::OpenDev => syz_open_dev(a[0], a[1], a[2]),
        PseudoOpcode::OpenPts => syz_open_pts(a[0], a[1]),
        PseudoOpcode::FuseMount => syz_fuse_mount(a[0], a[1], a[2], a[3], a[4], a[5]),
        PseudoOpcode::FuseblkMount => {
            syz_fuseblk_mount(a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7])
        }
    }
}

/// `/dev/char/<maj>:<min>` or `/dev/block/<maj>:<min>`, ids truncated to
/// eight bits. Stays well under the small-path bound.
pub fn dev_numeric_path(class: u64, major: u64, minor: u64) -> String {
    let kind = if class == 0xc { "char" } else { "block" };
    let path = format!("/dev/{}/{}:{}", kind, major as u8, minor as u8);
    debug_assert!(path.len() < SMALL_PATH);
    path
}

/// Copy a NUL-terminated device-path template out of test-program memory.
/// Truncates to 1023 bytes plus terminator and never reads past the first
/// NUL. The caller is expected to run this under a fault guard; the
/// pointer is attacker-chosen.
unsafe fn copy_template(src: *const u8) -> [u8; TEMPLATE_BUF] {
    let mut buf = [0u8; TEMPLATE_BUF];
    for i in 0..TEMPLATE_BUF - 1 {
        let b = unsafe { src.add(i).read() };
        if b == 0 {
            break;
        }
        buf[i] = b;
    }
    buf
}

/// Replace each '#' placeholder with the next low-order decimal digit of
/// `id`. Terminates because every pass consumes one '#'; ten device ids
/// per digit position are enough for everyone.
pub fn substitute_template_id(buf: &mut [u8], mut id: u64) {
    while let Some(pos) = buf.iter().position(|&b| b == b'#') {
        buf[pos] = b'0' + (id % 10) as u8;
        id /= 10;
    }
}

fn open_bytes(path: *const u8, flags: u64) -> i64 {
    // Mode 0 is explicit: the flags word is attacker-chosen and may carry
    // O_CREAT, which makes open read a mode argument.
    unsafe { libc::open(path as *const libc::c_char, flags as libc::c_int, 0 as libc::c_uint) as i64 }
}

fn open_str(path: &str, flags: u64) -> i64 {
    let Ok(cpath) = CString::new(path) else {
        return -1;
    };
    open_bytes(cpath.as_ptr() as *const u8, flags)
}

/// Open a device node. Class 0x0c/0x0b select the numeric char/block form;
/// anything else is treated as a pointer to a '#'-templated path.
fn syz_open_dev(a0: u64, a1: u64, a2: u64) -> i64 {
    if a0 == 0xc || a0 == 0xb {
        let path = dev_numeric_path(a0, a1, a2);
        return open_str(&path, libc::O_RDWR as u64);
    }
    let mut buf = unsafe { copy_template(a0 as *const u8) };
    substitute_template_id(&mut buf, a1);
    open_bytes(buf.as_ptr(), a2)
}

/// Resolve the slave side of a pseudo-terminal from its master fd and open
/// it. Returns -1 when the master does not answer the pty-number ioctl.
fn syz_open_pts(a0: u64, a1: u64) -> i64 {
    let mut ptyno: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(a0 as libc::c_int, libc::TIOCGPTN, &mut ptyno) };
    if rc != 0 {
        return -1;
    }
    let path = format!("/dev/pts/{}", ptyno);
    debug_assert!(path.len() < SMALL_PATH);
    open_str(&path, a1)
}

/// Assemble the fuse/fuseblk mount option string. The low two bits of
/// `mode` are option flags and are masked out of the octal rootmode; the
/// layout is wire-stable and downstream reproducers depend on it.
pub fn fuse_options(fd: i64, mode: u64, uid: u64, gid: u64, maxread: u64, blksize: Option<u64>) -> String {
    let mut opts = format!(
        "fd={},user_id={},group_id={},rootmode=0{:o}",
        fd,
        uid as i64,
        gid as i64,
        (mode as u32) & !3u32
    );
    if maxread != 0 {
        opts.push_str(&format!(",max_read={}", maxread as i64));
    }
    if let Some(blksize) = blksize {
        if blksize != 0 {
            opts.push_str(&format!(",blksize={}", blksize as i64));
        }
    }
    if mode & 1 != 0 {
        opts.push_str(",default_permissions");
    }
    if mode & 2 != 0 {
        opts.push_str(",allow_other");
    }
    opts
}

fn open_dev_fuse() -> i64 {
    open_str("/dev/fuse", libc::O_RDWR as u64)
}

fn mount_raw(source: *const u8, target: u64, fstype: &[u8], flags: u64, opts: &[u8]) {
    // The mount result is deliberately ignored: even a half-mounted fuse
    // endpoint may produce useful fuzzing state through the fd alone.
    unsafe {
        libc::syscall(
            libc::SYS_mount,
            source,
            target,
            fstype.as_ptr(),
            flags,
            opts.as_ptr(),
        );
    }
}

/// Open `/dev/fuse` and best-effort mount it at `target`. The fd is the
/// result either way; -1 only when `/dev/fuse` itself cannot be opened.
fn syz_fuse_mount(target: u64, mode: u64, uid: u64, gid: u64, maxread: u64, flags: u64) -> i64 {
    let fd = open_dev_fuse();
    if fd == -1 {
        return fd;
    }
    let mut opts = fuse_options(fd, mode, uid, gid, maxread, None).into_bytes();
    opts.push(0);
    mount_raw(b"\0".as_ptr(), target, b"fuse\0", flags, &opts);
    fd
}

/// As `syz_fuse_mount`, but backed by a fresh block-device node at
/// `blkdev` and mounted as fuseblk. A failed mknod skips the mount but
/// still hands back the fd.
fn syz_fuseblk_mount(
    target: u64,
    blkdev: u64,
    mode: u64,
    uid: u64,
    gid: u64,
    maxread: u64,
    blksize: u64,
    flags: u64,
) -> i64 {
    let fd = open_dev_fuse();
    if fd == -1 {
        return fd;
    }
    let rc = unsafe {
        libc::syscall(
            libc::SYS_mknodat,
            libc::AT_FDCWD,
            blkdev,
            libc::S_IFBLK,
            libc::makedev(7, 199),
        )
    };
    if rc != 0 {
        return fd;
    }
    let mut opts = fuse_options(fd, mode, uid, gid, maxread, Some(blksize)).into_bytes();
    opts.push(0);
    mount_raw(blkdev as *const u8, target, b"fuseblk\0", flags, &opts);
    fd
}
