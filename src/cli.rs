use crate::types::SandboxKind;
use crate::{diag, fail, fault, pseudo, sandbox, setup};
use clap::{Parser, ValueEnum};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use std::process;

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum SandboxArg {
    None,
    Setuid,
    Namespace,
}

impl From<SandboxArg> for SandboxKind {
    fn from(arg: SandboxArg) -> Self {
        match arg {
            SandboxArg::None => SandboxKind::None,
            SandboxArg::Setuid => SandboxKind::Setuid,
            SandboxArg::Namespace => SandboxKind::Namespace,
        }
    }
}

#[derive(Parser)]
#[command(
    name = "syzbox",
    version,
    about = "Confined repeat-execution harness for synthesized kernel test programs"
)]
struct Cli {
    /// Privilege-dropping profile the sandbox process applies before the test body
    #[arg(long, value_enum, default_value = "none")]
    sandbox: SandboxArg,
    /// Mirror harness debug traces to stdout
    #[arg(long)]
    debug: bool,
}

pub fn run() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    diag::set_debug(cli.debug);

    let scratch = match setup::setup_main_process() {
        Ok(scratch) => scratch,
        Err(e) => diag::exit_with(&e),
    };
    log::debug!("scratch directory: {}", scratch.display());

    let pid = match sandbox::enter(cli.sandbox.into(), probe_test) {
        Ok(pid) => pid,
        Err(e) => diag::exit_with(&e),
    };
    log::debug!("sandbox process started: {}", pid);

    // The sandbox process never returns control; the harness exit status
    // is whatever disposition it reached. __WALL covers the clone-created
    // namespace sandbox, which carries no termination signal.
    match waitpid(pid, Some(WaitPidFlag::__WALL)) {
        Ok(WaitStatus::Exited(_, code)) => process::exit(code),
        Ok(WaitStatus::Signaled(_, sig, _)) => process::exit(sig as i32),
        other => fail!("unexpected sandbox wait status: {:?}", other),
    }
}

/// Built-in smoke body. The generator normally supplies `test()`; when the
/// harness runs standalone, this probe exercises the dispatcher and the
/// fault guard instead.
fn probe_test() {
    fault::guard(|| {
        let _ = pseudo::execute_syscall(pseudo::SYZ_TEST, [0; 9]);
    });
    let _ = pseudo::execute_syscall(libc::SYS_getpid as u64, [0; 9]);
}
