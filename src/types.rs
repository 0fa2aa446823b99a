/// Core types for the syzbox harness
use thiserror::Error;

/// Exit classes the harness reports to its parent supervisor.
///
/// Three distinct nonzero codes let the supervisor tell "my input was bad",
/// "I observed kernel misbehaviour", and "transient, restart me" apart
/// without parsing stderr. Any other nonzero exit is a signal-delivered
/// termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitClass {
    /// Logical error the harness itself owns (bad input, setup failed).
    Fail = 67,
    /// Illegal kernel response observed by the executor variant.
    KernelError = 68,
    /// Transient condition; the supervisor should relaunch.
    Retry = 69,
}

impl ExitClass {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Which privilege-dropping prelude the sandbox process runs before the
/// test body. Exactly one kind is active per harness run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxKind {
    /// Fork plus the common prelude only.
    None,
    /// Common prelude, then drop to the conventional unprivileged uid/gid.
    Setuid,
    /// Fresh user/pid/uts/net namespaces with a pivoted tmpfs root.
    Namespace,
}

/// Errors raised by harness plumbing before control reaches a test body.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("setup error: {0}")]
    Setup(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("transient error: {0}")]
    Transient(String),
}

impl HarnessError {
    /// Map an error to the exit class the supervisor contract assigns it.
    pub fn exit_class(&self) -> ExitClass {
        match self {
            HarnessError::Setup(_) | HarnessError::Sandbox(_) => ExitClass::Fail,
            HarnessError::Transient(_) => ExitClass::Retry,
        }
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
