//! Process management: forking, waiting, sessions and stdio rebinding.
//!
//! Every spawn or command request runs in its own forked process. A request
//! is described by a [`SpawnRequest`] (role plus identifier); the worker loop
//! forks through a [`ForkGuard`] and the child side hands the inherited
//! control line to the role's entry point.

use std::fmt::{Display, Formatter};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{dup2, fork, setsid, ForkResult, Pid};
use tracing::debug;

use crate::protocol::{Identifier, Request};
use crate::{AgentError, Result};

/// What a forked child becomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// A long-lived worker agent subtree (`S:` request).
    Worker,
    /// A one-shot command proxy (`C:` request).
    Command,
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Worker => f.write_str("worker"),
            Self::Command => f.write_str("command"),
        }
    }
}

/// A request to fork a child in a given role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    /// Role the child takes on.
    pub role: Role,
    /// Identifier the child boots or runs.
    pub identifier: Identifier,
}

impl From<Request> for SpawnRequest {
    fn from(request: Request) -> Self {
        match request {
            Request::Spawn(identifier) => Self {
                role: Role::Worker,
                identifier,
            },
            Request::Command(identifier) => Self {
                role: Role::Command,
                identifier,
            },
        }
    }
}

/// Which side of a fork the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forked {
    /// The calling process; carries the child's PID.
    Parent(Pid),
    /// The new child process.
    Child,
}

/// How a child process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    /// Normal exit with a status code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(Signal),
}

impl ChildExit {
    /// Numeric exit code; signal deaths map to `128 + signal`.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(signal) => 128 + signal as i32,
        }
    }

    /// Translate a terminal wait status; `None` for stop/continue/still-alive.
    #[must_use]
    pub fn from_status(status: WaitStatus) -> Option<(Pid, Self)> {
        match status {
            WaitStatus::Exited(pid, code) => Some((pid, Self::Exited(code))),
            WaitStatus::Signaled(pid, signal, _) => Some((pid, Self::Signaled(signal))),
            _ => None,
        }
    }
}

impl Display for ChildExit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(signal) => write!(f, "terminated by {signal}"),
        }
    }
}

/// Fork the current process.
///
/// The child inherits every descriptor but only the calling thread; any
/// helper threads (reaper, notifier) exist only in the parent.
///
/// # Errors
///
/// Returns `AgentError::Process` if `fork(2)` fails.
#[allow(unsafe_code)]
pub fn fork_child() -> Result<Forked> {
    // SAFETY: callers only run agent code in the child, which either
    // re-enters the worker loop or proxies one command and then exits
    // through `exit`. Helper threads that take shared locks do so inside a
    // `ForkGuard` held across the fork.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => Ok(Forked::Parent(child)),
        Ok(ForkResult::Child) => Ok(Forked::Child),
        Err(errno) => Err(AgentError::Process(format!("fork failed: {errno}"))),
    }
}

/// Excludes `fork` while a helper thread may hold a process-wide lock.
///
/// The child of a fork keeps only the forking thread. A stdio or allocator
/// lock owned by any other thread at that moment stays locked forever in the
/// child. Helper threads hold the guard around every call that can take such
/// a lock (logging, sink callbacks), and [`ForkGuard::fork`] takes it before
/// forking.
#[derive(Debug, Clone, Default)]
pub struct ForkGuard(Arc<Mutex<()>>);

impl ForkGuard {
    /// Hold off forks until the returned guard is dropped.
    pub fn hold(&self) -> MutexGuard<'_, ()> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fork once no helper thread is inside a guarded section.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Process` if `fork(2)` fails.
    pub fn fork(&self) -> Result<Forked> {
        let _held = self.hold();
        fork_child()
    }
}

/// Block until the given child terminates.
///
/// # Errors
///
/// Returns `AgentError::Process` if the wait fails (for example, if `pid`
/// is not a child of this process).
pub fn wait_for(pid: Pid) -> Result<ChildExit> {
    loop {
        match waitpid(pid, None) {
            Ok(status) => {
                if let Some((_, exit)) = ChildExit::from_status(status) {
                    return Ok(exit);
                }
            }
            Err(Errno::EINTR) => {}
            Err(errno) => {
                return Err(AgentError::Process(format!(
                    "waitpid({pid}) failed: {errno}"
                )));
            }
        }
    }
}

/// Start a new session with this process as leader, detaching it from the
/// caller's controlling terminal.
///
/// # Errors
///
/// Returns `AgentError::Process` if `setsid(2)` fails.
pub fn become_session_leader() -> Result<Pid> {
    setsid().map_err(|errno| AgentError::Process(format!("setsid failed: {errno}")))
}

/// Rebind stdin, stdout and stderr to `terminal`.
///
/// # Errors
///
/// Returns `AgentError::Process` if any `dup2(2)` fails.
pub fn redirect_stdio(terminal: &OwnedFd) -> Result<()> {
    let source = terminal.as_raw_fd();
    for target in 0..=2 {
        dup2(source, target).map_err(|errno| {
            AgentError::Process(format!("failed to rebind descriptor {target}: {errno}"))
        })?;
    }
    Ok(())
}

/// The current process ID.
#[must_use]
pub fn current_pid() -> Pid {
    nix::unistd::getpid()
}

/// Set the process name shown by `ps`/`top` (truncated to 15 bytes).
#[cfg(target_os = "linux")]
pub fn set_process_name(name: &str) {
    let truncated = crate::protocol::truncate_to_fit(name, 15);
    match std::ffi::CString::new(truncated) {
        Ok(cname) => {
            if let Err(errno) = nix::sys::prctl::set_name(&cname) {
                debug!(%errno, name, "failed to set process name");
            }
        }
        Err(err) => debug!(%err, name, "process name contains a NUL byte"),
    }
}

/// Set the process name shown by `ps`/`top`; unsupported on this platform.
#[cfg(not(target_os = "linux"))]
pub fn set_process_name(name: &str) {
    debug!(name, "process naming is not supported on this platform");
}

/// Terminate the current process with `code`.
pub fn exit(code: i32) -> ! {
    std::process::exit(code)
}
