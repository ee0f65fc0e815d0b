//! Background reaping of terminated child processes.
//!
//! A dedicated thread block-waits for any child to terminate, drains every
//! other child that has already terminated, and queues a [`Reaped`] record
//! per child. The worker loop pulls the queue with [`ChildReaper::collect`]
//! between requests, so reaping never blocks the control line.
//!
//! When the process has no children the thread parks until the loop calls
//! [`ChildReaper::notify_spawned`]. The reaper is scoped to the PID that
//! installed it: a forked descendant holding a copy of the handle sees an
//! empty queue and its notifications are dropped.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::error;

use crate::process::{self, ChildExit, ForkGuard};
use crate::{AgentError, Result};

/// A child that has been waited on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reaped {
    /// PID of the terminated child.
    pub pid: Pid,
    /// How it terminated.
    pub exit: ChildExit,
}

impl Reaped {
    fn from_status(status: WaitStatus) -> Option<Self> {
        ChildExit::from_status(status).map(|(pid, exit)| Self { pid, exit })
    }
}

/// Reap every child that has already terminated, without blocking.
///
/// Returns an empty list when nothing is pending or the process has no
/// children at all.
///
/// # Errors
///
/// Returns `AgentError::Process` for wait failures other than `ECHILD`.
pub fn reap_exited() -> Result<Vec<Reaped>> {
    let mut reaped = Vec::new();
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
            Ok(status) => match Reaped::from_status(status) {
                Some(child) => reaped.push(child),
                None => break,
            },
            Err(Errno::EINTR) => {}
            Err(errno) => {
                return Err(AgentError::Process(format!("waitpid failed: {errno}")));
            }
        }
    }
    Ok(reaped)
}

/// Handle to the reaper thread owned by one worker process.
#[derive(Debug)]
pub struct ChildReaper {
    owner: Pid,
    wake: Sender<()>,
    reaped: Receiver<Reaped>,
    thread: JoinHandle<()>,
}

impl ChildReaper {
    /// Start the reaper thread for the current process.
    ///
    /// The thread logs only under `guard`.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Process` if the thread cannot be spawned.
    pub fn install(guard: &ForkGuard) -> Result<Self> {
        let guard = guard.clone();
        let (wake_tx, wake_rx) = mpsc::channel();
        let (reaped_tx, reaped_rx) = mpsc::channel();

        let thread = thread::Builder::new()
            .name("child-reaper".into())
            .spawn(move || reap_loop(&wake_rx, &reaped_tx, &guard))
            .map_err(|err| AgentError::Process(format!("failed to start child reaper: {err}")))?;

        Ok(Self {
            owner: process::current_pid(),
            wake: wake_tx,
            reaped: reaped_rx,
            thread,
        })
    }

    /// Whether the calling process is the one that installed this reaper.
    #[must_use]
    pub fn is_owner(&self) -> bool {
        process::current_pid() == self.owner
    }

    /// Tell the reaper a new child exists.
    pub fn notify_spawned(&self) {
        if self.is_owner() {
            let _ = self.wake.send(());
        }
    }

    /// Drain every child reaped since the last call.
    #[must_use]
    pub fn collect(&self) -> Vec<Reaped> {
        if !self.is_owner() {
            return Vec::new();
        }
        self.reaped.try_iter().collect()
    }

    /// Stop the thread once every current child has been reaped, and return
    /// the records not yet collected.
    ///
    /// Blocks while any child is still running.
    #[must_use]
    pub fn shutdown(self) -> Vec<Reaped> {
        let Self {
            owner,
            wake,
            reaped,
            thread,
        } = self;
        drop(wake);
        if process::current_pid() != owner {
            return Vec::new();
        }
        let _ = thread.join();
        reaped.try_iter().collect()
    }
}

fn reap_loop(wake: &Receiver<()>, reaped: &Sender<Reaped>, guard: &ForkGuard) {
    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(status) => {
                let mut batch: Vec<Reaped> = Reaped::from_status(status).into_iter().collect();
                if let Ok(more) = reap_exited() {
                    batch.extend(more);
                }
                for child in batch {
                    if reaped.send(child).is_err() {
                        return;
                    }
                }
            }
            Err(Errno::ECHILD) => {
                if wake.recv().is_err() {
                    return;
                }
            }
            Err(Errno::EINTR) => {}
            Err(errno) => {
                let _held = guard.hold();
                error!(%errno, "child reaper stopped; exited children will not be reaped");
                return;
            }
        }
    }
}
