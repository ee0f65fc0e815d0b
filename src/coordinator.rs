//! Coordinator side of the worker protocol.
//!
//! These types speak the peer half of every exchange a worker performs:
//! accepting worker lines from the master socket, reading registrations and
//! reports, issuing `S:`/`C:` requests and driving a command to its exit
//! code. `warmfork-ctl` and the integration tests are built on them.

use std::os::fd::{AsFd, AsRawFd};
use std::path::Path;
use std::process::{Child, Command};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use tracing::debug;

use crate::channel::ControlChannel;
use crate::config::DEFAULT_MASTER_FD_VAR;
use crate::protocol::{self, Identifier, Registration, Report, Request};
use crate::{AgentError, Result};

/// Coordinator end of the master socket that workers attach to.
#[derive(Debug)]
pub struct MasterSocket {
    channel: ControlChannel,
}

impl MasterSocket {
    /// Create the master socket and the endpoint to hand to a worker.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Channel` if the socket pair cannot be created.
    pub fn pair() -> Result<(Self, ControlChannel)> {
        let (master, worker_end) = ControlChannel::pair()?;
        Ok((Self { channel: master }, worker_end))
    }

    /// Wait for the next worker to send its dedicated line.
    ///
    /// # Errors
    ///
    /// Returns the channel error if no handle can be received.
    pub fn accept_worker(&self) -> Result<WorkerLink> {
        let fd = self.channel.receive_handle()?;
        Ok(WorkerLink {
            channel: ControlChannel::from(fd),
        })
    }
}

/// Coordinator end of one worker's dedicated line.
#[derive(Debug)]
pub struct WorkerLink {
    channel: ControlChannel,
}

impl WorkerLink {
    /// Read the worker's `P:` registration.
    ///
    /// # Errors
    ///
    /// Returns channel or protocol errors.
    pub fn registration(&self) -> Result<Registration> {
        Registration::parse(&self.channel.receive()?)
    }

    /// Read the worker's `R:` report for its initial action.
    ///
    /// # Errors
    ///
    /// Returns channel or protocol errors.
    pub fn report(&self) -> Result<Report> {
        Report::parse(&self.channel.receive()?)
    }

    /// Ask the worker to fork a new worker for `identifier`.
    ///
    /// The new worker attaches to the master socket, not to this line.
    ///
    /// # Errors
    ///
    /// Returns channel errors.
    pub fn boot(&self, identifier: &Identifier) -> Result<()> {
        self.channel
            .send(&Request::Spawn(identifier.clone()).encode())
    }

    /// Ask the worker to run `identifier` as a command and return the
    /// command's dedicated channel.
    ///
    /// # Errors
    ///
    /// Returns channel errors.
    pub fn command(&self, identifier: &Identifier) -> Result<CommandLink> {
        self.channel
            .send(&Request::Command(identifier.clone()).encode())?;
        let fd = self.channel.receive_handle()?;
        Ok(CommandLink {
            channel: ControlChannel::from(fd),
        })
    }

    /// Close the line; the worker's request loop ends.
    pub fn close(self) {
        self.channel.close();
    }
}

/// Requester end of one command's dedicated channel.
#[derive(Debug)]
pub struct CommandLink {
    channel: ControlChannel,
}

impl CommandLink {
    /// Send the command's argument list.
    ///
    /// # Errors
    ///
    /// Returns protocol errors for oversize lists and channel errors.
    pub fn send_arguments(&self, arguments: &[String]) -> Result<()> {
        self.channel.send(&protocol::encode_arguments(arguments)?)
    }

    /// Send the terminal the command binds as its stdio.
    ///
    /// # Errors
    ///
    /// Returns channel errors.
    pub fn send_terminal(&self, terminal: impl AsFd) -> Result<()> {
        self.channel.send_handle(terminal)
    }

    /// Read the command process's `P:<pid>:\n` registration.
    ///
    /// # Errors
    ///
    /// Returns channel or protocol errors.
    pub fn registration(&self) -> Result<Registration> {
        Registration::parse(&self.channel.receive()?)
    }

    /// Block until the proxy reports the command's exit code.
    ///
    /// # Errors
    ///
    /// Returns channel or protocol errors.
    pub fn exit_code(&self) -> Result<i32> {
        protocol::parse_exit_code(&self.channel.receive()?)
    }
}

/// Options for launching an agent process.
#[derive(Debug, Clone, Copy)]
pub struct LaunchOptions<'a> {
    /// Path of the `warmfork-agent` binary.
    pub program: &'a Path,
    /// Configuration file passed with `--config`.
    pub config: Option<&'a Path>,
    /// Identifier the root worker boots with.
    pub identifier: &'a Identifier,
    /// Environment variable carrying the master descriptor.
    pub master_fd_var: &'a str,
}

impl<'a> LaunchOptions<'a> {
    /// Options with no config file and the default descriptor variable.
    #[must_use]
    pub fn new(program: &'a Path, identifier: &'a Identifier) -> Self {
        Self {
            program,
            config: None,
            identifier,
            master_fd_var: DEFAULT_MASTER_FD_VAR,
        }
    }

    /// Pass a configuration file to the agent.
    #[must_use]
    pub fn with_config(mut self, config: &'a Path) -> Self {
        self.config = Some(config);
        self
    }
}

/// Start an agent process attached to a fresh master socket.
///
/// # Errors
///
/// Returns `AgentError::Process` if the descriptor cannot be made
/// inheritable or the program cannot be started.
pub fn launch_agent(options: &LaunchOptions<'_>) -> Result<(Child, MasterSocket)> {
    let (master, worker_end) = MasterSocket::pair()?;
    let fd = worker_end.as_raw_fd();

    let bits = fcntl(fd, FcntlArg::F_GETFD)
        .map_err(|errno| AgentError::Process(format!("failed to read descriptor flags: {errno}")))?;
    let mut flags = FdFlag::from_bits_truncate(bits);
    flags.remove(FdFlag::FD_CLOEXEC);
    fcntl(fd, FcntlArg::F_SETFD(flags))
        .map_err(|errno| AgentError::Process(format!("failed to make descriptor inheritable: {errno}")))?;

    let mut cmd = Command::new(options.program);
    if let Some(config) = options.config {
        cmd.arg("--config").arg(config);
    }
    cmd.arg(options.identifier.as_str())
        .env(options.master_fd_var, fd.to_string());

    let child = cmd.spawn().map_err(|err| {
        AgentError::Process(format!(
            "failed to start {}: {err}",
            options.program.display()
        ))
    })?;
    debug!(pid = child.id(), fd, "agent launched");

    worker_end.close();
    Ok((child, master))
}
