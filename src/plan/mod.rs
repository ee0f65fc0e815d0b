//! The application plan: named actions plus a post-fork reset hook.
//!
//! The agent never interprets what an action does. It invokes actions by
//! identifier through the [`Plan`] trait and turns the returned
//! [`ActionResult`] into a wire report. [`command::CommandPlan`] is the
//! configuration-driven implementation used by the `warmfork-agent` binary.

pub mod command;

use std::any::Any;
use std::fmt::Write as _;
use std::path::PathBuf;

use tracing::info;

use crate::process::Role;
use crate::protocol::{Identifier, Report};

/// Everything an action learns about its invocation.
#[derive(Debug, Clone, Copy)]
pub struct ActionContext<'a> {
    /// Name of the action being invoked.
    pub identifier: &'a Identifier,
    /// Command-line arguments; empty for worker boots.
    pub arguments: &'a [String],
    /// Worker identifiers from the root of the tree down to the invoking agent.
    pub lineage: &'a [Identifier],
    /// Whether the action warms a worker or runs a one-shot command.
    pub role: Role,
}

/// Structured description of a failed action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionFailure {
    /// Topmost call site (for example `app/boot.rs:10`).
    pub location: String,
    /// Failure message.
    pub message: String,
    /// Failure category (for example `RuntimeError`).
    pub category: String,
    /// Remaining stack frames, innermost first.
    pub frames: Vec<String>,
    /// Exit code a command process should terminate with; defaults to 1.
    pub exit_code: Option<i32>,
}

impl ActionFailure {
    /// Create a failure with no frames.
    #[must_use]
    pub fn new(
        location: impl Into<String>,
        message: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            location: location.into(),
            message: message.into(),
            category: category.into(),
            frames: Vec::new(),
            exit_code: None,
        }
    }

    /// Attach stack frames.
    #[must_use]
    pub fn with_frames(mut self, frames: Vec<String>) -> Self {
        self.frames = frames;
        self
    }

    /// Attach the exit code a command process should report.
    #[must_use]
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    /// Build a failure from a caught panic payload.
    #[must_use]
    pub fn from_panic(identifier: &Identifier, payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "action panicked".to_owned());
        Self::new(format!("action `{identifier}`"), message, "Panic")
    }

    /// First report line: `<location>: <message> (<category>)`.
    #[must_use]
    pub fn headline(&self) -> String {
        format!("{}: {} ({})", self.location, self.message, self.category)
    }

    /// Full multi-line report without the `R:` tag.
    #[must_use]
    pub fn report(&self) -> String {
        let mut out = self.headline();
        out.push('\n');
        for frame in &self.frames {
            let _ = writeln!(out, "\tfrom {frame}");
        }
        out
    }

    /// Exit code a command process terminates with for this failure.
    #[must_use]
    pub fn command_exit_code(&self) -> i32 {
        self.exit_code.unwrap_or(1)
    }
}

/// Result returned by [`Plan::invoke`].
pub type ActionResult = std::result::Result<(), ActionFailure>;

/// Outcome of one action invocation, as seen by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The action returned normally.
    Succeeded,
    /// The action failed or panicked.
    Failed(ActionFailure),
}

impl ActionOutcome {
    /// Whether the action succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Wire report for this outcome.
    #[must_use]
    pub fn to_report(&self) -> Report {
        match self {
            Self::Succeeded => Report::Ok,
            Self::Failed(failure) => Report::Failed(failure.report()),
        }
    }

    /// Exit code a command process terminates with.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Succeeded => 0,
            Self::Failed(failure) => failure.command_exit_code(),
        }
    }
}

/// An application's preloadable actions.
///
/// A plan is owned by one process. After every fork the child calls
/// [`Plan::after_fork`] before doing anything else, so the plan can drop
/// resources that must not be shared across processes.
pub trait Plan {
    /// Run the action named by `context.identifier`.
    ///
    /// # Errors
    ///
    /// Returns an [`ActionFailure`] describing why the action did not complete.
    fn invoke(&mut self, context: &ActionContext<'_>) -> ActionResult;

    /// Reset state that cannot survive a fork (connections, caches).
    fn after_fork(&mut self) {}

    /// Files loaded by the actions run so far in this process.
    fn loaded_files(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

/// Receives the list of files an action caused to be loaded.
///
/// Invoked from a detached background thread, possibly several times per
/// boot with consecutive batches of the list. Implementations must not
/// assume they run before or after any particular request.
pub trait LoadedFilesSink: Send + Sync {
    /// Handle one batch of the files loaded while booting `identifier`.
    fn files_loaded(&self, identifier: &Identifier, files: &[PathBuf]);
}

/// Default sink: records loaded files in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LoadedFilesSink for TracingSink {
    fn files_loaded(&self, identifier: &Identifier, files: &[PathBuf]) {
        for file in files {
            info!(%identifier, file = %file.display(), "file loaded");
        }
    }
}
