//! Configuration-driven plan.
//!
//! Each `[actions.<name>]` table exports environment into the current
//! process and optionally runs a program, appending the command arguments.
//! Exported variables persist in the worker, so every descendant inherits
//! the warmed environment.

use std::env;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Command, ExitStatus};
use std::sync::Arc;

use tracing::debug;

use super::{ActionContext, ActionFailure, ActionResult, Plan};
use crate::config::AgentConfig;

/// A [`Plan`] whose actions are declared in [`AgentConfig::actions`].
#[derive(Debug, Clone)]
pub struct CommandPlan {
    config: Arc<AgentConfig>,
    loaded: Vec<PathBuf>,
}

impl CommandPlan {
    /// Build a plan over the configured actions.
    #[must_use]
    pub fn new(config: Arc<AgentConfig>) -> Self {
        Self {
            config,
            loaded: Vec::new(),
        }
    }

    fn location(&self, context: &ActionContext<'_>) -> String {
        format!(
            "{}:[actions.{}]",
            self.config.source_label(),
            context.identifier
        )
    }
}

impl Plan for CommandPlan {
    fn invoke(&mut self, context: &ActionContext<'_>) -> ActionResult {
        let location = self.location(context);
        let frames = lineage_frames(context);

        let Some(action) = self.config.action(context.identifier.as_str()) else {
            return Err(ActionFailure::new(
                location,
                format!("no action named `{}`", context.identifier),
                "UnknownAction",
            )
            .with_frames(frames));
        };

        for (key, value) in &action.env {
            env::set_var(key, value);
        }
        self.loaded.extend(action.watch.iter().cloned());

        let Some((program, fixed)) = action.command.split_first() else {
            debug!(identifier = %context.identifier, "action has no command");
            return Ok(());
        };

        let status = Command::new(program)
            .args(fixed)
            .args(context.arguments)
            .status()
            .map_err(|err| {
                ActionFailure::new(
                    location.clone(),
                    format!("failed to start `{program}`: {err}"),
                    "SpawnError",
                )
                .with_frames(frames.clone())
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(failure_for_status(location, program, status).with_frames(frames))
        }
    }

    fn after_fork(&mut self) {
        self.loaded.clear();
    }

    fn loaded_files(&self) -> Vec<PathBuf> {
        self.loaded.clone()
    }
}

fn failure_for_status(location: String, program: &str, status: ExitStatus) -> ActionFailure {
    if let Some(code) = status.code() {
        ActionFailure::new(
            location,
            format!("`{program}` exited with code {code}"),
            "CommandFailed",
        )
        .with_exit_code(code)
    } else if let Some(signal) = status.signal() {
        ActionFailure::new(
            location,
            format!("`{program}` was terminated by signal {signal}"),
            "CommandKilled",
        )
        .with_exit_code(128 + signal)
    } else {
        ActionFailure::new(location, format!("`{program}` failed: {status}"), "CommandFailed")
    }
}

/// Stack frames for a failure: the invoking workers, innermost first.
fn lineage_frames(context: &ActionContext<'_>) -> Vec<String> {
    context
        .lineage
        .iter()
        .rev()
        .map(|identifier| format!("worker `{identifier}`"))
        .collect()
}
