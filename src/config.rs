//! Agent configuration parsing and validation.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::protocol::{Identifier, DEFAULT_IDENTIFIER};
use crate::{AgentError, Result};

/// Environment variable carrying the inherited master descriptor number.
pub const DEFAULT_MASTER_FD_VAR: &str = "WARMFORK_MASTER_FD";

fn default_master_fd_var() -> String {
    DEFAULT_MASTER_FD_VAR.into()
}

fn default_identifier() -> String {
    DEFAULT_IDENTIFIER.into()
}

fn default_diagnostic_log() -> PathBuf {
    PathBuf::from("warmfork.log")
}

/// One named action of the configuration-driven plan.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ActionConfig {
    /// Program and fixed arguments; command arguments are appended. Empty
    /// means the action only applies `env`.
    #[serde(default)]
    pub command: Vec<String>,
    /// Variables exported into the agent's own environment before the
    /// command runs, so that every descendant inherits them.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Files reported as loaded once the action has run.
    #[serde(default)]
    pub watch: Vec<PathBuf>,
}

/// Agent configuration parsed from `warmfork.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Name of the environment variable holding the master descriptor.
    #[serde(default = "default_master_fd_var")]
    pub master_fd_var: String,
    /// Identifier booted when the entry point is given none.
    #[serde(default = "default_identifier")]
    pub default_identifier: String,
    /// Append-only file receiving every failure report.
    #[serde(default = "default_diagnostic_log")]
    pub diagnostic_log: PathBuf,
    /// Actions available to the configuration-driven plan.
    #[serde(default)]
    pub actions: BTreeMap<String, ActionConfig>,
    /// File this configuration was loaded from, if any.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            master_fd_var: default_master_fd_var(),
            default_identifier: default_identifier(),
            diagnostic_log: default_diagnostic_log(),
            actions: BTreeMap::new(),
            source: None,
        }
    }
}

impl AgentConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            AgentError::Config(format!("failed to read config {}: {err}", path.display()))
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.source = Some(path.to_owned());
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read the inherited master descriptor number from the environment.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Config` if the variable is missing or not a
    /// non-negative integer.
    pub fn master_fd(&self) -> Result<RawFd> {
        let raw = env::var(&self.master_fd_var).map_err(|_| {
            AgentError::Config(format!(
                "{} is not set; the agent must be started by a coordinator",
                self.master_fd_var
            ))
        })?;
        let fd = raw.trim().parse::<RawFd>().map_err(|err| {
            AgentError::Config(format!("{}={raw:?} is not a descriptor: {err}", self.master_fd_var))
        })?;
        if fd < 0 {
            return Err(AgentError::Config(format!(
                "{}={fd} is negative",
                self.master_fd_var
            )));
        }
        Ok(fd)
    }

    /// Resolve the identifier the agent boots with.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Config` if the requested identifier is invalid.
    pub fn initial_identifier(&self, requested: Option<&str>) -> Result<Identifier> {
        let raw = requested.unwrap_or(&self.default_identifier);
        Identifier::new(raw)
            .map_err(|err| AgentError::Config(format!("invalid initial identifier: {err}")))
    }

    /// Look up an action by name.
    #[must_use]
    pub fn action(&self, name: &str) -> Option<&ActionConfig> {
        self.actions.get(name)
    }

    /// Human-readable origin used in failure locations.
    #[must_use]
    pub fn source_label(&self) -> String {
        self.source.as_ref().map_or_else(
            || "<defaults>".to_owned(),
            |path| path.display().to_string(),
        )
    }

    fn validate(&self) -> Result<()> {
        if self.master_fd_var.is_empty() {
            return Err(AgentError::Config("master_fd_var must not be empty".into()));
        }

        Identifier::new(self.default_identifier.as_str())
            .map_err(|err| AgentError::Config(format!("default_identifier invalid: {err}")))?;

        for (name, action) in &self.actions {
            Identifier::new(name.as_str())
                .map_err(|err| AgentError::Config(format!("action name {name:?} invalid: {err}")))?;

            if action.command.first().is_some_and(String::is_empty) {
                return Err(AgentError::Config(format!(
                    "action {name}: command program must not be empty"
                )));
            }

            for (key, value) in &action.env {
                if key.is_empty() || key.contains('=') || key.contains('\0') {
                    return Err(AgentError::Config(format!(
                        "action {name}: invalid environment variable name {key:?}"
                    )));
                }
                if value.contains('\0') {
                    return Err(AgentError::Config(format!(
                        "action {name}: value of {key} contains a NUL byte"
                    )));
                }
            }
        }

        Ok(())
    }
}
