//! Append-only diagnostic log of failure reports.
//!
//! Every failed action appends its `R:` report as one block. The file is
//! opened per write so that forked processes never share a buffered writer;
//! each block goes out in a single `write` on an `O_APPEND` descriptor.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{AgentError, Result};

/// Append-only text log of failure reports.
#[derive(Debug, Clone)]
pub struct DiagnosticLog {
    path: PathBuf,
}

impl DiagnosticLog {
    /// Log writing to `path`. Nothing is created until the first append.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one block, terminating it with a newline if it lacks one.
    ///
    /// Missing parent directories are created.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Io` if the file cannot be opened or written.
    pub fn append(&self, block: &str) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                AgentError::Io(format!(
                    "failed to create diagnostic log directory {}: {err}",
                    parent.display()
                ))
            })?;
        }

        let mut buf = String::with_capacity(block.len() + 1);
        buf.push_str(block);
        if !buf.ends_with('\n') {
            buf.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| {
                AgentError::Io(format!(
                    "failed to open diagnostic log {}: {err}",
                    self.path.display()
                ))
            })?;
        file.write_all(buf.as_bytes()).map_err(|err| {
            AgentError::Io(format!(
                "failed to append to diagnostic log {}: {err}",
                self.path.display()
            ))
        })?;

        debug!(path = %self.path.display(), bytes = buf.len(), "diagnostic block appended");
        Ok(())
    }
}
