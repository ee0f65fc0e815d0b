//! Error types shared across the agent.

use std::fmt::{Display, Formatter};

/// Shared agent result type.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent error enumeration covering every failure mode outside plan actions.
///
/// Plan action failures are not errors: they travel as
/// [`crate::plan::ActionFailure`] values and are reported on the wire.
#[derive(Debug)]
pub enum AgentError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Send or receive failure on a control channel.
    Channel(String),
    /// The peer end of a control channel has been closed.
    ChannelClosed,
    /// A message violated the wire protocol (bad tag, oversize payload, bad JSON).
    Protocol(String),
    /// Fork, wait, session or descriptor manipulation failure.
    Process(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AgentError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Channel(msg) => write!(f, "channel: {msg}"),
            Self::ChannelClosed => write!(f, "channel: peer closed"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Process(msg) => write!(f, "process: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AgentError {}

impl From<toml::de::Error> for AgentError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}
