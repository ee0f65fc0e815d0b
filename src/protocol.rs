//! Wire protocol spoken between a worker and its coordinator.
//!
//! Every message is one datagram of at most [`MAX_MESSAGE_BYTES`] bytes,
//! framed as a one-character tag followed by a colon:
//!
//! ```text
//! P:<pid>:<identifier>   worker registration
//! P:<pid>:\n             command process registration
//! R:OK                   action succeeded
//! R:<report>             action failed (multi-line)
//! S:<identifier>         boot a new worker
//! C:<identifier>         run a one-shot command
//! ["a","b"]              command arguments (JSON array of strings)
//! <code>\n               command exit status
//! ```
//!
//! Descriptor transfers are not described here; see [`crate::channel`].

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::{AgentError, Result};

/// Maximum payload carried by a single control datagram.
pub const MAX_MESSAGE_BYTES: usize = 1024;

/// Maximum length of an identifier, so that a registration always fits.
pub const MAX_IDENTIFIER_BYTES: usize = 512;

/// Identifier used when the entry point is given none.
pub const DEFAULT_IDENTIFIER: &str = "boot";

/// Name of an action or boot target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(String);

impl Identifier {
    /// Validate and wrap an identifier.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Protocol` if the name is empty, contains a NUL
    /// byte, or exceeds [`MAX_IDENTIFIER_BYTES`].
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(AgentError::Protocol("identifier must not be empty".into()));
        }
        if raw.contains('\0') {
            return Err(AgentError::Protocol(
                "identifier must not contain NUL bytes".into(),
            ));
        }
        if raw.len() > MAX_IDENTIFIER_BYTES {
            return Err(AgentError::Protocol(format!(
                "identifier exceeds {MAX_IDENTIFIER_BYTES} bytes"
            )));
        }
        Ok(Self(raw))
    }

    /// Borrow the identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Identifier {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// A fork request received by a worker on its dedicated line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `S:<identifier>`: boot a new worker subtree.
    Spawn(Identifier),
    /// `C:<identifier>`: run a one-shot command.
    Command(Identifier),
}

impl Request {
    /// Parse a raw datagram into a request.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Protocol` for non-UTF-8 payloads, unknown tags
    /// and invalid identifiers.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let text = utf8(raw)?;
        if let Some(rest) = text.strip_prefix("S:") {
            Ok(Self::Spawn(Identifier::new(rest)?))
        } else if let Some(rest) = text.strip_prefix("C:") {
            Ok(Self::Command(Identifier::new(rest)?))
        } else {
            Err(AgentError::Protocol(format!(
                "unknown request tag in {:?}",
                preview(text)
            )))
        }
    }

    /// Encode the request for the wire.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Spawn(id) => format!("S:{id}").into_bytes(),
            Self::Command(id) => format!("C:{id}").into_bytes(),
        }
    }

    /// The identifier carried by the request.
    #[must_use]
    pub fn identifier(&self) -> &Identifier {
        match self {
            Self::Spawn(id) | Self::Command(id) => id,
        }
    }
}

/// `P:` registration correlating a PID with a logical identifier.
///
/// Command processes register with no identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Registering process ID.
    pub pid: i32,
    /// Worker identifier; `None` for a command process.
    pub identifier: Option<Identifier>,
}

impl Registration {
    /// Registration sent by a worker agent.
    #[must_use]
    pub fn worker(pid: i32, identifier: Identifier) -> Self {
        Self {
            pid,
            identifier: Some(identifier),
        }
    }

    /// Registration sent by a command process.
    #[must_use]
    pub fn command(pid: i32) -> Self {
        Self {
            pid,
            identifier: None,
        }
    }

    /// Encode as `P:<pid>:<identifier>` or `P:<pid>:\n`.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match &self.identifier {
            Some(id) => format!("P:{}:{id}", self.pid).into_bytes(),
            None => format!("P:{}:\n", self.pid).into_bytes(),
        }
    }

    /// Parse a registration datagram.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Protocol` if the tag, PID or identifier is malformed.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let text = utf8(raw)?;
        let body = text
            .strip_prefix("P:")
            .ok_or_else(|| AgentError::Protocol(format!("expected P: tag in {:?}", preview(text))))?;
        let (pid, rest) = body
            .split_once(':')
            .ok_or_else(|| AgentError::Protocol("registration missing identifier separator".into()))?;
        let pid = pid
            .parse::<i32>()
            .map_err(|err| AgentError::Protocol(format!("invalid registration pid {pid:?}: {err}")))?;
        let rest = rest.strip_suffix('\n').unwrap_or(rest);
        let identifier = if rest.is_empty() {
            None
        } else {
            Some(Identifier::new(rest)?)
        };
        Ok(Self { pid, identifier })
    }
}

/// `R:` action outcome report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    /// `R:OK`.
    Ok,
    /// `R:<report>`: formatted failure report without the tag.
    Failed(String),
}

impl Report {
    /// Encode the report, truncating a failure report so the datagram fits
    /// in [`MAX_MESSAGE_BYTES`].
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Ok => b"R:OK".to_vec(),
            Self::Failed(text) => {
                let body = truncate_to_fit(text, MAX_MESSAGE_BYTES - 2);
                let mut out = Vec::with_capacity(body.len() + 2);
                out.extend_from_slice(b"R:");
                out.extend_from_slice(body.as_bytes());
                out
            }
        }
    }

    /// Parse a report datagram.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Protocol` if the payload is not `R:`-tagged UTF-8.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let text = utf8(raw)?;
        match text.strip_prefix("R:") {
            Some("OK") => Ok(Self::Ok),
            Some(body) => Ok(Self::Failed(body.to_owned())),
            None => Err(AgentError::Protocol(format!(
                "expected R: tag in {:?}",
                preview(text)
            ))),
        }
    }

    /// Whether the report signals success.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Encode a command exit status as `<code>\n`.
#[must_use]
pub fn encode_exit_code(code: i32) -> Vec<u8> {
    format!("{code}\n").into_bytes()
}

/// Parse a `<code>\n` exit status datagram.
///
/// # Errors
///
/// Returns `AgentError::Protocol` if the payload is not a decimal integer.
pub fn parse_exit_code(raw: &[u8]) -> Result<i32> {
    let text = utf8(raw)?;
    text.trim_end_matches('\n')
        .parse::<i32>()
        .map_err(|err| AgentError::Protocol(format!("invalid exit code {:?}: {err}", preview(text))))
}

/// Encode a command's argument list as a JSON array.
///
/// # Errors
///
/// Returns `AgentError::Protocol` if the encoded list exceeds
/// [`MAX_MESSAGE_BYTES`].
pub fn encode_arguments(arguments: &[String]) -> Result<Vec<u8>> {
    let encoded = serde_json::to_vec(arguments)
        .map_err(|err| AgentError::Protocol(format!("failed to encode arguments: {err}")))?;
    if encoded.len() > MAX_MESSAGE_BYTES {
        return Err(AgentError::Protocol(format!(
            "encoded arguments are {} bytes, limit is {MAX_MESSAGE_BYTES}",
            encoded.len()
        )));
    }
    Ok(encoded)
}

/// Decode a JSON array of strings received from the caller.
///
/// # Errors
///
/// Returns `AgentError::Protocol` if the payload is not a JSON array of strings.
pub fn decode_arguments(raw: &[u8]) -> Result<Vec<String>> {
    serde_json::from_slice(raw)
        .map_err(|err| AgentError::Protocol(format!("malformed argument list: {err}")))
}

/// Longest prefix of `text` that fits in `max` bytes without splitting a
/// UTF-8 sequence.
#[must_use]
pub fn truncate_to_fit(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn utf8(raw: &[u8]) -> Result<&str> {
    std::str::from_utf8(raw)
        .map_err(|err| AgentError::Protocol(format!("message is not valid utf-8: {err}")))
}

fn preview(text: &str) -> &str {
    truncate_to_fit(text, 64)
}
