//! `warmfork`: worker agent for a process-preloading supervisor.
//!
//! A worker boots an application action once, then forks warm copies of
//! itself or one-shot commands on request from a coordinator, talking over
//! Unix datagram sockets that carry both messages and descriptors.

pub mod agent;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod diagnostics;
pub mod errors;
pub mod plan;
pub mod process;
pub mod protocol;
pub mod proxy;
pub mod reaper;
pub mod runner;

pub use config::AgentConfig;
pub use errors::{AgentError, Result};
