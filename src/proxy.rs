//! One-shot command proxy.
//!
//! The proxy runs in a child forked for a `C:` request. It becomes a session
//! leader, hands the requester a dedicated channel, reads the JSON argument
//! list, forks the command process and reports that process's exit code.
//!
//! Channel traffic, in order:
//!
//! 1. proxy → requester (on the worker line): handle of the dedicated channel
//! 2. requester → proxy: JSON argument list
//! 3. requester → command process: terminal handle
//! 4. command process → requester: `P:<pid>:\n`
//! 5. proxy → requester: `<exit code>\n`

use std::io::Write as _;

use tracing::{debug, error, info, info_span};

use crate::channel::ControlChannel;
use crate::plan::{ActionContext, ActionOutcome, Plan};
use crate::process::{self, ChildExit, Forked, Role};
use crate::protocol::{self, Identifier, Registration};
use crate::runner::invoke_guarded;
use crate::Result;

/// Runs one command for the requester on the other end of a worker line.
pub struct CommandProxy<'a, P: Plan + ?Sized> {
    plan: &'a mut P,
    lineage: &'a [Identifier],
}

impl<'a, P: Plan + ?Sized> CommandProxy<'a, P> {
    /// Proxy invoking actions of `plan` on behalf of the worker `lineage`.
    pub fn new(plan: &'a mut P, lineage: &'a [Identifier]) -> Self {
        Self { plan, lineage }
    }

    /// Proxy one command end to end and return how the command terminated.
    ///
    /// Consumes `channel`; it is closed once the dedicated channel has been
    /// handed over.
    ///
    /// # Errors
    ///
    /// Returns session, channel or wait failures. The command's own failure
    /// is not an error: it only shows up in the returned exit status.
    pub fn handle(self, identifier: &Identifier, channel: ControlChannel) -> Result<ChildExit> {
        let span = info_span!("command_proxy", identifier = %identifier);
        let _guard = span.enter();

        process::set_process_name(&format!("wf run: {identifier}"));
        process::become_session_leader()?;

        let (local, remote) = ControlChannel::pair()?;
        channel.send_handle(&remote)?;
        remote.close();
        channel.close();

        let arguments = local.receive()?;

        match process::fork_child()? {
            Forked::Child => {
                let code = self.run_command(identifier, &arguments, local);
                process::exit(code)
            }
            Forked::Parent(pid) => {
                info!(pid = pid.as_raw(), "command process started");
                let exit = process::wait_for(pid)?;
                info!(pid = pid.as_raw(), code = exit.code(), %exit, "command process finished");
                local.send(&protocol::encode_exit_code(exit.code()))?;
                local.close();
                Ok(exit)
            }
        }
    }

    /// Body of the command process; returns its exit code.
    fn run_command(self, identifier: &Identifier, raw_arguments: &[u8], local: ControlChannel) -> i32 {
        self.plan.after_fork();

        let terminal = match local.receive_handle() {
            Ok(fd) => fd,
            Err(err) => {
                error!(%err, "no terminal handle received");
                return 1;
            }
        };
        let registration = Registration::command(process::current_pid().as_raw());
        if let Err(err) = local.send(&registration.encode()) {
            error!(%err, "failed to register command process");
            return 1;
        }
        local.close();

        if let Err(err) = process::redirect_stdio(&terminal) {
            error!(%err, "failed to bind terminal");
            return 1;
        }
        drop(terminal);

        let arguments = match protocol::decode_arguments(raw_arguments) {
            Ok(arguments) => arguments,
            Err(err) => {
                if let Err(write_err) = writeln!(std::io::stderr(), "{err}") {
                    debug!(%write_err, "failed to write to terminal");
                }
                return 1;
            }
        };

        let context = ActionContext {
            identifier,
            arguments: &arguments,
            lineage: self.lineage,
            role: Role::Command,
        };
        let outcome = invoke_guarded(self.plan, &context);
        if let ActionOutcome::Failed(failure) = &outcome {
            // The exit code is reported either way.
            if let Err(write_err) = write!(std::io::stderr(), "{}", failure.report()) {
                debug!(%write_err, "failed to write failure report to terminal");
            }
        }
        outcome.exit_code()
    }
}
