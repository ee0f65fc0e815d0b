//! Worker agent: one node of the preloaded process tree.
//!
//! Lifecycle of a worker:
//!
//! 1. **Bootstrapping**: create a fresh channel pair and send its remote
//!    end to the master; the pair becomes this worker's dedicated line.
//! 2. **Registered**: send `P:<pid>:<identifier>` on the line.
//! 3. **Serving**: run the initial action once, notify loaded files in the
//!    background and start the child reaper.
//! 4. **Request loop**: fork a new worker for every `S:` request and a
//!    command proxy for every `C:` request until the line closes.
//!
//! A failed registration or initial action is reported but the loop is
//! still entered. Losing the line ends the worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use nix::unistd::Pid;
use tracing::{error, info, info_span, warn};

use crate::channel::ControlChannel;
use crate::config::AgentConfig;
use crate::diagnostics::DiagnosticLog;
use crate::plan::{ActionContext, LoadedFilesSink, Plan, TracingSink};
use crate::process::{self, ForkGuard, Forked, Role, SpawnRequest};
use crate::protocol::{Identifier, Registration, Request};
use crate::proxy::CommandProxy;
use crate::reaper::ChildReaper;
use crate::runner::ActionRunner;
use crate::{AgentError, Result};

/// Loaded files handed to the sink per call.
const NOTIFY_BATCH: usize = 32;

/// A live child forked by this worker.
#[derive(Debug, Clone)]
struct ProcessRecord {
    role: Role,
    identifier: Identifier,
}

/// Worker agent owning a plan and the inherited master channel.
pub struct WorkerAgent<P: Plan> {
    plan: P,
    master: ControlChannel,
    log: DiagnosticLog,
    sink: Arc<dyn LoadedFilesSink>,
    lineage: Vec<Identifier>,
    fork_guard: ForkGuard,
}

impl<P: Plan> WorkerAgent<P> {
    /// Build an agent that attaches to the coordinator through `master`.
    pub fn new(plan: P, master: ControlChannel, config: &AgentConfig) -> Self {
        Self {
            plan,
            master,
            log: DiagnosticLog::new(config.diagnostic_log.clone()),
            sink: Arc::new(TracingSink),
            lineage: Vec::new(),
            fork_guard: ForkGuard::default(),
        }
    }

    /// Replace the loaded-files notification sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn LoadedFilesSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Boot as `identifier` and serve requests until the line closes.
    ///
    /// In forked children this is re-entered for `S:` requests; the child
    /// never returns into its parent's loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the line cannot be established or fails while
    /// serving. A closed line is a normal shutdown and returns `Ok`.
    pub fn go(&mut self, identifier: Identifier) -> Result<()> {
        let pid = process::current_pid();
        let span = info_span!("worker", identifier = %identifier, pid = pid.as_raw());
        let _guard = span.enter();

        process::set_process_name(&format!("wf: {identifier}"));
        self.lineage.push(identifier.clone());

        let line = self.attach()?;
        self.register(&line, pid, &identifier);
        self.run_initial_action(&line, &identifier)?;
        self.notify_loaded_files(&identifier);

        let reaper = ChildReaper::install(&self.fork_guard)?;
        self.serve(line, &reaper)
    }

    /// Create the dedicated line and hand its remote end to the master.
    fn attach(&self) -> Result<ControlChannel> {
        let (line, remote) = ControlChannel::pair()?;
        self.master.send_handle(&remote)?;
        remote.close();
        Ok(line)
    }

    fn register(&self, line: &ControlChannel, pid: Pid, identifier: &Identifier) {
        let registration = Registration::worker(pid.as_raw(), identifier.clone());
        match line.send(&registration.encode()) {
            Ok(()) => info!("registered with coordinator"),
            Err(err) => error!(%err, "failed to register with coordinator"),
        }
    }

    fn run_initial_action(&mut self, line: &ControlChannel, identifier: &Identifier) -> Result<()> {
        let context = ActionContext {
            identifier,
            arguments: &[],
            lineage: &self.lineage,
            role: Role::Worker,
        };
        let outcome = ActionRunner::new(&self.log).run(&mut self.plan, line, &context)?;
        if !outcome.is_success() {
            warn!("initial action failed; serving requests anyway");
        }
        Ok(())
    }

    /// Hand the plan's loaded files to the sink on a detached thread.
    ///
    /// Files go out in batches, each under the fork guard, so a request
    /// forking meanwhile waits for one batch at most.
    fn notify_loaded_files(&self, identifier: &Identifier) {
        let files = self.plan.loaded_files();
        if files.is_empty() {
            return;
        }
        let sink = Arc::clone(&self.sink);
        let guard = self.fork_guard.clone();
        let identifier = identifier.clone();
        let spawned = thread::Builder::new()
            .name("loaded-files".into())
            .spawn(move || {
                for batch in files.chunks(NOTIFY_BATCH) {
                    let _held = guard.hold();
                    sink.files_loaded(&identifier, batch);
                }
            });
        if let Err(err) = spawned {
            warn!(%err, "failed to start loaded-files notifier");
        }
    }

    fn serve(&mut self, line: ControlChannel, reaper: &ChildReaper) -> Result<()> {
        let mut children: HashMap<Pid, ProcessRecord> = HashMap::new();

        loop {
            let raw = match line.receive() {
                Ok(raw) => raw,
                Err(AgentError::ChannelClosed) => {
                    info!(live_children = children.len(), "coordinator closed the line");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
            record_reaped(&mut children, reaper);

            let request = match Request::parse(&raw) {
                Ok(request) => SpawnRequest::from(request),
                Err(err) => {
                    warn!(%err, "ignoring malformed request");
                    continue;
                }
            };

            match self.fork_guard.fork()? {
                Forked::Parent(pid) => {
                    info!(
                        child = pid.as_raw(),
                        role = %request.role,
                        identifier = %request.identifier,
                        "spawned child"
                    );
                    children.insert(
                        pid,
                        ProcessRecord {
                            role: request.role,
                            identifier: request.identifier,
                        },
                    );
                    reaper.notify_spawned();
                }
                Forked::Child => {
                    let code = self.spawn_child(request, line);
                    process::exit(code);
                }
            }
        }
    }

    /// Child side of a fork: become the requested role with the inherited
    /// line, and return the process exit code.
    fn spawn_child(&mut self, request: SpawnRequest, line: ControlChannel) -> i32 {
        self.plan.after_fork();

        let result = match request.role {
            Role::Worker => {
                line.close();
                self.go(request.identifier)
            }
            Role::Command => CommandProxy::new(&mut self.plan, &self.lineage)
                .handle(&request.identifier, line)
                .map(|_| ()),
        };

        match result {
            Ok(()) => 0,
            Err(err) => {
                error!(%err, role = %request.role, "child exited with error");
                1
            }
        }
    }
}

fn record_reaped(children: &mut HashMap<Pid, ProcessRecord>, reaper: &ChildReaper) {
    for reaped in reaper.collect() {
        match children.remove(&reaped.pid) {
            Some(record) => info!(
                child = reaped.pid.as_raw(),
                role = %record.role,
                identifier = %record.identifier,
                code = reaped.exit.code(),
                exit = %reaped.exit,
                "child reaped"
            ),
            None => info!(
                child = reaped.pid.as_raw(),
                exit = %reaped.exit,
                "untracked child reaped"
            ),
        }
    }
}
