//! `warmfork-ctl`: local CLI coordinator for `warmfork-agent`.
//!
//! Launches an agent on a fresh master socket, waits for the root worker to
//! attach and then either reports its boot or runs one command through it.
//! Meant for trying out a configuration by hand.

use std::fs::OpenOptions;
use std::os::fd::{AsFd, OwnedFd};
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use warmfork::coordinator::{launch_agent, LaunchOptions, WorkerLink};
use warmfork::protocol::{Identifier, Report, DEFAULT_IDENTIFIER};

#[derive(Debug, Parser)]
#[command(
    name = "warmfork-ctl",
    about = "Local CLI coordinator for warmfork-agent",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the `warmfork-agent` binary.
    ///
    /// When omitted, `warmfork-agent` next to this executable is used.
    #[arg(long)]
    agent: Option<PathBuf>,

    /// Configuration file passed through to the agent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Identifier the root worker boots with.
    #[arg(long, default_value = DEFAULT_IDENTIFIER)]
    identifier: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Boot a worker and print its registration and report.
    Boot,

    /// Boot a worker, then run an action as a command through it.
    Run {
        /// Action identifier to run.
        action: String,
        /// Arguments passed to the action.
        #[arg(last = true)]
        args: Vec<String>,
    },
}

impl Cli {
    fn agent_path(&self) -> PathBuf {
        if let Some(ref path) = self.agent {
            return path.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("warmfork-agent")))
            .unwrap_or_else(|| PathBuf::from("warmfork-agent"))
    }
}

fn main() {
    let args = Cli::parse();

    let identifier = parse_identifier(&args.identifier);
    let program = args.agent_path();
    let mut options = LaunchOptions::new(&program, &identifier);
    if let Some(config) = args.config.as_deref() {
        options = options.with_config(config);
    }

    let (mut child, master) = match launch_agent(&options) {
        Ok(launched) => launched,
        Err(err) => {
            eprintln!("Failed to launch agent: {err}");
            std::process::exit(1);
        }
    };

    let result = master.accept_worker().and_then(|worker| {
        let registration = worker.registration()?;
        println!("registered: pid {} as {identifier}", registration.pid);
        match worker.report()? {
            Report::Ok => println!("boot: ok"),
            Report::Failed(report) => {
                println!("boot: failed");
                eprint!("{report}");
            }
        }
        Ok(worker)
    });

    let worker = match result {
        Ok(worker) => worker,
        Err(err) => {
            eprintln!("Error: {err}");
            let _ = child.kill();
            let _ = child.wait();
            std::process::exit(1);
        }
    };

    let code = match &args.command {
        Command::Boot => 0,
        Command::Run {
            action,
            args: arguments,
        } => run_command(&worker, &parse_identifier(action), arguments),
    };

    worker.close();
    let _ = child.wait();
    std::process::exit(code);
}

/// Run `action` through `worker` with this process's terminal as stdio.
fn run_command(worker: &WorkerLink, action: &Identifier, arguments: &[String]) -> i32 {
    let result = worker.command(action).and_then(|link| {
        link.send_arguments(arguments)?;
        link.send_terminal(terminal().as_fd())?;
        let registration = link.registration()?;
        eprintln!("command {action} running as pid {}", registration.pid);
        link.exit_code()
    });

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err}");
            1
        }
    }
}

/// Controlling terminal, or stdout when there is none.
fn terminal() -> OwnedFd {
    match OpenOptions::new().read(true).write(true).open("/dev/tty") {
        Ok(tty) => tty.into(),
        Err(_) => match std::io::stdout().as_fd().try_clone_to_owned() {
            Ok(fd) => fd,
            Err(err) => {
                eprintln!("Failed to duplicate stdout: {err}");
                std::process::exit(1);
            }
        },
    }
}

fn parse_identifier(raw: &str) -> Identifier {
    match Identifier::new(raw) {
        Ok(identifier) => identifier,
        Err(err) => {
            eprintln!("Invalid identifier '{raw}': {err}");
            std::process::exit(1);
        }
    }
}
