//! `C:` requests against the real agent binary.

use std::fs::File;

use serial_test::serial;

use warmfork::coordinator::WorkerLink;
use warmfork::protocol::Identifier;

use super::test_helpers::{launch_booted, wait_exit, Workspace};

const ACTIONS: &str = r#"
[actions.boot]
env = { WARMFORK_APP = "warm" }

[actions.runTests]
command = ["sh", "-c", "echo \"running $1 in $WARMFORK_APP\"; test \"$1\" = --fast", "runTests"]

[actions.failing]
command = ["sh", "-c", "echo broken >&2; exit 5"]
"#;

fn run(worker: &WorkerLink, action: &str, arguments: &[&str]) -> (i32, String) {
    let dir = tempfile::tempdir().expect("tempdir");
    let terminal_path = dir.path().join("terminal");
    let terminal = File::create(&terminal_path).expect("terminal");

    let link = worker
        .command(&Identifier::new(action).expect("id"))
        .expect("command link");
    let arguments: Vec<String> = arguments.iter().map(|s| (*s).to_owned()).collect();
    link.send_arguments(&arguments).expect("arguments");
    link.send_terminal(&terminal).expect("terminal");
    drop(terminal);

    let registration = link.registration().expect("registration");
    assert!(registration.pid > 0);
    assert!(registration.identifier.is_none());

    let code = link.exit_code().expect("exit code");
    let output = std::fs::read_to_string(&terminal_path).expect("read terminal");
    (code, output)
}

#[test]
#[serial]
fn command_runs_with_arguments_and_terminal() {
    let workspace = Workspace::new(ACTIONS);
    let (mut child, _master, root) = launch_booted(&workspace, "boot");

    let (code, output) = run(&root, "runTests", &["--fast"]);
    assert_eq!(code, 0);
    assert_eq!(output, "running --fast in warm\n");

    root.close();
    assert_eq!(wait_exit(&mut child), Some(0));
}

#[test]
#[serial]
fn command_exit_code_is_propagated() {
    let workspace = Workspace::new(ACTIONS);
    let (mut child, _master, root) = launch_booted(&workspace, "boot");

    let (code, output) = run(&root, "runTests", &["--slow"]);
    assert_eq!(code, 1);
    assert!(output.starts_with("running --slow in warm\n"));
    assert!(output.contains("exited with code 1 (CommandFailed)"));

    let (code, output) = run(&root, "failing", &[]);
    assert_eq!(code, 5);
    assert!(output.starts_with("broken\n"));
    assert!(output.contains("[actions.failing]: `sh` exited with code 5 (CommandFailed)"));

    root.close();
    assert_eq!(wait_exit(&mut child), Some(0));
}

#[test]
#[serial]
fn unknown_command_exits_with_one() {
    let workspace = Workspace::new(ACTIONS);
    let (mut child, _master, root) = launch_booted(&workspace, "boot");

    let (code, output) = run(&root, "missing", &[]);
    assert_eq!(code, 1);
    assert!(output.contains("no action named `missing` (UnknownAction)"));

    root.close();
    assert_eq!(wait_exit(&mut child), Some(0));
}

#[test]
#[serial]
fn commands_and_spawns_interleave() {
    let workspace = Workspace::new(ACTIONS);
    let (mut child, master, root) = launch_booted(&workspace, "boot");

    assert_eq!(run(&root, "runTests", &["--fast"]).0, 0);

    root.boot(&Identifier::new("boot").expect("id")).expect("spawn");
    let spawned = master.accept_worker().expect("accept");
    spawned.registration().expect("registration");
    assert!(spawned.report().expect("report").is_ok());

    assert_eq!(run(&spawned, "runTests", &["--fast"]).0, 0);
    assert_eq!(run(&root, "failing", &[]).0, 5);

    spawned.close();
    root.close();
    assert_eq!(wait_exit(&mut child), Some(0));
}
