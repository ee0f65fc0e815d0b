//! Agent shutdown when the coordinator goes away.

use serial_test::serial;

use warmfork::protocol::Identifier;

use super::test_helpers::{launch_booted, wait_exit, Workspace};

#[test]
#[serial]
fn closing_the_line_stops_the_agent() {
    let workspace = Workspace::new("[actions.boot]\n");
    let (mut child, master, root) = launch_booted(&workspace, "boot");

    root.close();
    assert_eq!(wait_exit(&mut child), Some(0));
    assert!(master.accept_worker().is_err(), "no worker may still hold the master end");
}

#[test]
#[serial]
fn spawned_worker_outlives_its_parent_until_its_line_closes() {
    let workspace = Workspace::new("[actions.boot]\n\n[actions.test]\n");
    let (mut child, master, root) = launch_booted(&workspace, "boot");

    root.boot(&Identifier::new("test").expect("id")).expect("spawn");
    let spawned = master.accept_worker().expect("accept");
    spawned.registration().expect("registration");
    spawned.report().expect("report");

    root.close();
    assert_eq!(wait_exit(&mut child), Some(0));

    // The spawned worker still holds the master end and still serves.
    spawned.boot(&Identifier::new("test").expect("id")).expect("spawn again");
    let grandchild = master.accept_worker().expect("accept grandchild");
    assert!(grandchild.registration().is_ok());
    assert!(grandchild.report().expect("report").is_ok());

    grandchild.close();
    spawned.close();
    assert!(master.accept_worker().is_err());
}
