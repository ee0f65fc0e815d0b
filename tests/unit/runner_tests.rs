//! Unit tests for the action runner: one report per invocation, failures
//! logged before they are sent, panics contained.

use warmfork::channel::ControlChannel;
use warmfork::diagnostics::DiagnosticLog;
use warmfork::plan::{ActionContext, ActionFailure, ActionOutcome, ActionResult, Plan};
use warmfork::process::Role;
use warmfork::protocol::{Identifier, Report, MAX_MESSAGE_BYTES};
use warmfork::runner::{invoke_guarded, ActionRunner};
use warmfork::AgentError;

/// Plan whose single behaviour is chosen by the test.
enum Scripted {
    Succeed,
    Fail(ActionFailure),
    Panic,
}

struct ScriptedPlan {
    behaviour: Scripted,
    calls: Vec<String>,
}

impl ScriptedPlan {
    fn new(behaviour: Scripted) -> Self {
        Self {
            behaviour,
            calls: Vec::new(),
        }
    }
}

impl Plan for ScriptedPlan {
    fn invoke(&mut self, context: &ActionContext<'_>) -> ActionResult {
        self.calls.push(context.identifier.to_string());
        match &self.behaviour {
            Scripted::Succeed => Ok(()),
            Scripted::Fail(failure) => Err(failure.clone()),
            Scripted::Panic => panic!("exploded in {}", context.identifier),
        }
    }
}

fn context<'a>(identifier: &'a Identifier, lineage: &'a [Identifier]) -> ActionContext<'a> {
    ActionContext {
        identifier,
        arguments: &[],
        lineage,
        role: Role::Worker,
    }
}

/// Receive everything the runner sent, up to the closed end.
fn drain(channel: &ControlChannel) -> Vec<Vec<u8>> {
    let mut messages = Vec::new();
    loop {
        match channel.receive() {
            Ok(message) => messages.push(message),
            Err(AgentError::ChannelClosed) => return messages,
            Err(err) => panic!("unexpected channel error: {err}"),
        }
    }
}

#[test]
fn success_sends_exactly_one_ok() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = DiagnosticLog::new(dir.path().join("warmfork.log"));
    let (worker, coordinator) = ControlChannel::pair().expect("pair");
    let id = Identifier::new("boot").expect("id");
    let mut plan = ScriptedPlan::new(Scripted::Succeed);

    let outcome = ActionRunner::new(&log)
        .run(&mut plan, &worker, &context(&id, &[]))
        .expect("run");
    worker.close();

    assert_eq!(outcome, ActionOutcome::Succeeded);
    assert_eq!(plan.calls, vec!["boot"]);
    assert_eq!(drain(&coordinator), vec![b"R:OK".to_vec()]);
    assert!(!log.path().exists(), "success must not touch the log");
}

#[test]
fn failure_is_logged_and_reported_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = DiagnosticLog::new(dir.path().join("warmfork.log"));
    let (worker, coordinator) = ControlChannel::pair().expect("pair");
    let id = Identifier::new("boot").expect("id");
    let failure = ActionFailure::new("x:10", "boom", "RuntimeError").with_frames(vec!["y:3".into()]);
    let mut plan = ScriptedPlan::new(Scripted::Fail(failure.clone()));

    let outcome = ActionRunner::new(&log)
        .run(&mut plan, &worker, &context(&id, &[]))
        .expect("run");
    worker.close();

    assert_eq!(outcome, ActionOutcome::Failed(failure));

    let messages = drain(&coordinator);
    assert_eq!(messages.len(), 1);
    let text = String::from_utf8(messages[0].clone()).expect("utf8");
    assert!(text.starts_with("R:x:10: boom (RuntimeError)"));
    assert_eq!(text, "R:x:10: boom (RuntimeError)\n\tfrom y:3\n");

    let logged = std::fs::read_to_string(log.path()).expect("log");
    assert_eq!(logged, "R:x:10: boom (RuntimeError)\n\tfrom y:3\n");
}

#[test]
fn panic_becomes_a_failure_report() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = DiagnosticLog::new(dir.path().join("warmfork.log"));
    let (worker, coordinator) = ControlChannel::pair().expect("pair");
    let id = Identifier::new("boot").expect("id");
    let mut plan = ScriptedPlan::new(Scripted::Panic);

    let outcome = ActionRunner::new(&log)
        .run(&mut plan, &worker, &context(&id, &[]))
        .expect("run");
    worker.close();

    let ActionOutcome::Failed(failure) = outcome else {
        panic!("expected failure");
    };
    assert_eq!(failure.category, "Panic");
    assert_eq!(failure.message, "exploded in boot");

    let report = Report::parse(&drain(&coordinator)[0]).expect("report");
    assert_eq!(
        report,
        Report::Failed("action `boot`: exploded in boot (Panic)\n".into())
    );
}

#[test]
fn oversize_failure_is_truncated_on_the_wire_but_logged_whole() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = DiagnosticLog::new(dir.path().join("warmfork.log"));
    let (worker, coordinator) = ControlChannel::pair().expect("pair");
    let id = Identifier::new("boot").expect("id");
    let frames = (0..200).map(|i| format!("deep/frame/{i}.rs:{i}")).collect();
    let failure = ActionFailure::new("x:1", "boom", "RuntimeError").with_frames(frames);
    let full = failure.report();
    let mut plan = ScriptedPlan::new(Scripted::Fail(failure));

    ActionRunner::new(&log)
        .run(&mut plan, &worker, &context(&id, &[]))
        .expect("run");
    worker.close();

    let messages = drain(&coordinator);
    assert_eq!(messages.len(), 1);
    assert!(messages[0].len() <= MAX_MESSAGE_BYTES);

    let logged = std::fs::read_to_string(log.path()).expect("log");
    assert_eq!(logged, format!("R:{full}"));
}

#[test]
fn unwritable_log_does_not_block_the_report() {
    let dir = tempfile::tempdir().expect("tempdir");
    // A directory cannot be opened for append.
    let log = DiagnosticLog::new(dir.path());
    let (worker, coordinator) = ControlChannel::pair().expect("pair");
    let id = Identifier::new("boot").expect("id");
    let mut plan = ScriptedPlan::new(Scripted::Fail(ActionFailure::new("x", "y", "Z")));

    ActionRunner::new(&log)
        .run(&mut plan, &worker, &context(&id, &[]))
        .expect("run");
    worker.close();

    assert_eq!(drain(&coordinator), vec![b"R:x: y (Z)\n".to_vec()]);
}

#[test]
fn closed_channel_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = DiagnosticLog::new(dir.path().join("warmfork.log"));
    let (worker, coordinator) = ControlChannel::pair().expect("pair");
    coordinator.close();
    let id = Identifier::new("boot").expect("id");
    let mut plan = ScriptedPlan::new(Scripted::Succeed);

    let result = ActionRunner::new(&log).run(&mut plan, &worker, &context(&id, &[]));
    assert!(matches!(result, Err(AgentError::ChannelClosed)));
}

#[test]
fn guarded_invocation_sees_lineage() {
    struct LineagePlan(Vec<String>);

    impl Plan for LineagePlan {
        fn invoke(&mut self, context: &ActionContext<'_>) -> ActionResult {
            self.0 = context.lineage.iter().map(ToString::to_string).collect();
            Ok(())
        }
    }

    let id = Identifier::new("test").expect("id");
    let lineage = vec![
        Identifier::new("boot").expect("id"),
        Identifier::new("test").expect("id"),
    ];
    let mut plan = LineagePlan(Vec::new());

    assert!(invoke_guarded(&mut plan, &context(&id, &lineage)).is_success());
    assert_eq!(plan.0, vec!["boot", "test"]);
}
