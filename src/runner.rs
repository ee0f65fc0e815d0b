//! Runs one plan action and reports its outcome over a control channel.

use std::panic::{self, AssertUnwindSafe};

use tracing::{info, info_span, warn};

use crate::channel::ControlChannel;
use crate::diagnostics::DiagnosticLog;
use crate::plan::{ActionContext, ActionFailure, ActionOutcome, Plan};
use crate::protocol::Report;
use crate::Result;

/// Invokes plan actions and reports `R:OK` or an `R:` failure report.
#[derive(Debug, Clone, Copy)]
pub struct ActionRunner<'a> {
    log: &'a DiagnosticLog,
}

impl<'a> ActionRunner<'a> {
    /// Runner appending failure reports to `log`.
    #[must_use]
    pub fn new(log: &'a DiagnosticLog) -> Self {
        Self { log }
    }

    /// Invoke the action and write exactly one report to `channel`.
    ///
    /// Failures are appended to the diagnostic log before the report is
    /// sent. A log write failure is logged and does not stop the report.
    ///
    /// # Errors
    ///
    /// Returns the channel error if the report cannot be sent; the caller
    /// cannot keep serving without its control line.
    pub fn run<P: Plan + ?Sized>(
        &self,
        plan: &mut P,
        channel: &ControlChannel,
        context: &ActionContext<'_>,
    ) -> Result<ActionOutcome> {
        let span = info_span!("run_action", identifier = %context.identifier, role = %context.role);
        let _guard = span.enter();

        let outcome = invoke_guarded(plan, context);
        match &outcome {
            ActionOutcome::Succeeded => {
                channel.send(&Report::Ok.encode())?;
                info!("action succeeded");
            }
            ActionOutcome::Failed(failure) => {
                let report = failure.report();
                warn!(
                    location = %failure.location,
                    category = %failure.category,
                    message = %failure.message,
                    "action failed"
                );
                if let Err(err) = self.log.append(&format!("R:{report}")) {
                    warn!(%err, "failed to record failure in diagnostic log");
                }
                channel.send(&Report::Failed(report).encode())?;
            }
        }

        Ok(outcome)
    }
}

/// Invoke the action, converting a panic into an [`ActionFailure`].
#[must_use]
pub fn invoke_guarded<P: Plan + ?Sized>(plan: &mut P, context: &ActionContext<'_>) -> ActionOutcome {
    match panic::catch_unwind(AssertUnwindSafe(|| plan.invoke(context))) {
        Ok(Ok(())) => ActionOutcome::Succeeded,
        Ok(Err(failure)) => ActionOutcome::Failed(failure),
        Err(payload) => ActionOutcome::Failed(ActionFailure::from_panic(
            context.identifier,
            payload.as_ref(),
        )),
    }
}
