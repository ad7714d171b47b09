//! Step execution controller.
//!
//! Executes exactly one step of an instance and commits the next position.
//! [`execute_step`] runs on the calling thread; [`execute_step_async`] is
//! the same algorithm for async callers. Both return `Ok(true)` while the
//! instance should keep being driven.
//!
//! One step:
//! 1. Walk the branch chain until a condition holds. No branch means advance.
//! 2. Run the branch effect: an action, a wait (the lock is released around
//!    it), or a transition. A branch without effect is a dangling step.
//! 3. A loop branch whose effect completed stays on the same step.
//! 4. Faults go to the step's catch policy, else the definition's
//!    unhandled-fault handler.
//! 5. Commit the position, then apply a pending pause.

mod blocking;
mod nonblocking;

pub use blocking::execute_step;
pub use nonblocking::execute_step_async;

use ayumi_core::{
    CatchPolicy, Definition, Disposition, EventKind, ExecutionContext, Fault, PartialStep, Phase,
    Position, StateId, Step, StepError, WorkflowError,
};
use tracing::{debug, info, warn};

/// What the step decided about the next position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    /// Move to the next step of the same state.
    Advance,
    /// Run the same step again.
    Stay,
    /// Move to the entry step of a state.
    Jump(StateId),
    /// Finish the machine.
    Finish,
    /// The step was interrupted; stay without side effects.
    Cancelled,
}

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    Signalled,
    TimedOut,
    Cancelled,
}

impl WaitOutcome {
    fn as_label(self) -> &'static str {
        match self {
            WaitOutcome::Signalled => "signalled",
            WaitOutcome::TimedOut => "timed_out",
            WaitOutcome::Cancelled => "cancelled",
        }
    }
}

/// Checks that the instance may run a step and switches it to `Running`.
///
/// Returns the position to execute, or `None` when the instance must not be
/// driven. A position without a step marks the instance invalid.
pub(crate) fn enter<C: ExecutionContext>(ctx: &C) -> Option<Position> {
    let phase = ctx.phase();
    if !phase.is_resumable() {
        debug!(machine = ctx.name(), %phase, "step skipped");
        return None;
    }
    if phase != Phase::Running {
        ctx.set_phase(Phase::Running);
    }

    let position = ctx.position();
    if ctx.definition().step(position).is_none() {
        let reason = ctx.definition().describe(position);
        mark_invalid(ctx, reason);
        return None;
    }
    Some(position)
}

pub(crate) fn mark_invalid<C: ExecutionContext>(ctx: &C, reason: String) {
    warn!("Machine '{}' is invalid: {}", ctx.name(), reason);
    ctx.set_phase(Phase::Invalid);
    ctx.emit_event(EventKind::WorkflowInvalid, Some(reason));
}

/// Loop branches stay on the step once their effect has completed.
pub(crate) fn repeat_or_advance<D>(branch: &PartialStep<D>) -> Flow {
    if branch.is_loop() {
        Flow::Stay
    } else {
        Flow::Advance
    }
}

pub(crate) fn dangling<C: ExecutionContext>(ctx: &C, step: &Step<C::Data>) -> Flow {
    warn!(
        "Machine '{}' resolved a branch without effect in step {} ({})",
        ctx.name(),
        step.index(),
        step.description()
    );
    ctx.emit_event(EventKind::DanglingStep, Some(step.description().to_string()));
    Flow::Advance
}

pub(crate) fn transition<C: ExecutionContext>(
    ctx: &C,
    definition: &Definition<C::Data>,
    target: StateId,
) -> Flow {
    if target != ctx.position().state {
        let name = definition
            .state(target)
            .map(|s| s.name().to_string())
            .unwrap_or_else(|| target.to_string());
        info!("Machine '{}' moves to state '{}'", ctx.name(), name);
        ctx.emit_event(EventKind::StateTransition, Some(name));
    }
    Flow::Jump(target)
}

/// An open wait. Dropping it before [`end_wait`] (the step future was
/// dropped mid-wait) puts a `Waiting` instance back to `Running` so it can be
/// driven again from the same position.
pub(crate) struct WaitScope<'a, C: ExecutionContext> {
    ctx: &'a C,
}

impl<C: ExecutionContext> Drop for WaitScope<'_, C> {
    fn drop(&mut self) {
        if self.ctx.phase() == Phase::Waiting {
            debug!(machine = self.ctx.name(), "wait abandoned");
            self.ctx.set_phase(Phase::Running);
        }
    }
}

pub(crate) fn begin_wait<C: ExecutionContext>(ctx: &C) -> WaitScope<'_, C> {
    ctx.set_phase(Phase::Waiting);
    debug!(machine = ctx.name(), position = %ctx.position(), "wait started");
    ctx.emit_event(EventKind::BeginWaiting, None);
    WaitScope { ctx }
}

/// Called with the lock re-acquired.
pub(crate) fn end_wait<D, C: ExecutionContext<Data = D>>(
    scope: WaitScope<'_, C>,
    branch: &PartialStep<D>,
    outcome: WaitOutcome,
) -> Flow {
    let ctx = scope.ctx;
    ctx.set_phase(Phase::Running);
    debug!(machine = ctx.name(), outcome = outcome.as_label(), "wait ended");
    ctx.emit_event(EventKind::EndWaiting, Some(outcome.as_label().to_string()));
    match outcome {
        WaitOutcome::Cancelled => {
            ctx.reset_cancellation();
            Flow::Cancelled
        }
        WaitOutcome::Signalled | WaitOutcome::TimedOut => repeat_or_advance(branch),
    }
}

/// Emits the single exception event of a caught fault.
pub(crate) fn caught<C: ExecutionContext>(
    ctx: &C,
    policy: &CatchPolicy<C::Data>,
    error: &StepError,
) {
    let kind = match policy {
        CatchPolicy::Recover(_) => EventKind::ExceptionCaughtWithAction,
        CatchPolicy::Goto(_) => EventKind::ExceptionCaughtWithTransition,
        CatchPolicy::Retry(_) => EventKind::ExceptionCaughtWithRetry,
    };
    warn!(
        "Machine '{}' caught fault at {} ({}): {}",
        ctx.name(),
        ctx.position(),
        policy.as_label(),
        error
    );
    ctx.emit_event(kind, Some(error.to_string()));
}

pub(crate) fn fatal<C: ExecutionContext>(
    ctx: &C,
    position: Position,
    error: StepError,
) -> WorkflowError {
    mark_invalid(ctx, error.to_string());
    WorkflowError::Unhandled {
        machine: ctx.name().to_string(),
        position,
        source: error,
    }
}

/// Fault without a catch policy: ask the definition's handler.
pub(crate) fn not_caught<C: ExecutionContext>(
    ctx: &C,
    definition: &Definition<C::Data>,
    data: &mut C::Data,
    position: Position,
    error: StepError,
) -> Result<Flow, WorkflowError> {
    warn!(
        "Machine '{}' fault not caught at {}: {}",
        ctx.name(),
        position,
        error
    );
    ctx.emit_event(EventKind::ExceptionNotCaught, Some(error.to_string()));

    let fault = Fault {
        machine: ctx.name(),
        position,
        error: &error,
    };
    let disposition = definition
        .unhandled_handler()
        .map_or(Disposition::Abort, |handler| handler(data, &fault));

    match disposition {
        Disposition::Continue => Ok(Flow::Advance),
        Disposition::Abort => Err(fatal(ctx, position, error)),
    }
}

/// Commits the flow and applies a pending pause, discarding the cancellation
/// token with it. Returns `true` while the instance is still running.
pub(crate) fn finalize<C: ExecutionContext>(ctx: &C, position: Position, flow: Flow) -> bool {
    match flow {
        Flow::Advance => ctx.set_position(position.next_step()),
        Flow::Jump(state) => ctx.set_position(Position::entry(state)),
        Flow::Stay | Flow::Cancelled => {}
        Flow::Finish => {
            ctx.set_phase(Phase::Finished);
            info!("Machine '{}' finished", ctx.name());
            ctx.emit_event(EventKind::WorkflowFinished, None);
        }
    }

    if ctx.take_pause_request() && ctx.phase() == Phase::Running {
        ctx.set_phase(Phase::Paused);
        info!("Machine '{}' paused at {}", ctx.name(), ctx.position());
        ctx.emit_event(EventKind::WorkflowPaused, None);
    }

    ctx.phase() == Phase::Running
}
