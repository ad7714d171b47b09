use super::{
    begin_wait, caught, dangling, end_wait, enter, fatal, finalize, not_caught, repeat_or_advance,
    transition, Flow, WaitOutcome,
};
use ayumi_core::{
    CancellationToken, CatchPolicy, Definition, Effect, ExecutionContext, PartialStep, Position,
    Signal, Step, StepError, Transition, WorkflowError,
};
use futures::executor::block_on;
use futures::future::{self, Either};
use futures::pin_mut;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Executes the current step of `ctx` on the calling thread.
///
/// Async callables are run to completion with
/// [`futures::executor::block_on`]. Waits block the thread. Must not be
/// called from inside an async context; use
/// [`execute_step_async`](crate::execute_step_async) there.
///
/// Returns `Ok(true)` while the instance is still running after the step,
/// `Ok(false)` once it finished, paused, became invalid or was not
/// runnable, and `Err` for a fault nobody handled.
pub fn execute_step<C: ExecutionContext>(ctx: &C) -> Result<bool, WorkflowError> {
    let Some(position) = enter(ctx) else {
        return Ok(false);
    };
    let definition = Arc::clone(ctx.definition());
    let Some(step) = definition.step(position) else {
        return Ok(false);
    };

    let mut guard = ctx.lock_blocking();
    let flow = match resolve(step.head(), &*guard) {
        Ok(None) => Flow::Advance,
        Ok(Some(branch)) => match branch.effect() {
            Effect::None if branch.is_loop() => Flow::Stay,
            Effect::None => dangling(ctx, step),
            Effect::Action(action) => match action.invoke_blocking(&mut *guard) {
                Ok(()) => repeat_or_advance(branch),
                Err(error) => handle_fault(ctx, &definition, step, position, &mut *guard, error)?,
            },
            Effect::Transition(Transition::Goto(target)) => {
                let target = target(&*guard);
                transition(ctx, &definition, target)
            }
            Effect::Transition(Transition::Finish) => Flow::Finish,
            Effect::Wait(directive) => {
                let signal = directive.signal(&*guard);
                let timeout = directive.timeout(&*guard);
                drop(guard);

                let scope = begin_wait(ctx);
                let outcome = wait(ctx, signal, timeout);
                guard = ctx.lock_blocking();
                end_wait(scope, branch, outcome)
            }
        },
        Err(error) => handle_fault(ctx, &definition, step, position, &mut *guard, error)?,
    };
    drop(guard);

    Ok(finalize(ctx, position, flow))
}

fn resolve<'s, D>(
    head: &'s PartialStep<D>,
    data: &D,
) -> Result<Option<&'s PartialStep<D>>, StepError> {
    let mut branch = head;
    loop {
        let taken = match branch.condition() {
            None => true,
            Some(condition) => condition.evaluate_blocking(data)?,
        };
        if taken {
            return Ok(Some(branch));
        }
        match branch.otherwise() {
            Some(next) => branch = next,
            None => return Ok(None),
        }
    }
}

/// How often a bounded blocking wait checks the cancellation token.
const CANCEL_POLL: Duration = Duration::from_millis(5);

fn wait<C: ExecutionContext>(
    ctx: &C,
    signal: Option<Signal>,
    timeout: Option<Duration>,
) -> WaitOutcome {
    let cancel = ctx.cancellation();
    let Some(deadline) = timeout.and_then(|t| Instant::now().checked_add(t)) else {
        return wait_unbounded(signal.as_ref(), &cancel);
    };

    loop {
        if signal.as_ref().is_some_and(Signal::is_set) {
            return WaitOutcome::Signalled;
        }
        if cancel.is_cancelled() {
            return WaitOutcome::Cancelled;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return WaitOutcome::TimedOut;
        }
        let slice = remaining.min(CANCEL_POLL);
        match &signal {
            Some(signal) => {
                signal.wait_timeout(Some(slice));
            }
            None => std::thread::sleep(slice),
        }
    }
}

fn wait_unbounded(signal: Option<&Signal>, cancel: &CancellationToken) -> WaitOutcome {
    let Some(signal) = signal else {
        block_on(cancel.cancelled());
        return WaitOutcome::Cancelled;
    };
    let signalled = signal.wait();
    let cancelled = cancel.cancelled();
    pin_mut!(signalled, cancelled);
    match block_on(future::select(signalled, cancelled)) {
        Either::Left(_) => WaitOutcome::Signalled,
        Either::Right(_) => WaitOutcome::Cancelled,
    }
}

fn handle_fault<C: ExecutionContext>(
    ctx: &C,
    definition: &Definition<C::Data>,
    step: &Step<C::Data>,
    position: Position,
    data: &mut C::Data,
    error: StepError,
) -> Result<Flow, WorkflowError> {
    if error.is_cancelled() {
        return Ok(Flow::Cancelled);
    }

    let Some(policy) = step.catch() else {
        return not_caught(ctx, definition, data, position, error);
    };
    caught(ctx, policy, &error);

    match policy {
        CatchPolicy::Recover(recovery) => match recovery.invoke_blocking(data, &error) {
            Ok(()) => Ok(Flow::Advance),
            Err(failed) => Err(fatal(ctx, position, failed)),
        },
        CatchPolicy::Goto(target) => Ok(transition(ctx, definition, *target)),
        CatchPolicy::Retry(decision) => {
            if decision.decide_blocking(data, &error) {
                Ok(Flow::Stay)
            } else {
                Ok(Flow::Advance)
            }
        }
    }
}
