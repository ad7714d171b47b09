use super::{
    begin_wait, caught, dangling, end_wait, enter, fatal, finalize, not_caught, repeat_or_advance,
    transition, Flow, WaitOutcome,
};
use ayumi_core::{
    CatchPolicy, Definition, Effect, ExecutionContext, PartialStep, Position, Signal, Step,
    StepError, Transition, WorkflowError,
};
use futures::future;
use std::sync::Arc;
use std::time::Duration;

/// Executes the current step of `ctx`, awaiting async callables and waits.
///
/// Same semantics as [`execute_step`](crate::execute_step). Blocking
/// callables run inline on the polling task.
pub async fn execute_step_async<C: ExecutionContext>(ctx: &C) -> Result<bool, WorkflowError> {
    let Some(position) = enter(ctx) else {
        return Ok(false);
    };
    let definition = Arc::clone(ctx.definition());
    let Some(step) = definition.step(position) else {
        return Ok(false);
    };

    let mut guard = ctx.lock().await;
    let flow = match resolve(step.head(), &*guard).await {
        Ok(None) => Flow::Advance,
        Ok(Some(branch)) => match branch.effect() {
            Effect::None if branch.is_loop() => Flow::Stay,
            Effect::None => dangling(ctx, step),
            Effect::Action(action) => match action.invoke(&mut *guard).await {
                Ok(()) => repeat_or_advance(branch),
                Err(error) => {
                    handle_fault(ctx, &definition, step, position, &mut *guard, error).await?
                }
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
                let outcome = wait(ctx, signal, timeout).await;
                guard = ctx.lock().await;
                end_wait(scope, branch, outcome)
            }
        },
        Err(error) => handle_fault(ctx, &definition, step, position, &mut *guard, error).await?,
    };
    drop(guard);

    Ok(finalize(ctx, position, flow))
}

async fn resolve<'s, D>(
    head: &'s PartialStep<D>,
    data: &D,
) -> Result<Option<&'s PartialStep<D>>, StepError> {
    let mut branch = head;
    loop {
        let taken = match branch.condition() {
            None => true,
            Some(condition) => condition.evaluate(data).await?,
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

async fn wait<C: ExecutionContext>(
    ctx: &C,
    signal: Option<Signal>,
    timeout: Option<Duration>,
) -> WaitOutcome {
    let cancel = ctx.cancellation();
    let signalled = async {
        match &signal {
            Some(signal) => signal.wait().await,
            None => future::pending::<()>().await,
        }
    };
    let expired = async {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        () = signalled => WaitOutcome::Signalled,
        () = cancel.cancelled() => WaitOutcome::Cancelled,
        () = expired => WaitOutcome::TimedOut,
    }
}

async fn handle_fault<C: ExecutionContext>(
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
        CatchPolicy::Recover(recovery) => match recovery.invoke(data, &error).await {
            Ok(()) => Ok(Flow::Advance),
            Err(failed) => Err(fatal(ctx, position, failed)),
        },
        CatchPolicy::Goto(target) => Ok(transition(ctx, definition, *target)),
        CatchPolicy::Retry(decision) => {
            if decision.decide(data, &error).await {
                Ok(Flow::Stay)
            } else {
                Ok(Flow::Advance)
            }
        }
    }
}
