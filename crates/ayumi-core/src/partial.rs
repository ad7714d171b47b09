//! Branches of a step and the callables they carry.
//!
//! Every callable slot is a small enum of a blocking and an async form. The
//! blocking controller runs async forms to completion with
//! [`futures::executor::block_on`]; the async controller calls blocking
//! forms inline.

use crate::error::StepError;
use crate::position::StateId;
use crate::signal::Signal;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Blocking predicate over instance data.
pub type SyncPredicate<D> = Arc<dyn Fn(&D) -> Result<bool, StepError> + Send + Sync>;
/// Async predicate over instance data.
pub type AsyncPredicate<D> =
    Arc<dyn for<'a> Fn(&'a D) -> BoxFuture<'a, Result<bool, StepError>> + Send + Sync>;
/// Blocking procedure over instance data.
pub type SyncProcedure<D> = Arc<dyn Fn(&mut D) -> Result<(), StepError> + Send + Sync>;
/// Async procedure over instance data.
pub type AsyncProcedure<D> =
    Arc<dyn for<'a> Fn(&'a mut D) -> BoxFuture<'a, Result<(), StepError>> + Send + Sync>;
/// Blocking recovery procedure, given the fault it handles.
pub type SyncRecovery<D> = Arc<dyn Fn(&mut D, &StepError) -> Result<(), StepError> + Send + Sync>;
/// Async recovery procedure, given the fault it handles.
pub type AsyncRecovery<D> = Arc<
    dyn for<'a> Fn(&'a mut D, &'a StepError) -> BoxFuture<'a, Result<(), StepError>> + Send + Sync,
>;
/// Blocking "should retry" decision.
pub type SyncRetry<D> = Arc<dyn Fn(&mut D, &StepError) -> bool + Send + Sync>;
/// Async "should retry" decision.
pub type AsyncRetry<D> =
    Arc<dyn for<'a> Fn(&'a mut D, &'a StepError) -> BoxFuture<'a, bool> + Send + Sync>;
/// Produces the signal a wait suspends on.
pub type SignalFn<D> = Arc<dyn Fn(&D) -> Signal + Send + Sync>;
/// Produces the timeout of a wait.
pub type TimeoutFn<D> = Arc<dyn Fn(&D) -> Duration + Send + Sync>;
/// Computes the target of a transition.
pub type TargetFn<D> = Arc<dyn Fn(&D) -> StateId + Send + Sync>;

/// Guard of a branch.
pub enum Condition<D> {
    /// Evaluated inline.
    Sync(SyncPredicate<D>),
    /// Evaluated by awaiting.
    Async(AsyncPredicate<D>),
}

impl<D> Condition<D> {
    /// Wraps a blocking predicate.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&D) -> Result<bool, StepError> + Send + Sync + 'static,
    {
        Condition::Sync(Arc::new(f))
    }

    /// Wraps an async predicate.
    pub fn from_async<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a D) -> BoxFuture<'a, Result<bool, StepError>> + Send + Sync + 'static,
    {
        Condition::Async(Arc::new(f))
    }

    /// Evaluates on the current thread.
    pub fn evaluate_blocking(&self, data: &D) -> Result<bool, StepError> {
        match self {
            Condition::Sync(f) => f(data),
            Condition::Async(f) => futures::executor::block_on(f(data)),
        }
    }

    /// Evaluates, awaiting the async form.
    pub async fn evaluate(&self, data: &D) -> Result<bool, StepError> {
        match self {
            Condition::Sync(f) => f(data),
            Condition::Async(f) => f(data).await,
        }
    }
}

/// Work done by a branch.
pub enum Action<D> {
    /// Invoked inline.
    Sync(SyncProcedure<D>),
    /// Invoked by awaiting.
    Async(AsyncProcedure<D>),
}

impl<D> Action<D> {
    /// Wraps a blocking procedure.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&mut D) -> Result<(), StepError> + Send + Sync + 'static,
    {
        Action::Sync(Arc::new(f))
    }

    /// Wraps an async procedure.
    pub fn from_async<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a mut D) -> BoxFuture<'a, Result<(), StepError>> + Send + Sync + 'static,
    {
        Action::Async(Arc::new(f))
    }

    /// Invokes on the current thread.
    pub fn invoke_blocking(&self, data: &mut D) -> Result<(), StepError> {
        match self {
            Action::Sync(f) => f(data),
            Action::Async(f) => futures::executor::block_on(f(data)),
        }
    }

    /// Invokes, awaiting the async form.
    pub async fn invoke(&self, data: &mut D) -> Result<(), StepError> {
        match self {
            Action::Sync(f) => f(data),
            Action::Async(f) => f(data).await,
        }
    }
}

/// Suspension directive.
///
/// Signal only: wait for it. Timeout only: sleep. Both: wait for the signal
/// for at most the timeout. Every form is also interrupted by the
/// instance's cancellation token.
pub struct WaitDirective<D> {
    pub(crate) signal: Option<SignalFn<D>>,
    pub(crate) timeout: Option<TimeoutFn<D>>,
}

impl<D> WaitDirective<D> {
    /// Signal to wait on, if any.
    pub fn signal(&self, data: &D) -> Option<Signal> {
        self.signal.as_ref().map(|f| f(data))
    }

    /// Timeout bounding the wait, if any.
    pub fn timeout(&self, data: &D) -> Option<Duration> {
        self.timeout.as_ref().map(|f| f(data))
    }
}

/// Where a transition goes.
pub enum Transition<D> {
    /// To the entry step of the computed state.
    Goto(TargetFn<D>),
    /// Terminates the machine.
    Finish,
}

/// The single effect of a resolved branch.
pub enum Effect<D> {
    /// Nothing. A resolved branch without effect is a dangling step.
    None,
    /// Run an action.
    Action(Action<D>),
    /// Suspend.
    Wait(WaitDirective<D>),
    /// Move to another state or finish.
    Transition(Transition<D>),
}

impl<D> Effect<D> {
    /// Short label used in logs and validation messages.
    pub fn as_label(&self) -> &'static str {
        match self {
            Effect::None => "none",
            Effect::Action(_) => "action",
            Effect::Wait(_) => "wait",
            Effect::Transition(Transition::Goto(_)) => "goto",
            Effect::Transition(Transition::Finish) => "finish",
        }
    }
}

/// One branch of a step's if / else-if / else chain.
pub struct PartialStep<D> {
    pub(crate) condition: Option<Condition<D>>,
    pub(crate) repeat_while: bool,
    pub(crate) effect: Effect<D>,
    pub(crate) otherwise: Option<Box<PartialStep<D>>>,
}

impl<D> PartialStep<D> {
    /// A branch with no condition and no effect.
    pub fn empty() -> Self {
        Self {
            condition: None,
            repeat_while: false,
            effect: Effect::None,
            otherwise: None,
        }
    }

    /// Guard of this branch; `None` means always taken.
    pub fn condition(&self) -> Option<&Condition<D>> {
        self.condition.as_ref()
    }

    /// `true` when the condition is a loop guard.
    pub fn is_loop(&self) -> bool {
        self.repeat_while && self.condition.is_some()
    }

    /// The effect run when this branch is taken.
    pub fn effect(&self) -> &Effect<D> {
        &self.effect
    }

    /// Next branch tried when the condition is false.
    pub fn otherwise(&self) -> Option<&PartialStep<D>> {
        self.otherwise.as_deref()
    }
}

impl<D> fmt::Debug for PartialStep<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartialStep")
            .field("conditional", &self.condition.is_some())
            .field("repeat_while", &self.repeat_while)
            .field("effect", &self.effect.as_label())
            .field("otherwise", &self.otherwise)
            .finish()
    }
}

/// Blocking or async recovery procedure.
pub enum Recovery<D> {
    /// Invoked inline.
    Sync(SyncRecovery<D>),
    /// Invoked by awaiting.
    Async(AsyncRecovery<D>),
}

impl<D> Recovery<D> {
    /// Wraps a blocking recovery procedure.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&mut D, &StepError) -> Result<(), StepError> + Send + Sync + 'static,
    {
        Recovery::Sync(Arc::new(f))
    }

    /// Wraps an async recovery procedure.
    pub fn from_async<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a mut D, &'a StepError) -> BoxFuture<'a, Result<(), StepError>>
            + Send
            + Sync
            + 'static,
    {
        Recovery::Async(Arc::new(f))
    }

    /// Invokes on the current thread.
    pub fn invoke_blocking(&self, data: &mut D, error: &StepError) -> Result<(), StepError> {
        match self {
            Recovery::Sync(f) => f(data, error),
            Recovery::Async(f) => futures::executor::block_on(f(data, error)),
        }
    }

    /// Invokes, awaiting the async form.
    pub async fn invoke(&self, data: &mut D, error: &StepError) -> Result<(), StepError> {
        match self {
            Recovery::Sync(f) => f(data, error),
            Recovery::Async(f) => f(data, error).await,
        }
    }
}

/// Blocking or async retry decision.
pub enum RetryDecision<D> {
    /// Evaluated inline.
    Sync(SyncRetry<D>),
    /// Evaluated by awaiting.
    Async(AsyncRetry<D>),
}

impl<D> RetryDecision<D> {
    /// Wraps a blocking decision.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&mut D, &StepError) -> bool + Send + Sync + 'static,
    {
        RetryDecision::Sync(Arc::new(f))
    }

    /// Wraps an async decision.
    pub fn from_async<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a mut D, &'a StepError) -> BoxFuture<'a, bool> + Send + Sync + 'static,
    {
        RetryDecision::Async(Arc::new(f))
    }

    /// Decides on the current thread.
    pub fn decide_blocking(&self, data: &mut D, error: &StepError) -> bool {
        match self {
            RetryDecision::Sync(f) => f(data, error),
            RetryDecision::Async(f) => futures::executor::block_on(f(data, error)),
        }
    }

    /// Decides, awaiting the async form.
    pub async fn decide(&self, data: &mut D, error: &StepError) -> bool {
        match self {
            RetryDecision::Sync(f) => f(data, error),
            RetryDecision::Async(f) => f(data, error).await,
        }
    }
}

/// Per-step fault policy. A step carries at most one.
pub enum CatchPolicy<D> {
    /// Run a recovery procedure, then advance to the next step.
    Recover(Recovery<D>),
    /// Jump to the entry step of a state.
    Goto(StateId),
    /// Re-run the same step when the decision is `true`, else advance.
    Retry(RetryDecision<D>),
}

impl<D> CatchPolicy<D> {
    /// Short label used in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            CatchPolicy::Recover(_) => "recover",
            CatchPolicy::Goto(_) => "goto",
            CatchPolicy::Retry(_) => "retry",
        }
    }
}

impl<D> fmt::Debug for CatchPolicy<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatchPolicy::Goto(state) => write!(f, "CatchPolicy::Goto({state})"),
            other => write!(f, "CatchPolicy::{}", other.as_label()),
        }
    }
}
