//! Builders for [`Definition`].
//!
//! States are declared first so steps can reference states declared later:
//!
//! ```
//! use ayumi_core::{Definition, Phase};
//!
//! #[derive(Default)]
//! struct Door {
//!     knocks: u32,
//! }
//!
//! let mut builder = Definition::<Door>::builder("door");
//! let closed = builder.state("closed");
//! let open = builder.state("open");
//!
//! builder
//!     .step(closed, "knock", |s| {
//!         s.when(|d: &Door| d.knocks >= 3)
//!             .goto(open)
//!             .otherwise()
//!             .act(|d: &mut Door| {
//!                 d.knocks += 1;
//!                 Ok(())
//!             })
//!     })
//!     .step(closed, "loop", |s| s.goto(closed))
//!     .step(open, "done", |s| s.finish());
//!
//! let definition = builder.build().expect("valid definition");
//! assert_eq!(definition.states().len(), 2);
//! assert_eq!(definition.state(open).map(|s| s.name()), Some("open"));
//! # let _ = Phase::Prepared;
//! ```

use crate::definition::{Definition, Disposition, Fault, State, Step, UnhandledHandler};
use crate::error::{StepError, WorkflowError};
use crate::partial::{
    Action, CatchPolicy, Condition, Effect, PartialStep, Recovery, RetryDecision, Transition,
    WaitDirective,
};
use crate::position::{Position, StateId};
use crate::signal::Signal;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

struct StateDraft<D> {
    name: String,
    steps: Vec<Step<D>>,
}

/// Builder for [`Definition`].
pub struct DefinitionBuilder<D> {
    name: String,
    states: Vec<StateDraft<D>>,
    initial: Option<StateId>,
    on_unhandled: Option<UnhandledHandler<D>>,
    targets: Vec<StateId>,
    errors: Vec<String>,
}

impl<D: 'static> DefinitionBuilder<D> {
    /// Creates an empty builder.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            states: Vec::new(),
            initial: None,
            on_unhandled: None,
            targets: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Declares a state and returns its id.
    pub fn state(&mut self, name: impl Into<String>) -> StateId {
        let id = StateId::new(self.states.len());
        self.states.push(StateDraft {
            name: name.into(),
            steps: Vec::new(),
        });
        id
    }

    /// Appends a step to `state`.
    pub fn step<F>(&mut self, state: StateId, description: impl Into<String>, build: F) -> &mut Self
    where
        F: FnOnce(StepBuilder<D>) -> StepBuilder<D>,
    {
        let description = description.into();
        let Some(draft) = self.states.get_mut(state.index()) else {
            self.errors
                .push(format!("step '{description}' added to undeclared state {state}"));
            return self;
        };

        let index = draft.steps.len();
        let built = build(StepBuilder::new());
        self.targets.extend(built.targets.iter().copied());
        self.errors.extend(
            built
                .errors
                .iter()
                .map(|e| format!("state '{}' step {index} ({description}): {e}", draft.name)),
        );
        draft.steps.push(built.into_step(index, description));
        self
    }

    /// Sets the state new instances start in. Defaults to the first state.
    pub fn initial(&mut self, state: StateId) -> &mut Self {
        self.initial = Some(state);
        self
    }

    /// Sets the handler for faults raised by steps without a catch policy.
    ///
    /// Without one, such faults abort the instance.
    pub fn on_unhandled<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&mut D, &Fault<'_>) -> Disposition + Send + Sync + 'static,
    {
        self.on_unhandled = Some(Arc::new(handler));
        self
    }

    /// Validates and freezes the definition.
    pub fn build(self) -> Result<Arc<Definition<D>>, WorkflowError> {
        if let Some(first) = self.errors.into_iter().next() {
            return Err(WorkflowError::Configuration(first));
        }
        if self.states.is_empty() {
            return Err(WorkflowError::Configuration(format!(
                "definition '{}' has no states",
                self.name
            )));
        }
        if let Some(empty) = self.states.iter().find(|draft| draft.steps.is_empty()) {
            return Err(WorkflowError::Configuration(format!(
                "state '{}' has no steps",
                empty.name
            )));
        }

        let state_count = self.states.len();
        let initial = self.initial.unwrap_or(StateId::new(0));
        if let Some(unknown) = std::iter::once(initial)
            .chain(self.targets)
            .find(|id| id.index() >= state_count)
        {
            return Err(WorkflowError::UnknownState(unknown));
        }

        let states = self
            .states
            .into_iter()
            .enumerate()
            .map(|(index, draft)| State {
                id: StateId::new(index),
                name: draft.name,
                steps: draft.steps,
            })
            .collect();

        Ok(Arc::new(Definition {
            name: self.name,
            states,
            initial: Position::entry(initial),
            on_unhandled: self.on_unhandled,
        }))
    }
}

struct Branch<D> {
    condition: Option<Condition<D>>,
    repeat_while: bool,
    effect: Effect<D>,
}

/// Builder for one step's branch chain and catch policy.
///
/// `when`, `try_when`, `when_async` and `repeat_while` open a conditional
/// branch, `otherwise` opens the final unconditional one, and every effect
/// method sets the effect of the most recently opened branch (opening an
/// unconditional branch if none is open yet).
pub struct StepBuilder<D> {
    branches: Vec<Branch<D>>,
    catch: Option<CatchPolicy<D>>,
    targets: Vec<StateId>,
    errors: Vec<String>,
}

impl<D: 'static> StepBuilder<D> {
    fn new() -> Self {
        Self {
            branches: Vec::new(),
            catch: None,
            targets: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn open(mut self, condition: Option<Condition<D>>, repeat_while: bool) -> Self {
        if self.branches.last().is_some_and(|b| b.condition.is_none()) {
            self.errors
                .push("branch added after an unconditional branch".to_string());
        }
        self.branches.push(Branch {
            condition,
            repeat_while,
            effect: Effect::None,
        });
        self
    }

    fn effect(mut self, effect: Effect<D>) -> Self {
        if self.branches.is_empty() {
            self.branches.push(Branch {
                condition: None,
                repeat_while: false,
                effect: Effect::None,
            });
        }
        if let Some(branch) = self.branches.last_mut() {
            if matches!(branch.effect, Effect::None) {
                branch.effect = effect;
            } else {
                self.errors.push(format!(
                    "branch already has a {} effect, cannot add {}",
                    branch.effect.as_label(),
                    effect.as_label()
                ));
            }
        }
        self
    }

    fn catch(mut self, policy: CatchPolicy<D>) -> Self {
        match &self.catch {
            Some(existing) => self.errors.push(format!(
                "step already has a {} catch policy, cannot add {}",
                existing.as_label(),
                policy.as_label()
            )),
            None => self.catch = Some(policy),
        }
        self
    }

    /// Opens a branch taken when `f` returns `true`.
    pub fn when<F>(self, f: F) -> Self
    where
        F: Fn(&D) -> bool + Send + Sync + 'static,
    {
        self.open(Some(Condition::from_fn(move |d: &D| Ok(f(d)))), false)
    }

    /// Opens a branch guarded by a fallible predicate.
    pub fn try_when<F>(self, f: F) -> Self
    where
        F: Fn(&D) -> Result<bool, StepError> + Send + Sync + 'static,
    {
        self.open(Some(Condition::from_fn(f)), false)
    }

    /// Opens a branch guarded by an async predicate.
    pub fn when_async<F>(self, f: F) -> Self
    where
        F: for<'a> Fn(&'a D) -> BoxFuture<'a, Result<bool, StepError>> + Send + Sync + 'static,
    {
        self.open(Some(Condition::from_async(f)), false)
    }

    /// Opens a loop branch: while `f` holds the step runs again after its
    /// effect instead of advancing.
    pub fn repeat_while<F>(self, f: F) -> Self
    where
        F: Fn(&D) -> bool + Send + Sync + 'static,
    {
        self.open(Some(Condition::from_fn(move |d: &D| Ok(f(d)))), true)
    }

    /// Opens the final unconditional branch.
    pub fn otherwise(mut self) -> Self {
        if self.branches.is_empty() {
            self.errors
                .push("otherwise() without a preceding condition".to_string());
        }
        self.open(None, false)
    }

    /// Runs a blocking action.
    pub fn act<F>(self, f: F) -> Self
    where
        F: Fn(&mut D) -> Result<(), StepError> + Send + Sync + 'static,
    {
        self.effect(Effect::Action(Action::from_fn(f)))
    }

    /// Runs an async action.
    pub fn act_async<F>(self, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut D) -> BoxFuture<'a, Result<(), StepError>> + Send + Sync + 'static,
    {
        self.effect(Effect::Action(Action::from_async(f)))
    }

    /// Waits for the signal produced by `signal`.
    pub fn wait_for<F>(self, signal: F) -> Self
    where
        F: Fn(&D) -> Signal + Send + Sync + 'static,
    {
        self.effect(Effect::Wait(WaitDirective {
            signal: Some(Arc::new(signal)),
            timeout: None,
        }))
    }

    /// Waits for the signal produced by `signal` for at most `timeout`.
    pub fn wait_for_within<F, T>(self, signal: F, timeout: T) -> Self
    where
        F: Fn(&D) -> Signal + Send + Sync + 'static,
        T: Fn(&D) -> Duration + Send + Sync + 'static,
    {
        self.effect(Effect::Wait(WaitDirective {
            signal: Some(Arc::new(signal)),
            timeout: Some(Arc::new(timeout)),
        }))
    }

    /// Sleeps for the duration produced by `timeout`.
    pub fn sleep<T>(self, timeout: T) -> Self
    where
        T: Fn(&D) -> Duration + Send + Sync + 'static,
    {
        self.effect(Effect::Wait(WaitDirective {
            signal: None,
            timeout: Some(Arc::new(timeout)),
        }))
    }

    /// Moves to the entry step of `state`.
    pub fn goto(mut self, state: StateId) -> Self {
        self.targets.push(state);
        self.effect(Effect::Transition(Transition::Goto(Arc::new(move |_: &D| {
            state
        }))))
    }

    /// Moves to the entry step of the state computed by `f`.
    pub fn goto_with<F>(self, f: F) -> Self
    where
        F: Fn(&D) -> StateId + Send + Sync + 'static,
    {
        self.effect(Effect::Transition(Transition::Goto(Arc::new(f))))
    }

    /// Finishes the machine.
    pub fn finish(self) -> Self {
        self.effect(Effect::Transition(Transition::Finish))
    }

    /// On fault, runs `f` and advances to the next step.
    pub fn on_error_recover<F>(self, f: F) -> Self
    where
        F: Fn(&mut D, &StepError) -> Result<(), StepError> + Send + Sync + 'static,
    {
        self.catch(CatchPolicy::Recover(Recovery::from_fn(f)))
    }

    /// On fault, awaits `f` and advances to the next step.
    pub fn on_error_recover_async<F>(self, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut D, &'a StepError) -> BoxFuture<'a, Result<(), StepError>>
            + Send
            + Sync
            + 'static,
    {
        self.catch(CatchPolicy::Recover(Recovery::from_async(f)))
    }

    /// On fault, jumps to the entry step of `state`.
    pub fn on_error_goto(mut self, state: StateId) -> Self {
        self.targets.push(state);
        self.catch(CatchPolicy::Goto(state))
    }

    /// On fault, re-runs the step while `f` returns `true`.
    pub fn on_error_retry<F>(self, f: F) -> Self
    where
        F: Fn(&mut D, &StepError) -> bool + Send + Sync + 'static,
    {
        self.catch(CatchPolicy::Retry(RetryDecision::from_fn(f)))
    }

    /// On fault, re-runs the step while the async `f` resolves to `true`.
    pub fn on_error_retry_async<F>(self, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut D, &'a StepError) -> BoxFuture<'a, bool> + Send + Sync + 'static,
    {
        self.catch(CatchPolicy::Retry(RetryDecision::from_async(f)))
    }

    fn into_step(self, index: usize, description: String) -> Step<D> {
        let head = self
            .branches
            .into_iter()
            .rev()
            .fold(None, |otherwise: Option<PartialStep<D>>, branch| {
                Some(PartialStep {
                    condition: branch.condition,
                    repeat_while: branch.repeat_while,
                    effect: branch.effect,
                    otherwise: otherwise.map(Box::new),
                })
            })
            .unwrap_or_else(PartialStep::empty);

        Step {
            index,
            description,
            catch: self.catch,
            head,
        }
    }
}
