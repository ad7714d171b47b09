//! The frozen state graph of one machine type.

use crate::builder::DefinitionBuilder;
use crate::error::StepError;
use crate::partial::{CatchPolicy, PartialStep};
use crate::position::{Position, StateId};
use std::fmt;
use std::sync::Arc;

/// What the unhandled-fault handler decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Treat the fault as handled and advance to the next step.
    Continue,
    /// Mark the instance invalid and stop driving it.
    Abort,
}

/// A fault that reached the definition's unhandled-fault handler.
#[derive(Debug)]
pub struct Fault<'a> {
    /// Name of the failing instance.
    pub machine: &'a str,
    /// Position of the failing step.
    pub position: Position,
    /// The fault.
    pub error: &'a StepError,
}

/// Handler for faults raised by steps without a catch policy.
///
/// Lives on the frozen definition and is shared by every instance; it only
/// sees the failing instance's data.
pub type UnhandledHandler<D> = Arc<dyn Fn(&mut D, &Fault<'_>) -> Disposition + Send + Sync>;

/// One step of a state.
pub struct Step<D> {
    pub(crate) index: usize,
    pub(crate) description: String,
    pub(crate) catch: Option<CatchPolicy<D>>,
    pub(crate) head: PartialStep<D>,
}

impl<D> Step<D> {
    /// Index inside the owning state.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Human-readable description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Fault policy, if any.
    pub fn catch(&self) -> Option<&CatchPolicy<D>> {
        self.catch.as_ref()
    }

    /// First branch of the condition chain.
    pub fn head(&self) -> &PartialStep<D> {
        &self.head
    }
}

impl<D> fmt::Debug for Step<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("index", &self.index)
            .field("description", &self.description)
            .field("catch", &self.catch)
            .field("head", &self.head)
            .finish()
    }
}

/// A named, ordered list of steps.
pub struct State<D> {
    pub(crate) id: StateId,
    pub(crate) name: String,
    pub(crate) steps: Vec<Step<D>>,
}

impl<D> State<D> {
    /// Stable id of this state.
    pub fn id(&self) -> StateId {
        self.id
    }

    /// Name of this state.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Steps in execution order.
    pub fn steps(&self) -> &[Step<D>] {
        &self.steps
    }
}

impl<D> fmt::Debug for State<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("steps", &self.steps.len())
            .finish()
    }
}

/// Immutable description of one machine type.
///
/// Built once with [`Definition::builder`] and shared behind an [`Arc`] by
/// every instance of the machine. `D` is the per-instance data the
/// callables operate on.
pub struct Definition<D> {
    pub(crate) name: String,
    pub(crate) states: Vec<State<D>>,
    pub(crate) initial: Position,
    pub(crate) on_unhandled: Option<UnhandledHandler<D>>,
}

impl<D: 'static> Definition<D> {
    /// Starts a new definition.
    pub fn builder(name: impl Into<String>) -> DefinitionBuilder<D> {
        DefinitionBuilder::new(name)
    }
}

impl<D> Definition<D> {
    /// Name of the machine type.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All states, indexed by [`StateId::index`].
    pub fn states(&self) -> &[State<D>] {
        &self.states
    }

    /// Looks up a state.
    pub fn state(&self, id: StateId) -> Option<&State<D>> {
        self.states.get(id.index())
    }

    /// Resolves a position. `None` means the position is invalid.
    pub fn step(&self, position: Position) -> Option<&Step<D>> {
        self.state(position.state)?.steps.get(position.step)
    }

    /// Where new instances start.
    pub fn initial(&self) -> Position {
        self.initial
    }

    /// Handler for faults without a catch policy.
    pub fn unhandled_handler(&self) -> Option<&UnhandledHandler<D>> {
        self.on_unhandled.as_ref()
    }

    /// Short human-readable description of a position, for diagnostics.
    pub fn describe(&self, position: Position) -> String {
        match (self.state(position.state), self.step(position)) {
            (Some(state), Some(step)) => format!(
                "state '{}' step {} ({})",
                state.name, step.index, step.description
            ),
            (Some(state), None) => format!(
                "state '{}' step {} (out of range)",
                state.name, position.step
            ),
            _ => format!("unknown position {position}"),
        }
    }
}

impl<D> fmt::Debug for Definition<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Definition")
            .field("name", &self.name)
            .field("states", &self.states)
            .field("initial", &self.initial)
            .field("on_unhandled", &self.on_unhandled.is_some())
            .finish()
    }
}
