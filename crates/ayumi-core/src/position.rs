//! Instruction pointer and lifecycle types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable index of a state inside a [`Definition`](crate::Definition).
///
/// Assigned by the builder in declaration order and never renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateId(usize);

impl StateId {
    /// Creates a state id from a raw index.
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Returns the raw index.
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<usize> for StateId {
    fn from(index: usize) -> Self {
        Self(index)
    }
}

/// Where an instance currently is: a state and a step index inside it.
///
/// # Examples
///
/// ```
/// use ayumi_core::{Position, StateId};
///
/// let p = Position::new(StateId::new(1), 2);
/// assert_eq!(p.next_step(), Position::new(StateId::new(1), 3));
/// assert_eq!(Position::entry(StateId::new(4)).step, 0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    /// State the step belongs to.
    pub state: StateId,
    /// Index of the step inside the state.
    pub step: usize,
}

impl Position {
    /// Creates a position.
    pub const fn new(state: StateId, step: usize) -> Self {
        Self { state, step }
    }

    /// First step of `state`.
    pub const fn entry(state: StateId) -> Self {
        Self { state, step: 0 }
    }

    /// The following step in the same state. Never clamped.
    pub const fn next_step(self) -> Self {
        Self {
            state: self.state,
            step: self.step + 1,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.state.0, self.step)
    }
}

/// Coarse lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Phase {
    /// Created, never driven.
    #[default]
    Prepared,
    /// Being driven by a runner or stepped manually.
    Running,
    /// Suspended inside a wait; the instance lock is released.
    Waiting,
    /// Stopped at a step boundary after a pause request.
    Paused,
    /// A finish transition was executed.
    Finished,
    /// The position did not resolve to a step, or a fault was not handled.
    Invalid,
}

impl Phase {
    /// Returns `true` for phases a runner may (re)start from.
    ///
    /// `Waiting` counts: an instance whose drive loop was dropped mid-wait
    /// resumes by running the wait step again.
    pub fn is_resumable(self) -> bool {
        matches!(
            self,
            Phase::Prepared | Phase::Paused | Phase::Running | Phase::Waiting
        )
    }

    /// Returns `true` once the instance can never run again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Finished | Phase::Invalid)
    }

    /// Short snake_case label for logs.
    pub fn as_label(self) -> &'static str {
        match self {
            Phase::Prepared => "prepared",
            Phase::Running => "running",
            Phase::Waiting => "waiting",
            Phase::Paused => "paused",
            Phase::Finished => "finished",
            Phase::Invalid => "invalid",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}
