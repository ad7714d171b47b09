//! Error types.

use crate::position::{Position, StateId};
use thiserror::Error;

/// A fault raised by a condition, action, recovery action or retry predicate.
///
/// These are the business errors that a step's catch policy can handle.
/// [`StepError::Cancelled`] is special: it never reaches a catch policy and
/// only stops the current step from advancing.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StepError {
    /// The step failed.
    #[error("step failed: {details}")]
    Failed {
        /// Details about the failure.
        details: String,
    },

    /// The step observed cancellation and gave up cooperatively.
    #[error("step cancelled")]
    Cancelled,

    /// Any other error bubbling up from user code.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl StepError {
    /// Creates a [`StepError::Failed`].
    pub fn failed(details: impl Into<String>) -> Self {
        StepError::Failed {
            details: details.into(),
        }
    }

    /// Returns `true` for [`StepError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StepError::Cancelled)
    }

    /// Short snake_case label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            StepError::Failed { .. } => "step_failed",
            StepError::Cancelled => "step_cancelled",
            StepError::Other(_) => "step_error",
        }
    }
}

/// Errors produced by the engine itself.
///
/// # Non-Exhaustive
///
/// Always include a wildcard arm when matching:
///
/// ```
/// use ayumi_core::WorkflowError;
///
/// fn describe(error: &WorkflowError) -> String {
///     match error {
///         WorkflowError::Configuration(msg) => format!("bad definition: {msg}"),
///         WorkflowError::Unhandled { machine, position, .. } => {
///             format!("{machine} failed at {position}")
///         }
///         other => other.to_string(),
///     }
/// }
/// ```
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum WorkflowError {
    /// The definition is malformed.
    #[error("Invalid workflow definition: {0}")]
    Configuration(String),

    /// A transition or catch policy pointed at a state that does not exist.
    #[error("State not found: {0}")]
    UnknownState(StateId),

    /// A step fault had no catch policy and the unhandled-fault handler gave up.
    #[error("Unhandled fault in '{machine}' at {position}: {source}")]
    Unhandled {
        /// Name of the instance.
        machine: String,
        /// Position of the failing step.
        position: Position,
        /// The fault itself.
        #[source]
        source: StepError,
    },

    /// The instance is already being driven by a runner.
    #[error("Machine '{0}' is already running")]
    AlreadyRunning(String),

    /// A step panicked.
    #[error("Machine '{machine}' panicked: {details}")]
    Panicked {
        /// Name of the instance.
        machine: String,
        /// Panic payload, if it was a string.
        details: String,
    },

    /// A spawned drive loop could not be joined.
    #[error("Drive loop join failed: {0}")]
    Join(String),

    /// A runner that spawns work was used outside a tokio runtime.
    #[error("No async runtime available: {0}")]
    Runtime(String),
}

impl WorkflowError {
    /// Short snake_case label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            WorkflowError::Configuration(_) => "workflow_configuration",
            WorkflowError::UnknownState(_) => "workflow_unknown_state",
            WorkflowError::Unhandled { .. } => "workflow_unhandled",
            WorkflowError::AlreadyRunning(_) => "workflow_already_running",
            WorkflowError::Panicked { .. } => "workflow_panicked",
            WorkflowError::Join(_) => "workflow_join",
            WorkflowError::Runtime(_) => "workflow_runtime",
        }
    }
}
