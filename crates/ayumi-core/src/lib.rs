//! State graph, execution contract and telemetry types for the ayumi step
//! engine.
//!
//! This crate holds everything that does not drive execution itself. The
//! controller, machines and runners live in the `ayumi` crate.
//!
//! # Core Types
//!
//! - [`Definition`] - Frozen graph of [`State`]s, [`Step`]s and [`PartialStep`]s
//! - [`DefinitionBuilder`] / [`StepBuilder`] - Construction and validation
//! - [`ExecutionContext`] - What an instance exposes to be driven
//! - [`Signal`] - Manual-reset event awaitable from blocking and async code
//! - [`Event`] / [`Telemetry`] / [`Bus`] - Execution telemetry
//! - [`StepError`] / [`WorkflowError`] - Business and engine faults

mod builder;
mod context;
mod definition;
mod error;
mod event;
mod partial;
mod position;
mod signal;

pub use builder::{DefinitionBuilder, StepBuilder};
pub use context::{ControlBlock, DataGuard, ExecutionContext};
pub use definition::{Definition, Disposition, Fault, State, Step, UnhandledHandler};
pub use error::{StepError, WorkflowError};
pub use event::{Bus, Event, EventKind, Telemetry, DEFAULT_EVENT_CAPACITY};
pub use partial::{
    Action, AsyncPredicate, AsyncProcedure, AsyncRecovery, AsyncRetry, CatchPolicy, Condition,
    Effect, PartialStep, Recovery, RetryDecision, SignalFn, SyncPredicate, SyncProcedure,
    SyncRecovery, SyncRetry, TargetFn, TimeoutFn, Transition, WaitDirective,
};
pub use position::{Phase, Position, StateId};
pub use signal::Signal;
pub use tokio_util::sync::CancellationToken;
