//! Runner strategies.
//!
//! A runner repeatedly asks the controller to execute an instance's next
//! step until the controller says to stop. Strategies differ only in where
//! that loop runs:
//!
//! | Runner                | Loop runs on                  | `run` returns   |
//! |-----------------------|-------------------------------|-----------------|
//! | [`BlockingRunner`]    | the calling thread            | when done       |
//! | [`PooledRunner`]      | tokio's blocking thread pool  | immediately     |
//! | [`NonBlockingRunner`] | a tokio task                  | immediately     |
//! | [`ThrottledRunner`]   | a tokio task, yielding        | immediately     |
//!
//! Every runner enlists the instance in its [`Registry`] for the duration
//! of the loop. Faults that escape the controller and panics inside steps
//! are logged and end the loop of that instance only.

mod blocking;
mod nonblocking;
mod pooled;
mod throttled;

pub use blocking::BlockingRunner;
pub use nonblocking::NonBlockingRunner;
pub use pooled::PooledRunner;
pub use throttled::ThrottledRunner;

use crate::controller::{execute_step, mark_invalid};
use crate::registry::Registry;
use ayumi_core::{EventKind, ExecutionContext, Phase, WorkflowError};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// A scheduling strategy for driving instances.
pub trait Runner: Send + Sync {
    /// Starts driving `ctx`.
    ///
    /// Fails with [`WorkflowError::AlreadyRunning`] when the instance is
    /// driven already, and with [`WorkflowError::Runtime`] when a spawning
    /// runner is used outside a tokio runtime.
    fn run<C: ExecutionContext>(&self, ctx: Arc<C>) -> Result<RunHandle, WorkflowError>;

    /// The registry instances are enlisted in while driven.
    fn registry(&self) -> &Arc<Registry>;
}

/// Outcome of [`Runner::run`].
#[derive(Debug)]
pub enum RunHandle {
    /// The loop already ended, leaving the instance in this phase.
    Completed(Phase),
    /// The loop runs in the background.
    Spawned(JoinHandle<Phase>),
}

impl RunHandle {
    /// The final phase if the loop already ended.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            RunHandle::Completed(phase) => Some(*phase),
            RunHandle::Spawned(_) => None,
        }
    }

    /// `true` once the loop ended.
    pub fn is_finished(&self) -> bool {
        match self {
            RunHandle::Completed(_) => true,
            RunHandle::Spawned(handle) => handle.is_finished(),
        }
    }

    /// Waits for the loop to end and returns the phase it left the
    /// instance in.
    pub async fn join(self) -> Result<Phase, WorkflowError> {
        match self {
            RunHandle::Completed(phase) => Ok(phase),
            RunHandle::Spawned(handle) => handle
                .await
                .map_err(|e| WorkflowError::Join(e.to_string())),
        }
    }
}

/// `Prepared | Paused | Running -> Running`. Returns `false` for instances
/// that must not be driven.
pub(crate) fn begin<C: ExecutionContext>(ctx: &C) -> bool {
    let phase = ctx.phase();
    if !phase.is_resumable() {
        info!(
            "Machine '{}' not started: phase is {}",
            ctx.name(),
            phase
        );
        return false;
    }
    ctx.set_phase(Phase::Running);
    info!("Machine '{}' started at {}", ctx.name(), ctx.position());
    ctx.emit_event(EventKind::WorkflowStarted, None);
    true
}

/// Logs how the loop ended and returns the final phase.
pub(crate) fn settle<C: ExecutionContext>(
    ctx: &C,
    outcome: Result<Result<(), WorkflowError>, Box<dyn Any + Send>>,
) -> Phase {
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(
                "Machine '{}' stopped on error ({}): {}",
                ctx.name(),
                e.as_label(),
                e
            );
        }
        Err(panic) => {
            let e = WorkflowError::Panicked {
                machine: ctx.name().to_string(),
                details: panic_message(panic.as_ref()),
            };
            error!("{}", e);
            mark_invalid(ctx, e.to_string());
        }
    }
    let phase = ctx.phase();
    info!("Machine '{}' stopped: {}", ctx.name(), phase);
    phase
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The blocking drive loop shared by [`BlockingRunner`] and
/// [`PooledRunner`].
pub(crate) fn drive_blocking<C: ExecutionContext>(ctx: &C) -> Phase {
    if !begin(ctx) {
        return ctx.phase();
    }
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| -> Result<(), WorkflowError> {
        while execute_step(ctx)? {}
        Ok(())
    }));
    settle(ctx, outcome)
}
