use super::{begin, settle, RunHandle, Runner};
use crate::controller::execute_step_async;
use crate::registry::Registry;
use ayumi_core::{ExecutionContext, WorkflowError};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Drives each instance in its own tokio task. [`run`](Runner::run)
/// returns immediately.
///
/// Steps whose callables never suspend keep the worker thread busy until
/// they do; see [`ThrottledRunner`](crate::ThrottledRunner) for machines
/// that may spin.
#[derive(Debug, Clone, Default)]
pub struct NonBlockingRunner {
    registry: Arc<Registry>,
}

impl NonBlockingRunner {
    /// Creates a runner with its own registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a runner that enlists instances in `registry`.
    pub fn with_registry(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

impl Runner for NonBlockingRunner {
    fn run<C: ExecutionContext>(&self, ctx: Arc<C>) -> Result<RunHandle, WorkflowError> {
        let runtime = Handle::try_current().map_err(|e| WorkflowError::Runtime(e.to_string()))?;
        let lease = self.registry.enlist(&ctx)?;

        let handle = runtime.spawn(async move {
            let _lease = lease;
            if !begin(&*ctx) {
                return ctx.phase();
            }
            let outcome = AssertUnwindSafe(async {
                while execute_step_async(&*ctx).await? {}
                Ok::<(), WorkflowError>(())
            })
            .catch_unwind()
            .await;
            settle(&*ctx, outcome)
        });
        Ok(RunHandle::Spawned(handle))
    }

    fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}
