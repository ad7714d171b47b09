use super::{drive_blocking, RunHandle, Runner};
use crate::registry::Registry;
use ayumi_core::{ExecutionContext, WorkflowError};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::debug;

/// Drives each instance with the blocking loop on tokio's blocking thread
/// pool. [`run`](Runner::run) returns immediately.
#[derive(Debug, Clone, Default)]
pub struct PooledRunner {
    registry: Arc<Registry>,
    handle: Option<Handle>,
}

impl PooledRunner {
    /// Creates a runner that uses the runtime current at each `run` call.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a runner that enlists instances in `registry`.
    pub fn with_registry(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            handle: None,
        }
    }

    /// Uses the blocking pool of `handle`'s runtime. Allows calling `run`
    /// from threads outside the runtime.
    pub fn with_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    fn runtime(&self) -> Result<Handle, WorkflowError> {
        match &self.handle {
            Some(handle) => Ok(handle.clone()),
            None => Handle::try_current().map_err(|e| WorkflowError::Runtime(e.to_string())),
        }
    }
}

impl Runner for PooledRunner {
    fn run<C: ExecutionContext>(&self, ctx: Arc<C>) -> Result<RunHandle, WorkflowError> {
        let runtime = self.runtime()?;
        let lease = self.registry.enlist(&ctx)?;
        debug!(machine = ctx.name(), "submitting to blocking pool");

        let handle = runtime.spawn_blocking(move || {
            let _lease = lease;
            drive_blocking(&*ctx)
        });
        Ok(RunHandle::Spawned(handle))
    }

    fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Machine;
    use ayumi_core::{Definition, Phase};
    use std::time::Duration;

    #[derive(Default)]
    struct Data {
        naps: u32,
    }

    fn napper() -> Machine<Data> {
        let mut builder = Definition::<Data>::builder("napper");
        let main = builder.state("main");
        builder
            .step(main, "nap", |s| {
                s.repeat_while(|d| d.naps < 3)
                    .sleep(|_| Duration::from_millis(2))
            })
            .step(main, "count", |s| {
                s.act(|d| {
                    d.naps += 1;
                    Ok(())
                })
            })
            .step(main, "finish", |s| s.finish());
        Machine::new("napper-1", builder.build().expect("valid definition"), Data::default())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_runs_on_blocking_pool() {
        let machine = napper();
        machine.lock_and_execute_async(|d| d.naps = 3).await;
        let handle = machine.run(&PooledRunner::new()).expect("run");
        assert_eq!(handle.join().await.ok(), Some(Phase::Finished));
        assert_eq!(machine.lock_and_execute_async(|d| d.naps).await, 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_second_run_is_rejected_while_driven() {
        let machine = napper();
        let runner = PooledRunner::new();
        let handle = machine.run(&runner).expect("first run");

        let second = machine.run(&runner);
        assert!(matches!(second, Err(WorkflowError::AlreadyRunning(_))));

        machine.request_pause(true);
        assert_eq!(handle.join().await.ok(), Some(Phase::Paused));
        assert!(!machine.is_running());
    }

    #[test]
    fn test_requires_runtime() {
        let machine = napper();
        let result = machine.run(&PooledRunner::new());
        assert!(matches!(result, Err(WorkflowError::Runtime(_))));
        assert!(!machine.is_running());
    }
}
