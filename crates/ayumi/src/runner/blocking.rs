use super::{drive_blocking, RunHandle, Runner};
use crate::registry::Registry;
use ayumi_core::{ExecutionContext, WorkflowError};
use std::sync::Arc;

/// Drives instances on the calling thread until they stop.
///
/// Must not be used from inside an async context.
#[derive(Debug, Clone, Default)]
pub struct BlockingRunner {
    registry: Arc<Registry>,
}

impl BlockingRunner {
    /// Creates a runner with its own registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a runner that enlists instances in `registry`.
    pub fn with_registry(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

impl Runner for BlockingRunner {
    fn run<C: ExecutionContext>(&self, ctx: Arc<C>) -> Result<RunHandle, WorkflowError> {
        let _lease = self.registry.enlist(&ctx)?;
        Ok(RunHandle::Completed(drive_blocking(&*ctx)))
    }

    fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Machine;
    use ayumi_core::{Definition, EventKind, Phase, StepError};

    #[test]
    fn test_runs_to_finish_and_deregisters() {
        let mut builder = Definition::<u32>::builder("count");
        let main = builder.state("main");
        builder
            .step(main, "count", |s| {
                s.repeat_while(|n| *n < 5).act(|n| {
                    *n += 1;
                    Ok(())
                })
            })
            .step(main, "finish", |s| s.finish());
        let machine = Machine::new("count-1", builder.build().expect("valid definition"), 0);
        let mut rx = machine.subscribe();
        let runner = BlockingRunner::new();

        let handle = machine.run(&runner).expect("run");
        assert_eq!(handle.phase(), Some(Phase::Finished));
        assert_eq!(machine.lock_and_execute(|n| *n), 5);
        assert!(runner.registry().is_empty());
        assert_eq!(rx.try_recv().map(|e| e.kind).ok(), Some(EventKind::WorkflowStarted));

        let again = machine.run(&runner).expect("finished machines return at once");
        assert_eq!(again.phase(), Some(Phase::Finished));
    }

    #[test]
    fn test_unhandled_fault_ends_loop_as_invalid() {
        let mut builder = Definition::<()>::builder("broken");
        let main = builder.state("main");
        builder.step(main, "fail", |s| s.act(|_| Err(StepError::failed("boom"))));
        let machine = Machine::new("broken-1", builder.build().expect("valid definition"), ());

        let handle = machine.run(&BlockingRunner::new()).expect("run");
        assert_eq!(handle.phase(), Some(Phase::Invalid));
    }

    #[test]
    #[allow(clippy::panic)]
    fn test_panicking_step_is_isolated() {
        let mut builder = Definition::<()>::builder("panicky");
        let main = builder.state("main");
        builder.step(main, "panic", |s| s.act(|_| panic!("step exploded")));
        let machine = Machine::new("panicky-1", builder.build().expect("valid definition"), ());
        let mut rx = machine.subscribe();
        let runner = BlockingRunner::new();

        let handle = machine.run(&runner).expect("run");
        assert_eq!(handle.phase(), Some(Phase::Invalid));
        assert!(runner.registry().is_empty());
        assert!(machine.try_lock().is_some());

        let kinds: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        let invalid = kinds
            .iter()
            .find(|e| e.kind == EventKind::WorkflowInvalid)
            .expect("invalid event");
        assert!(invalid
            .payload
            .as_deref()
            .is_some_and(|p| p.contains("step exploded")));
    }
}
