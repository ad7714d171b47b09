//! Machine instances.

use crate::config::EngineConfig;
use crate::controller::{execute_step, execute_step_async};
use crate::runner::{RunHandle, Runner, ThrottledRunner};
use async_trait::async_trait;
use ayumi_core::{
    ControlBlock, DataGuard, Definition, Event, EventKind, ExecutionContext, Phase, Position,
    Telemetry, WorkflowError,
};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

#[derive(Debug, Clone, Copy)]
struct Cursor {
    position: Position,
    phase: Phase,
}

/// Storage of one instance. This is what runners and the controller drive.
///
/// Obtained through [`Machine::context`].
pub struct MachineCore<D> {
    name: String,
    definition: Arc<Definition<D>>,
    cursor: RwLock<Cursor>,
    data: Arc<Mutex<D>>,
    control: ControlBlock,
    telemetry: Telemetry,
}

#[async_trait]
impl<D: Send + Sync + 'static> ExecutionContext for MachineCore<D> {
    type Data = D;

    fn name(&self) -> &str {
        &self.name
    }

    fn definition(&self) -> &Arc<Definition<D>> {
        &self.definition
    }

    fn position(&self) -> Position {
        self.cursor.read().position
    }

    fn set_position(&self, position: Position) {
        self.cursor.write().position = position;
    }

    fn phase(&self) -> Phase {
        self.cursor.read().phase
    }

    fn set_phase(&self, phase: Phase) {
        self.cursor.write().phase = phase;
    }

    fn control(&self) -> &ControlBlock {
        &self.control
    }

    fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    async fn lock(&self) -> DataGuard<D> {
        Arc::clone(&self.data).lock_owned().await
    }

    fn lock_blocking(&self) -> DataGuard<D> {
        Arc::clone(&self.data).blocking_lock_owned()
    }

    fn try_lock(&self) -> Option<DataGuard<D>> {
        Arc::clone(&self.data).try_lock_owned().ok()
    }
}

impl<D> fmt::Debug for MachineCore<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cursor = *self.cursor.read();
        f.debug_struct("MachineCore")
            .field("name", &self.name)
            .field("definition", &self.definition.name())
            .field("position", &cursor.position)
            .field("phase", &cursor.phase)
            .finish()
    }
}

/// A running instance of a [`Definition`] with its own data.
///
/// Cheap to clone; clones share the instance.
///
/// # Examples
///
/// ```
/// use ayumi::prelude::*;
///
/// let mut builder = Definition::<u32>::builder("counter");
/// let main = builder.state("main");
/// builder
///     .step(main, "count", |s| {
///         s.repeat_while(|n| *n < 3).act(|n| {
///             *n += 1;
///             Ok(())
///         })
///     })
///     .step(main, "done", |s| s.finish());
/// let machine = Machine::new("counter-1", builder.build().expect("valid definition"), 0);
///
/// let phase = machine
///     .run(&BlockingRunner::new())
///     .expect("not running yet")
///     .phase();
/// assert_eq!(phase, Some(Phase::Finished));
/// assert_eq!(machine.lock_and_execute(|n| *n), 3);
/// ```
pub struct Machine<D> {
    core: Arc<MachineCore<D>>,
}

impl<D> Clone for Machine<D> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<D> fmt::Debug for Machine<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.core, f)
    }
}

impl<D: Send + Sync + 'static> Machine<D> {
    /// Creates a `Prepared` instance at the definition's initial position.
    pub fn new(name: impl Into<String>, definition: Arc<Definition<D>>, data: D) -> Self {
        Self::with_config(name, definition, data, &EngineConfig::default())
    }

    /// Creates an instance using `config` for its event bus.
    pub fn with_config(
        name: impl Into<String>,
        definition: Arc<Definition<D>>,
        data: D,
        config: &EngineConfig,
    ) -> Self {
        let cursor = Cursor {
            position: definition.initial(),
            phase: Phase::Prepared,
        };
        Self {
            core: Arc::new(MachineCore {
                name: name.into(),
                definition,
                cursor: RwLock::new(cursor),
                data: Arc::new(Mutex::new(data)),
                control: ControlBlock::new(),
                telemetry: Telemetry::new(config.event_capacity),
            }),
        }
    }

    /// Instance name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Process-unique instance id.
    pub fn id(&self) -> u64 {
        self.core.control.id()
    }

    /// The definition this instance executes.
    pub fn definition(&self) -> &Arc<Definition<D>> {
        &self.core.definition
    }

    /// The execution context, for calling the controller directly.
    pub fn context(&self) -> &MachineCore<D> {
        &self.core
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<MachineCore<D>> {
        &self.core
    }

    /// Current position.
    pub fn position(&self) -> Position {
        self.core.position()
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.core.phase()
    }

    /// `true` while a runner drives this instance.
    pub fn is_running(&self) -> bool {
        self.core.control.is_driving()
    }

    /// Subscribes to this instance's events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.core.telemetry.subscribe()
    }

    /// Drives the instance with `runner`.
    ///
    /// Fails with [`WorkflowError::AlreadyRunning`] if another runner drives
    /// it already.
    pub fn run<R: Runner>(&self, runner: &R) -> Result<RunHandle, WorkflowError> {
        runner.run(Arc::clone(&self.core))
    }

    /// Drives the instance with a default [`ThrottledRunner`]. Requires a
    /// tokio runtime.
    pub fn start(&self) -> Result<RunHandle, WorkflowError> {
        self.run(&ThrottledRunner::default())
    }

    /// Asks the instance to pause after its current step.
    ///
    /// With `cancel_current_wait`, a wait in progress ends early and the
    /// step does not advance.
    pub fn request_pause(&self, cancel_current_wait: bool) {
        self.core.request_pause(cancel_current_wait);
    }

    /// Acquires the instance lock if it is free.
    pub fn try_lock(&self) -> Option<DataGuard<D>> {
        self.core.try_lock()
    }

    /// Acquires the instance lock, giving up after `timeout`.
    pub async fn try_lock_for(&self, timeout: Duration) -> Option<DataGuard<D>> {
        self.core.try_lock_for(timeout).await
    }

    /// Acquires the instance lock, blocking for at most `timeout`.
    pub fn try_lock_for_blocking(&self, timeout: Duration) -> Option<DataGuard<D>> {
        self.core.try_lock_for_blocking(timeout)
    }

    /// Runs `f` with the instance lock held. Blocks the current thread.
    pub fn lock_and_execute<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        let mut guard = self.core.lock_blocking();
        f(&mut *guard)
    }

    /// Runs `f` with the instance lock held.
    pub async fn lock_and_execute_async<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        let mut guard = self.core.lock().await;
        f(&mut *guard)
    }

    /// Executes one step on the calling thread.
    pub fn execute_next_step(&self) -> Result<bool, WorkflowError> {
        execute_step(&*self.core)
    }

    /// Executes one step.
    pub async fn execute_next_step_async(&self) -> Result<bool, WorkflowError> {
        execute_step_async(&*self.core).await
    }

    /// Executes up to `count` steps on the calling thread, stopping early
    /// once the instance stops running. Returns the number of controller
    /// calls made.
    pub fn execute_next_steps(&self, count: usize) -> Result<usize, WorkflowError> {
        for executed in 0..count {
            if !self.execute_next_step()? {
                return Ok(executed + 1);
            }
        }
        Ok(count)
    }

    /// Async variant of [`execute_next_steps`](Self::execute_next_steps).
    pub async fn execute_next_steps_async(&self, count: usize) -> Result<usize, WorkflowError> {
        for executed in 0..count {
            if !self.execute_next_step_async().await? {
                return Ok(executed + 1);
            }
        }
        Ok(count)
    }

    /// Emits [`EventKind::InfoRequested`] describing the current step.
    pub fn request_info(&self) {
        let description = self.core.definition.describe(self.core.position());
        self.core
            .emit_event(EventKind::InfoRequested, Some(description));
    }
}
