//! Bookkeeping of the instances a runner currently drives.
//!
//! An instance is enlisted before its first step and removed when its drive
//! loop ends. The registry also offers a fan-in event stream over every
//! enlisted instance and a "pause all" operation.

use ayumi_core::{Bus, ControlBlock, Event, ExecutionContext, Signal, Telemetry, WorkflowError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Object-safe view of an enlisted instance.
trait Driven: Send + Sync {
    fn label(&self) -> &str;
    fn control_block(&self) -> &ControlBlock;
    fn sink(&self) -> &Telemetry;
}

impl<C: ExecutionContext> Driven for C {
    fn label(&self) -> &str {
        self.name()
    }

    fn control_block(&self) -> &ControlBlock {
        self.control()
    }

    fn sink(&self) -> &Telemetry {
        self.telemetry()
    }
}

/// Instances currently driven, keyed by instance id.
pub struct Registry {
    instances: Mutex<HashMap<u64, Arc<dyn Driven>>>,
    events: Mutex<Option<Bus>>,
    event_capacity: usize,
}

impl Registry {
    /// Creates an empty registry whose fan-in stream uses the default
    /// capacity.
    pub fn new() -> Self {
        Self::with_capacity(ayumi_core::DEFAULT_EVENT_CAPACITY)
    }

    /// Creates an empty registry whose fan-in stream buffers
    /// `event_capacity` events.
    pub fn with_capacity(event_capacity: usize) -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            events: Mutex::new(None),
            event_capacity,
        }
    }

    /// Subscribes to the events of every enlisted instance.
    ///
    /// The fan-in bus is created on first use and follows instances as they
    /// are enlisted and removed.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        let mut events = self.events.lock();
        if let Some(bus) = events.as_ref() {
            return bus.subscribe();
        }

        let bus = Bus::new(self.event_capacity);
        for instance in self.instances.lock().values() {
            instance.sink().attach(&bus);
        }
        let receiver = bus.subscribe();
        *events = Some(bus);
        receiver
    }

    /// Names of the enlisted instances.
    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .instances
            .lock()
            .values()
            .map(|i| i.label().to_string())
            .collect();
        names.sort();
        names
    }

    /// Number of enlisted instances.
    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    /// `true` when no instance is enlisted.
    pub fn is_empty(&self) -> bool {
        self.instances.lock().is_empty()
    }

    /// `true` if the instance with `id` is enlisted.
    pub fn contains(&self, id: u64) -> bool {
        self.instances.lock().contains_key(&id)
    }

    /// Requests a pause with wait cancellation on every enlisted instance
    /// and returns their idle signals.
    fn request_pause_all(&self) -> Vec<Signal> {
        let instances: Vec<Arc<dyn Driven>> = self.instances.lock().values().cloned().collect();
        debug!(count = instances.len(), "pausing all instances");
        instances
            .iter()
            .map(|instance| {
                let control = instance.control_block();
                control.request_pause(true);
                control.idle().clone()
            })
            .collect()
    }

    /// Pauses every enlisted instance and waits until each stopped.
    pub async fn pause_all(&self) {
        for idle in self.request_pause_all() {
            idle.wait().await;
        }
    }

    /// Blocking variant of [`pause_all`](Self::pause_all).
    pub fn pause_all_blocking(&self) {
        for idle in self.request_pause_all() {
            idle.wait_timeout(None);
        }
    }

    /// Enlists `ctx`. The returned lease removes it again when dropped.
    pub(crate) fn enlist<C: ExecutionContext>(
        self: &Arc<Self>,
        ctx: &Arc<C>,
    ) -> Result<Lease, WorkflowError> {
        let control = ctx.control();
        if !control.try_begin_driving() {
            return Err(WorkflowError::AlreadyRunning(ctx.name().to_string()));
        }

        let id = control.id();
        let instance: Arc<dyn Driven> = Arc::clone(ctx) as Arc<dyn Driven>;
        self.instances.lock().insert(id, Arc::clone(&instance));
        if let Some(bus) = self.events.lock().as_ref() {
            instance.sink().attach(bus);
        }
        debug!(machine = ctx.name(), id, "instance enlisted");

        Ok(Lease {
            registry: Arc::clone(self),
            id,
            instance,
        })
    }

    fn remove(&self, id: u64, instance: &dyn Driven) {
        self.instances.lock().remove(&id);
        if let Some(bus) = self.events.lock().as_ref() {
            instance.sink().detach(bus.id());
        }
        debug!(machine = instance.label(), id, "instance removed");
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("running", &self.running())
            .field("fan_in", &self.events.lock().is_some())
            .finish()
    }
}

/// Keeps an instance enlisted while alive.
pub(crate) struct Lease {
    registry: Arc<Registry>,
    id: u64,
    instance: Arc<dyn Driven>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.registry.remove(self.id, self.instance.as_ref());
        self.instance.control_block().end_driving();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Machine;
    use ayumi_core::{Definition, EventKind};

    fn machine(name: &str) -> Machine<()> {
        let mut builder = Definition::<()>::builder("idle");
        let main = builder.state("main");
        builder.step(main, "finish", |s| s.finish());
        Machine::new(name, builder.build().expect("valid definition"), ())
    }

    #[test]
    fn test_enlist_rejects_second_driver() {
        let registry = Arc::new(Registry::new());
        let first = machine("first");
        let core = Arc::clone(first.core());
        let lease = registry.enlist(&core).expect("first enlist");
        assert!(first.is_running());
        assert_eq!(registry.running(), vec!["first".to_string()]);

        let again = registry.enlist(&core);
        assert!(matches!(again, Err(WorkflowError::AlreadyRunning(name)) if name == "first"));

        drop(lease);
        assert!(registry.is_empty());
        assert!(!first.is_running());
        assert!(first.context().control().idle().is_set());
    }

    #[test]
    fn test_fan_in_follows_enlisted_instances() {
        let registry = Arc::new(Registry::new());
        let a = machine("a");
        let b = machine("b");
        let a_core = Arc::clone(a.core());
        let b_core = Arc::clone(b.core());

        let lease_a = registry.enlist(&a_core).expect("enlist a");
        let mut events = registry.events();
        let lease_b = registry.enlist(&b_core).expect("enlist b");

        a.request_info();
        b.request_info();
        let first = events.try_recv().expect("event from a");
        let second = events.try_recv().expect("event from b");
        assert_eq!(first.kind, EventKind::InfoRequested);
        assert_eq!((&*first.machine, &*second.machine), ("a", "b"));

        drop(lease_a);
        a.request_info();
        assert!(events.try_recv().is_err());
        drop(lease_b);
    }

    #[test]
    fn test_pause_all_blocking_returns_when_idle() {
        let registry = Arc::new(Registry::new());
        let m = machine("m");
        let core = Arc::clone(m.core());
        let lease = registry.enlist(&core).expect("enlist");

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            drop(lease);
        });
        registry.pause_all_blocking();
        releaser.join().expect("releaser thread");

        assert!(m.context().is_pause_requested());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_pause_all_on_empty_registry_is_immediate() {
        let registry = Registry::new();
        tokio_test::block_on(registry.pause_all());
        assert!(registry.is_empty());
        assert!(registry.running().is_empty());
    }
}
