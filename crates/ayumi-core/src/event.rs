//! Execution telemetry.
//!
//! Every observable transition of an instance is published as an [`Event`]
//! on the instance's [`Telemetry`]. Telemetry owns one [`Bus`] for direct
//! subscribers and can forward to any number of attached buses, which is
//! how a registry builds its fan-in stream.
//!
//! ## Ordering
//! Each event carries a process-wide sequence number (`seq`) that increases
//! monotonically. Within one instance, events are published in the order
//! the controller produces them.
//!
//! ## Delivery
//! Publishing never blocks and never fails. Events published while nobody
//! subscribes are dropped; slow receivers observe
//! [`RecvError::Lagged`](tokio::sync::broadcast::error::RecvError::Lagged).

use crate::position::{Phase, Position};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::broadcast;

static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);
static BUS_ID: AtomicU64 = AtomicU64::new(0);

/// Default capacity of a bus ring buffer.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Classification of telemetry events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A runner started driving the instance.
    WorkflowStarted,
    /// A `finish` transition ran.
    WorkflowFinished,
    /// A requested pause took effect after a step.
    WorkflowPaused,
    /// The instance reached an invalid position or an unhandled fault.
    WorkflowInvalid,
    /// A transition moved the instance to a different state.
    ///
    /// `payload`: name of the target state.
    StateTransition,
    /// A wait began. `phase` is `Waiting`.
    BeginWaiting,
    /// A wait ended (signalled, timed out or cancelled).
    EndWaiting,
    /// A fault had no catch policy.
    ///
    /// `payload`: the fault.
    ExceptionNotCaught,
    /// A fault was handled by a retry predicate.
    ///
    /// `payload`: the fault.
    ExceptionCaughtWithRetry,
    /// A fault was handled by a recovery action.
    ///
    /// `payload`: the fault.
    ExceptionCaughtWithAction,
    /// A fault was handled by jumping to another state.
    ///
    /// `payload`: the fault.
    ExceptionCaughtWithTransition,
    /// A resolved branch had no effect.
    DanglingStep,
    /// Someone asked the instance to describe itself.
    ///
    /// `payload`: description of the current state and step.
    InfoRequested,
}

impl EventKind {
    /// Short snake_case label for logs.
    pub fn as_label(self) -> &'static str {
        match self {
            EventKind::WorkflowStarted => "workflow_started",
            EventKind::WorkflowFinished => "workflow_finished",
            EventKind::WorkflowPaused => "workflow_paused",
            EventKind::WorkflowInvalid => "workflow_invalid",
            EventKind::StateTransition => "state_transition",
            EventKind::BeginWaiting => "begin_waiting",
            EventKind::EndWaiting => "end_waiting",
            EventKind::ExceptionNotCaught => "exception_not_caught",
            EventKind::ExceptionCaughtWithRetry => "exception_caught_with_retry",
            EventKind::ExceptionCaughtWithAction => "exception_caught_with_action",
            EventKind::ExceptionCaughtWithTransition => "exception_caught_with_transition",
            EventKind::DanglingStep => "dangling_step",
            EventKind::InfoRequested => "info_requested",
        }
    }

    /// `true` for the four exception kinds.
    pub fn is_exception(self) -> bool {
        matches!(
            self,
            EventKind::ExceptionNotCaught
                | EventKind::ExceptionCaughtWithRetry
                | EventKind::ExceptionCaughtWithAction
                | EventKind::ExceptionCaughtWithTransition
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// One telemetry event.
///
/// ```
/// use ayumi_core::{Event, EventKind, Phase, Position, StateId};
///
/// let ev = Event::new("door", EventKind::StateTransition, Position::entry(StateId::new(0)), Phase::Running)
///     .with_payload("open");
///
/// assert_eq!(ev.kind, EventKind::StateTransition);
/// assert_eq!(&*ev.machine, "door");
/// assert_eq!(ev.payload.as_deref(), Some("open"));
/// ```
#[derive(Debug, Clone)]
pub struct Event {
    /// Process-wide sequence number.
    pub seq: u64,
    /// Wall-clock time of publication.
    pub at: SystemTime,
    /// Name of the emitting instance.
    pub machine: Arc<str>,
    /// What happened.
    pub kind: EventKind,
    /// Position of the instance when the event was emitted.
    pub position: Position,
    /// Phase of the instance when the event was emitted.
    pub phase: Phase,
    /// Optional kind-specific detail.
    pub payload: Option<Arc<str>>,
}

impl Event {
    /// Creates an event stamped with the next sequence number and the
    /// current time.
    pub fn new(
        machine: impl Into<Arc<str>>,
        kind: EventKind,
        position: Position,
        phase: Phase,
    ) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, Ordering::Relaxed),
            at: SystemTime::now(),
            machine: machine.into(),
            kind,
            position,
            phase,
            payload: None,
        }
    }

    /// Attaches a payload.
    pub fn with_payload(mut self, payload: impl Into<Arc<str>>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} at {} ({})",
            self.seq, self.machine, self.kind, self.position, self.phase
        )?;
        if let Some(payload) = &self.payload {
            write!(f, ": {payload}")?;
        }
        Ok(())
    }
}

/// Broadcast channel for events.
///
/// Thin wrapper over [`tokio::sync::broadcast`]. Cheap to clone; clones
/// share the channel and the id.
#[derive(Clone, Debug)]
pub struct Bus {
    id: u64,
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Creates a bus. The minimum capacity is 1 (clamped).
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            id: BUS_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    /// Process-unique id of the channel.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Publishes to every current subscriber. Dropped if there are none.
    pub fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// Creates an independent receiver for events sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Number of live receivers.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Per-instance event sink: an own bus plus attached forwarding buses.
#[derive(Debug)]
pub struct Telemetry {
    bus: Bus,
    sinks: RwLock<Vec<Bus>>,
}

impl Telemetry {
    /// Creates telemetry with its own bus of the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            bus: Bus::new(capacity),
            sinks: RwLock::new(Vec::new()),
        }
    }

    /// Publishes to the own bus and every attached bus.
    pub fn publish(&self, ev: Event) {
        for sink in self.sinks.read().iter() {
            sink.publish(ev.clone());
        }
        self.bus.publish(ev);
    }

    /// Subscribes to this instance's events only.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    /// Forwards future events to `bus` as well. Attaching twice is a no-op.
    pub fn attach(&self, bus: &Bus) {
        let mut sinks = self.sinks.write();
        if sinks.iter().all(|s| s.id() != bus.id()) {
            sinks.push(bus.clone());
        }
    }

    /// Stops forwarding to the bus with `bus_id`.
    pub fn detach(&self, bus_id: u64) {
        self.sinks.write().retain(|s| s.id() != bus_id);
    }

    /// Number of attached buses.
    pub fn sink_count(&self) -> usize {
        self.sinks.read().len()
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
