//! The contract a machine instance satisfies to be driven.

use crate::definition::Definition;
use crate::event::{Event, EventKind, Telemetry};
use crate::position::{Phase, Position};
use crate::signal::Signal;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

static INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Polling interval of [`ExecutionContext::try_lock_for_blocking`].
const LOCK_POLL: Duration = Duration::from_millis(1);

/// Exclusive access to an instance's data. Dropping the guard releases the
/// instance lock.
pub type DataGuard<D> = OwnedMutexGuard<D>;

/// Pause, cancellation and driving flags of one instance.
///
/// Shared by the controller, the runner driving the instance and any thread
/// asking it to pause. All methods take `&self`.
#[derive(Debug)]
pub struct ControlBlock {
    id: u64,
    pause: Mutex<PauseState>,
    idle: Signal,
    driving: AtomicBool,
}

/// The pause flag and the cancellation token change together.
#[derive(Debug, Default)]
struct PauseState {
    requested: bool,
    cancellation: Option<CancellationToken>,
}

impl ControlBlock {
    /// Creates an idle control block with a process-unique id.
    pub fn new() -> Self {
        Self {
            id: INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            pause: Mutex::new(PauseState::default()),
            idle: Signal::new_set(),
            driving: AtomicBool::new(false),
        }
    }

    /// Process-unique instance id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the current cancellation token, creating it on first use.
    pub fn cancellation(&self) -> CancellationToken {
        self.pause
            .lock()
            .cancellation
            .get_or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Discards the cancellation token. The next call to
    /// [`cancellation`](Self::cancellation) creates a fresh one.
    pub fn reset_cancellation(&self) {
        self.pause.lock().cancellation.take();
    }

    /// `true` while a pause request is pending.
    pub fn is_pause_requested(&self) -> bool {
        self.pause.lock().requested
    }

    /// Asks the instance to pause after its current step.
    ///
    /// With `cancel_current_wait`, a wait in progress (or the next one) is
    /// interrupted instead of running to its end.
    pub fn request_pause(&self, cancel_current_wait: bool) {
        let mut pause = self.pause.lock();
        pause.requested = true;
        if cancel_current_wait {
            pause
                .cancellation
                .get_or_insert_with(CancellationToken::new)
                .cancel();
        }
    }

    /// Clears the pause request, returning whether one was pending.
    ///
    /// A consumed request also discards the cancellation token, in the same
    /// critical section. A request arriving afterwards always finds both a
    /// pending flag and a cancelled token.
    pub fn take_pause_request(&self) -> bool {
        let mut pause = self.pause.lock();
        let pending = std::mem::take(&mut pause.requested);
        if pending {
            pause.cancellation.take();
        }
        pending
    }

    /// Set while no runner drives the instance.
    pub fn idle(&self) -> &Signal {
        &self.idle
    }

    /// `true` while a runner drives the instance.
    pub fn is_driving(&self) -> bool {
        self.driving.load(Ordering::Acquire)
    }

    /// Marks the instance as driven. Returns `false` if it already was.
    pub fn try_begin_driving(&self) -> bool {
        let acquired = self
            .driving
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if acquired {
            self.idle.reset();
        }
        acquired
    }

    /// Marks the instance as idle and wakes everyone waiting for it.
    pub fn end_driving(&self) {
        self.driving.store(false, Ordering::Release);
        self.idle.set();
    }
}

impl Default for ControlBlock {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the controller and the runners need from a machine instance.
///
/// Implementors supply storage (position, phase, data lock, control block,
/// telemetry); the pause, cancellation and event methods are provided.
///
/// The blocking methods must not be called from inside an async context.
#[async_trait]
pub trait ExecutionContext: Send + Sync + 'static {
    /// The consumer's per-instance data.
    ///
    /// `Sync` because conditions borrow it across await points.
    type Data: Send + Sync + 'static;

    /// Name used in logs and events.
    fn name(&self) -> &str;

    /// The frozen graph this instance executes.
    fn definition(&self) -> &Arc<Definition<Self::Data>>;

    /// Current position.
    fn position(&self) -> Position;

    /// Replaces the position.
    fn set_position(&self, position: Position);

    /// Current phase.
    fn phase(&self) -> Phase;

    /// Replaces the phase.
    fn set_phase(&self, phase: Phase);

    /// Pause, cancellation and driving flags.
    fn control(&self) -> &ControlBlock;

    /// Event sink.
    fn telemetry(&self) -> &Telemetry;

    /// Acquires the instance lock.
    async fn lock(&self) -> DataGuard<Self::Data>;

    /// Acquires the instance lock, blocking the current thread.
    fn lock_blocking(&self) -> DataGuard<Self::Data>;

    /// Acquires the instance lock if it is free.
    fn try_lock(&self) -> Option<DataGuard<Self::Data>>;

    /// Acquires the instance lock, giving up after `timeout`.
    async fn try_lock_for(&self, timeout: Duration) -> Option<DataGuard<Self::Data>> {
        tokio::time::timeout(timeout, self.lock()).await.ok()
    }

    /// Acquires the instance lock, blocking for at most `timeout`.
    fn try_lock_for_blocking(&self, timeout: Duration) -> Option<DataGuard<Self::Data>> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if let Some(guard) = self.try_lock() {
                return Some(guard);
            }
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => LOCK_POLL,
            };
            if remaining.is_zero() {
                return None;
            }
            std::thread::sleep(remaining.min(LOCK_POLL));
        }
    }

    /// The shared cancellation token, created on first use.
    fn cancellation(&self) -> CancellationToken {
        self.control().cancellation()
    }

    /// Discards the cancellation token.
    fn reset_cancellation(&self) {
        self.control().reset_cancellation();
    }

    /// `true` while a pause request is pending.
    fn is_pause_requested(&self) -> bool {
        self.control().is_pause_requested()
    }

    /// Asks the instance to pause after its current step, optionally
    /// interrupting the current wait.
    fn request_pause(&self, cancel_current_wait: bool) {
        self.control().request_pause(cancel_current_wait);
    }

    /// Clears the pause request and, if one was pending, discards the
    /// cancellation token. Returns whether a request was pending.
    fn take_pause_request(&self) -> bool {
        self.control().take_pause_request()
    }

    /// Publishes an event stamped with the current position and phase.
    fn emit_event(&self, kind: EventKind, payload: Option<String>) {
        let mut ev = Event::new(self.name(), kind, self.position(), self.phase());
        if let Some(payload) = payload {
            ev = ev.with_payload(payload);
        }
        self.telemetry().publish(ev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::StateId;

    struct Bare {
        definition: Arc<Definition<u32>>,
        cursor: Mutex<(Position, Phase)>,
        data: Arc<tokio::sync::Mutex<u32>>,
        control: ControlBlock,
        telemetry: Telemetry,
    }

    impl Bare {
        fn new() -> Self {
            let mut builder = Definition::<u32>::builder("bare");
            let main = builder.state("main");
            builder.step(main, "finish", |s| s.finish());
            let definition = builder.build().expect("valid definition");
            Self {
                cursor: Mutex::new((definition.initial(), Phase::Prepared)),
                definition,
                data: Arc::new(tokio::sync::Mutex::new(0)),
                control: ControlBlock::new(),
                telemetry: Telemetry::new(16),
            }
        }
    }

    #[async_trait]
    impl ExecutionContext for Bare {
        type Data = u32;

        fn name(&self) -> &str {
            "bare"
        }
        fn definition(&self) -> &Arc<Definition<u32>> {
            &self.definition
        }
        fn position(&self) -> Position {
            self.cursor.lock().0
        }
        fn set_position(&self, position: Position) {
            self.cursor.lock().0 = position;
        }
        fn phase(&self) -> Phase {
            self.cursor.lock().1
        }
        fn set_phase(&self, phase: Phase) {
            self.cursor.lock().1 = phase;
        }
        fn control(&self) -> &ControlBlock {
            &self.control
        }
        fn telemetry(&self) -> &Telemetry {
            &self.telemetry
        }
        async fn lock(&self) -> DataGuard<u32> {
            Arc::clone(&self.data).lock_owned().await
        }
        fn lock_blocking(&self) -> DataGuard<u32> {
            Arc::clone(&self.data).blocking_lock_owned()
        }
        fn try_lock(&self) -> Option<DataGuard<u32>> {
            Arc::clone(&self.data).try_lock_owned().ok()
        }
    }

    #[test]
    fn test_cancellation_is_lazy_and_resettable() {
        let ctx = Bare::new();
        let first = ctx.cancellation();
        ctx.request_pause(true);
        assert!(first.is_cancelled());
        assert!(ctx.cancellation().is_cancelled());
        assert!(ctx.is_pause_requested());

        ctx.reset_cancellation();
        assert!(!ctx.cancellation().is_cancelled());
        assert!(ctx.take_pause_request());
        assert!(!ctx.take_pause_request());
    }

    #[test]
    fn test_taking_pause_discards_token() {
        let ctx = Bare::new();
        ctx.request_pause(true);
        let cancelled = ctx.cancellation();

        assert!(ctx.take_pause_request());
        assert!(cancelled.is_cancelled());
        assert!(!ctx.cancellation().is_cancelled());
    }

    #[test]
    fn test_pause_without_cancel_leaves_token_alone() {
        let ctx = Bare::new();
        ctx.request_pause(false);
        assert!(!ctx.cancellation().is_cancelled());
    }

    #[test]
    fn test_pending_pause_always_has_cancelled_token() {
        let control = Arc::new(ControlBlock::new());
        let requester = {
            let control = Arc::clone(&control);
            std::thread::spawn(move || {
                for _ in 0..20_000 {
                    control.request_pause(true);
                }
            })
        };

        // Only this thread consumes requests, so a flag seen as pending must
        // come with the token cancelled alongside it.
        while !requester.is_finished() {
            control.take_pause_request();
            if control.is_pause_requested() {
                assert!(control.cancellation().is_cancelled());
            }
        }
        requester.join().expect("requester thread");
        if control.take_pause_request() {
            assert!(!control.cancellation().is_cancelled());
        }
    }

    #[test]
    fn test_blocking_try_lock_times_out_while_held() {
        let ctx = Bare::new();
        let guard = ctx.lock_blocking();
        assert!(ctx.try_lock().is_none());
        assert!(ctx.try_lock_for_blocking(Duration::from_millis(5)).is_none());
        drop(guard);
        assert!(ctx.try_lock_for_blocking(Duration::from_millis(5)).is_some());
    }

    #[tokio::test]
    async fn test_async_try_lock_for() {
        let ctx = Bare::new();
        let mut guard = ctx.lock().await;
        *guard += 1;
        assert!(ctx.try_lock_for(Duration::from_millis(5)).await.is_none());
        drop(guard);
        let guard = ctx.try_lock_for(Duration::from_millis(5)).await;
        assert_eq!(guard.as_deref(), Some(&1));
    }

    #[test]
    fn test_emit_event_stamps_position_and_phase() {
        let ctx = Bare::new();
        let mut rx = ctx.telemetry().subscribe();
        ctx.set_phase(Phase::Running);
        ctx.emit_event(EventKind::InfoRequested, Some("hello".to_string()));

        let ev = rx.try_recv().expect("event published");
        assert_eq!(ev.kind, EventKind::InfoRequested);
        assert_eq!(ev.position, Position::entry(StateId::new(0)));
        assert_eq!(ev.phase, Phase::Running);
        assert_eq!(ev.payload.as_deref(), Some("hello"));
    }

    #[test]
    fn test_driving_flag_toggles_idle() {
        let control = ControlBlock::new();
        assert!(control.idle().is_set());
        assert!(control.try_begin_driving());
        assert!(!control.try_begin_driving());
        assert!(!control.idle().is_set());
        control.end_driving();
        assert!(control.idle().is_set());
        assert!(!control.is_driving());
    }
}
