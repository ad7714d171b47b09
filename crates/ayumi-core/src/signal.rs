//! Manual-reset signal awaitable from both blocking and async code.
//!
//! Waits are the only suspension point of a step, and the same wait has to
//! work whether the controller runs on a plain thread or inside a tokio task.
//! [`Signal`] keeps one flag and two wake paths: a condvar per blocking
//! waiter and a [`Notify`] for async waiters.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// A cloneable manual-reset event.
///
/// Once [`set`](Signal::set), every current and future waiter returns until
/// [`reset`](Signal::reset) is called. Clones share the same flag.
///
/// # Examples
///
/// ```
/// use ayumi_core::Signal;
/// use std::time::Duration;
///
/// let ready = Signal::new();
/// let remote = ready.clone();
/// std::thread::spawn(move || remote.set());
///
/// assert!(ready.wait_timeout(Some(Duration::from_secs(5))));
/// assert!(ready.is_set());
/// ```
#[derive(Clone, Default)]
pub struct Signal {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Default)]
struct State {
    set: bool,
    parkers: Vec<Arc<Parker>>,
}

/// One blocked thread.
#[derive(Default)]
struct Parker {
    woken: Mutex<bool>,
    cvar: Condvar,
}

impl Parker {
    fn wake(&self) {
        *self.woken.lock() = true;
        self.cvar.notify_one();
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("set", &self.is_set())
            .finish()
    }
}

impl Signal {
    /// Creates an unset signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a signal that is already set.
    pub fn new_set() -> Self {
        let signal = Self::new();
        signal.set();
        signal
    }

    /// Sets the flag and wakes every waiter.
    pub fn set(&self) {
        let parkers = {
            let mut state = self.inner.state.lock();
            state.set = true;
            state.parkers.clone()
        };
        for parker in parkers {
            parker.wake();
        }
        self.inner.notify.notify_waiters();
    }

    /// Clears the flag.
    pub fn reset(&self) {
        self.inner.state.lock().set = false;
    }

    /// Returns the current flag.
    pub fn is_set(&self) -> bool {
        self.inner.state.lock().set
    }

    /// Returns `true` if both handles share the same flag.
    pub fn same_signal(&self, other: &Signal) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Waits until the signal is set.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }

    /// Waits until the signal is set or `timeout` elapses.
    ///
    /// Returns `true` if the signal was set. Requires a tokio timer.
    pub async fn wait_for(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }

    /// Blocks the current thread until the signal is set or `timeout` elapses.
    ///
    /// `None` waits forever. Returns `true` if the signal was set.
    pub fn wait_timeout(&self, timeout: Option<Duration>) -> bool {
        Self::wait_any(&[self], timeout).is_some()
    }

    /// Blocks until any of `signals` is set or `timeout` elapses.
    ///
    /// Returns the index of the first set signal in slice order, or `None`
    /// on timeout. `None` as timeout waits forever.
    pub fn wait_any(signals: &[&Signal], timeout: Option<Duration>) -> Option<usize> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let parker = Arc::new(Parker::default());
        for signal in signals {
            signal.inner.state.lock().parkers.push(Arc::clone(&parker));
        }

        let fired = loop {
            if let Some(index) = signals.iter().position(|s| s.is_set()) {
                break Some(index);
            }
            let mut woken = parker.woken.lock();
            if !*woken {
                match deadline {
                    Some(deadline) => {
                        if Instant::now() >= deadline {
                            break None;
                        }
                        parker.cvar.wait_until(&mut woken, deadline);
                    }
                    None => parker.cvar.wait(&mut woken),
                }
            }
            *woken = false;
        };

        for signal in signals {
            signal
                .inner
                .state
                .lock()
                .parkers
                .retain(|p| !Arc::ptr_eq(p, &parker));
        }
        fired
    }
}
