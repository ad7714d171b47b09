use super::{begin, settle, RunHandle, Runner};
use crate::config::ThrottleConfig;
use crate::controller::execute_step_async;
use crate::registry::Registry;
use ayumi_core::{ExecutionContext, WorkflowError};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::trace;

/// Decides when a loop of synchronously completing steps must yield.
#[derive(Debug, Clone)]
pub(crate) struct Throttle {
    interval: Duration,
    delay: Duration,
    last_yield: Instant,
}

impl Throttle {
    pub(crate) fn new(config: &ThrottleConfig, now: Instant) -> Self {
        Self {
            interval: config.interval,
            delay: config.delay,
            last_yield: now,
        }
    }

    /// A step completed without suspending. Returns the delay to sleep when
    /// the loop has not yielded for longer than the interval.
    pub(crate) fn on_ready(&mut self, now: Instant) -> Option<Duration> {
        if now.saturating_duration_since(self.last_yield) > self.interval {
            self.last_yield = now;
            Some(self.delay)
        } else {
            None
        }
    }

    /// A step suspended on its own.
    pub(crate) fn on_suspended(&mut self, now: Instant) {
        self.last_yield = now;
    }
}

/// Like [`NonBlockingRunner`](crate::NonBlockingRunner), but forces a short
/// sleep when steps keep completing without suspending for longer than
/// [`ThrottleConfig::interval`]. This bounds how long a busy machine can
/// occupy a worker thread.
#[derive(Debug, Clone, Default)]
pub struct ThrottledRunner {
    registry: Arc<Registry>,
    config: ThrottleConfig,
    throttled: Arc<AtomicU64>,
}

impl ThrottledRunner {
    /// Creates a runner with its own registry and `config`.
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Enlists instances in `registry`.
    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = registry;
        self
    }

    /// The throttle settings.
    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Number of forced yields across every instance this runner drove.
    pub fn throttle_count(&self) -> u64 {
        self.throttled.load(Ordering::Relaxed)
    }
}

impl Runner for ThrottledRunner {
    fn run<C: ExecutionContext>(&self, ctx: Arc<C>) -> Result<RunHandle, WorkflowError> {
        let runtime = Handle::try_current().map_err(|e| WorkflowError::Runtime(e.to_string()))?;
        let lease = self.registry.enlist(&ctx)?;
        let config = self.config;
        let throttled = Arc::clone(&self.throttled);

        let handle = runtime.spawn(async move {
            let _lease = lease;
            if !begin(&*ctx) {
                return ctx.phase();
            }
            let mut throttle = Throttle::new(&config, Instant::now());
            let outcome = AssertUnwindSafe(async {
                loop {
                    let mut step = Box::pin(execute_step_async(&*ctx));
                    let keep_going = match futures::poll!(step.as_mut()) {
                        Poll::Ready(result) => {
                            if let Some(delay) = throttle.on_ready(Instant::now()) {
                                trace!(machine = ctx.name(), ?delay, "throttling");
                                throttled.fetch_add(1, Ordering::Relaxed);
                                tokio::time::sleep(delay).await;
                            }
                            result?
                        }
                        Poll::Pending => {
                            let result = step.await;
                            throttle.on_suspended(Instant::now());
                            result?
                        }
                    };
                    if !keep_going {
                        return Ok::<(), WorkflowError>(());
                    }
                }
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
