//! A cooperative, resumable step-execution engine.
//!
//! A [`Definition`] is a frozen graph of named states made of ordered steps.
//! A [`Machine`] is one instance of a definition with its own data, position
//! and phase. Runners drive machines one step at a time through the
//! controller, and every step boundary is a safe point: the machine can be
//! paused there, inspected, and resumed later by any runner.
//!
//! # Example
//!
//! ```
//! use ayumi::prelude::*;
//!
//! #[derive(Default)]
//! struct Order {
//!     paid: bool,
//!     shipped: bool,
//! }
//!
//! let mut builder = Definition::<Order>::builder("order");
//! let pending = builder.state("pending");
//! let shipping = builder.state("shipping");
//! builder
//!     .step(pending, "pay", |s| {
//!         s.act(|o| {
//!             o.paid = true;
//!             Ok(())
//!         })
//!     })
//!     .step(pending, "to shipping", |s| s.when(|o| o.paid).goto(shipping))
//!     .step(shipping, "ship", |s| {
//!         s.act(|o| {
//!             o.shipped = true;
//!             Ok(())
//!         })
//!     })
//!     .step(shipping, "done", |s| s.finish());
//! let definition = builder.build().expect("valid definition");
//!
//! let machine = Machine::new("order-1", definition, Order::default());
//! let handle = machine.run(&BlockingRunner::new()).expect("not running yet");
//!
//! assert_eq!(handle.phase(), Some(Phase::Finished));
//! assert!(machine.lock_and_execute(|o| o.shipped));
//! ```
//!
//! # Runners
//!
//! - [`BlockingRunner`] - Drives on the calling thread
//! - [`PooledRunner`] - Drives on tokio's blocking thread pool
//! - [`NonBlockingRunner`] - Drives in a tokio task
//! - [`ThrottledRunner`] - Drives in a tokio task, forcing yields

mod config;
mod controller;
mod machine;
mod registry;
mod runner;

pub use ayumi_core::*;

pub use config::{ConfigError, EngineConfig, ThrottleConfig};
pub use controller::{execute_step, execute_step_async};
pub use machine::{Machine, MachineCore};
pub use registry::Registry;
pub use runner::{
    BlockingRunner, NonBlockingRunner, PooledRunner, RunHandle, Runner, ThrottledRunner,
};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        BlockingRunner, Definition, DefinitionBuilder, Disposition, EngineConfig, Event,
        EventKind, ExecutionContext, Fault, Machine, NonBlockingRunner, Phase, PooledRunner,
        Position, Registry, RunHandle, Runner, Signal, StateId, StepBuilder, StepError,
        ThrottleConfig, ThrottledRunner, WorkflowError,
    };
}
