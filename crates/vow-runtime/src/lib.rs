//! # Vow Runtime
//!
//! Host-facing surface over the `vow-core` promise engine: a [`Runtime`]
//! owning one engine, [`Deferred`] producers, and [`Promise`] consumer
//! handles.
//!
//! Settlement and progress reports may come from any thread; callbacks run
//! only on the thread that calls [`Runtime::handle_completes`] (or its
//! progress-draining variant), which makes that thread the single place
//! where user code observes the promise graph.

#![warn(clippy::all)]

mod deferred;
mod promise;
mod runtime;

pub use deferred::Deferred;
pub use promise::Promise;
pub use runtime::{Runtime, StepFactory};
pub use vow_core::{
    Config, Handle, Outcome, State, Unhandled, UnhandledReport, UsageError,
};
