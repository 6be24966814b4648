//! # Vow Core
//!
//! Pooled promise engine with combinators and normalized progress.
//!
//! ## Design principles
//!
//! - **Arena-backed**: promises, combinator edges, and progress
//!   subscriptions live in generation-checked slot arenas and recycle
//!   through free lists
//! - **Explicit scheduling**: producers settle from any thread; callbacks
//!   run only on the thread that drains the engine
//! - **Fixed-point progress**: chain depth and progress share one `u32`,
//!   so propagation is integer arithmetic under a single lock
//!
//! The engine API is deliberately low-level; hosts usually wrap it through
//! `vow-runtime`'s `Runtime`, `Promise`, and `Deferred` types.

#![warn(clippy::all)]

mod arena;
mod combinator;
mod engine;
pub mod error;
mod fixed;
mod node;
mod progress;
mod queue;

pub use engine::Engine;
pub use error::{Unhandled, UnhandledReport, UsageError};
pub use fixed::{Fixed32, FixedScale};
pub use node::{
    Config, Handle, Outcome, ProgressCallback, SequenceStep, SettleCallback, State,
};
