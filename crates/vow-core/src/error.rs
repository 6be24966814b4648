//! Error taxonomy for the promise engine.
//!
//! Usage errors are programming mistakes in the host and surface immediately
//! at the call site. Unhandled terminal failures are collected and surfaced
//! in one aggregate report at the next drain, so visibility does not depend
//! on settlement order.

use std::fmt;

use thiserror::Error;

/// An error caused by misusing the engine API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UsageError {
    /// A combinator was given zero input promises.
    #[error("at least one promise is required")]
    EmptyInput,
    /// A strict settle operation was called on a promise that is not pending.
    #[error("promise is not pending")]
    AlreadySettled,
    /// The handle refers to a slot that has been recycled or never existed.
    #[error("stale promise handle")]
    StaleHandle,
    /// `release` was called more times than `retain`.
    #[error("release called more times than retain")]
    RetainUnderflow,
    /// Progress decimal bits must leave room for a whole part.
    #[error("progress decimal bits must be in 1..=31, got {0}")]
    InvalidProgressBits(u32),
}

/// One unobserved terminal failure, recorded when a promise is disposed
/// without any listener having consumed its outcome, or when a user callback
/// panicked during a drain.
#[derive(Debug, Clone)]
pub enum Unhandled<E> {
    /// A rejection nobody listened to.
    Rejection(E),
    /// A cancellation nobody listened to.
    Cancelation(E),
    /// A completion or progress callback panicked; the payload is the panic
    /// message if one could be extracted.
    CallbackPanic(String),
}

/// Aggregate report of every unobserved failure collected since the last
/// drain.
#[derive(Debug, Error)]
#[error("{} unhandled promise failure(s)", entries.len())]
pub struct UnhandledReport<E: fmt::Debug> {
    pub entries: Vec<Unhandled<E>>,
}

impl<E: fmt::Debug> UnhandledReport<E> {
    pub fn new(entries: Vec<Unhandled<E>>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
