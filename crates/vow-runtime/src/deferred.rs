//! Producer side of a pending promise.

use std::fmt;
use std::sync::Arc;

use vow_core::{Engine, Handle, Outcome, State, UsageError};

use crate::promise::Promise;

/// Producer side of a promise created with `Runtime::deferred`. Safe to
/// move or clone across threads; the first settlement wins and the
/// `try_*` variants report whether this caller won.
pub struct Deferred<V, E> {
    engine: Arc<Engine<V, E>>,
    handle: Handle,
}

impl<V, E> Clone for Deferred<V, E> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            handle: self.handle,
        }
    }
}

impl<V, E> fmt::Debug for Deferred<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred").field("handle", &self.handle).finish()
    }
}

impl<V, E> Deferred<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + std::fmt::Debug + 'static,
{
    pub(crate) fn new(engine: Arc<Engine<V, E>>, handle: Handle) -> Self {
        Self { engine, handle }
    }

    /// Consumer handle for this deferred's promise.
    pub fn promise(&self) -> Promise<V, E> {
        Promise::new(self.engine.clone(), self.handle)
    }

    pub fn state(&self) -> Result<State, UsageError> {
        self.engine.state(self.handle)
    }

    /// Resolve; errors if already settled.
    pub fn resolve(&self, value: V) -> Result<(), UsageError> {
        self.engine.settle(self.handle, Outcome::Resolved(value))
    }

    /// Resolve if still pending. Returns whether this call settled it.
    pub fn try_resolve(&self, value: V) -> Result<bool, UsageError> {
        self.engine.try_settle(self.handle, Outcome::Resolved(value))
    }

    pub fn reject(&self, reason: E) -> Result<(), UsageError> {
        self.engine.settle(self.handle, Outcome::Rejected(reason))
    }

    pub fn try_reject(&self, reason: E) -> Result<bool, UsageError> {
        self.engine.try_settle(self.handle, Outcome::Rejected(reason))
    }

    pub fn cancel(&self, reason: E) -> Result<(), UsageError> {
        self.engine.settle(self.handle, Outcome::Canceled(reason))
    }

    pub fn try_cancel(&self, reason: E) -> Result<bool, UsageError> {
        self.engine.try_settle(self.handle, Outcome::Canceled(reason))
    }

    /// Report this promise's own fraction of work, in `[0.0, 1.0)`.
    /// Listeners see it normalized over their chain on the next progress
    /// drain. Ignored once settled.
    pub fn report_progress(&self, fraction: f64) -> Result<(), UsageError> {
        self.engine.report_progress(self.handle, fraction)
    }
}
