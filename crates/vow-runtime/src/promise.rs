//! Consumer handle to one promise in the engine graph.

use std::fmt;
use std::sync::Arc;

use vow_core::{Engine, Handle, Outcome, State, UsageError};

/// Consumer side of a promise. Clones share the same underlying node and
/// do not touch its retain count; lifetime is driven explicitly through
/// [`Promise::retain`] and [`Promise::release`].
pub struct Promise<V, E> {
    engine: Arc<Engine<V, E>>,
    handle: Handle,
}

impl<V, E> Clone for Promise<V, E> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            handle: self.handle,
        }
    }
}

impl<V, E> fmt::Debug for Promise<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").field("handle", &self.handle).finish()
    }
}

impl<V, E> Promise<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + std::fmt::Debug + 'static,
{
    pub(crate) fn new(engine: Arc<Engine<V, E>>, handle: Handle) -> Self {
        Self { engine, handle }
    }

    pub(crate) fn engine(&self) -> &Arc<Engine<V, E>> {
        &self.engine
    }

    /// Raw engine handle. Stale once the node is disposed and its slot
    /// recycled.
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Keep the node alive past its settlement drain.
    pub fn retain(&self) -> Result<(), UsageError> {
        self.engine.retain(self.handle)
    }

    /// Drop one reference; at zero the node is disposed and its slot
    /// recycled.
    pub fn release(&self) -> Result<(), UsageError> {
        self.engine.release(self.handle)
    }

    pub fn state(&self) -> Result<State, UsageError> {
        self.engine.state(self.handle)
    }

    pub fn outcome(&self) -> Result<Option<Outcome<V, E>>, UsageError> {
        self.engine.outcome(self.handle)
    }

    /// Register a settlement callback. Runs on the draining thread; if the
    /// promise already settled, it runs on the next drain.
    pub fn on_settled<F>(&self, callback: F) -> Result<(), UsageError>
    where
        F: FnOnce(&Outcome<V, E>) + Send + 'static,
    {
        self.engine.on_settled(self.handle, Box::new(callback))
    }

    /// Register a normalized progress listener. Values are in `[0.0, 1.0]`
    /// over this promise's whole chain and never regress.
    pub fn on_progress<F>(&self, callback: F) -> Result<(), UsageError>
    where
        F: FnMut(f64) + Send + 'static,
    {
        self.engine.on_progress(self.handle, Box::new(callback))
    }

    /// New promise one link deeper that adopts this one's outcome.
    pub fn chain(&self) -> Result<Promise<V, E>, UsageError> {
        let handle = self.engine.chain(self.handle)?;
        Ok(Promise::new(self.engine.clone(), handle))
    }
}
