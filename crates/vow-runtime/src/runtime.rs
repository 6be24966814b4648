//! Runtime: engine ownership, combinators, and the drain entry points.

use std::sync::Arc;

use tracing::debug;
use vow_core::{Config, Engine, Handle, Outcome, SequenceStep, UnhandledReport, UsageError};

use crate::deferred::Deferred;
use crate::promise::Promise;

/// Factory for one sequence step. Invoked on the draining thread once the
/// previous step's promise resolves.
pub type StepFactory<V, E> = Box<dyn FnOnce() -> Promise<V, E> + Send>;

/// Shared handle to one promise engine. Cloning is cheap and every clone
/// drives the same graph; independent runtimes never interact, and a
/// promise is only valid on the runtime that created it.
pub struct Runtime<V, E> {
    engine: Arc<Engine<V, E>>,
}

impl<V, E> Clone for Runtime<V, E> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<V, E> Runtime<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + std::fmt::Debug + 'static,
{
    pub fn new() -> Result<Self, UsageError> {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Result<Self, UsageError> {
        let engine = Arc::new(Engine::new(config)?);
        debug!(
            pooling = config.pooling,
            bits = config.progress_decimal_bits,
            "promise runtime created"
        );
        Ok(Self { engine })
    }

    /// New pending promise with its producer side.
    pub fn deferred(&self) -> (Deferred<V, E>, Promise<V, E>) {
        let handle = self.engine.create();
        (
            Deferred::new(self.engine.clone(), handle),
            Promise::new(self.engine.clone(), handle),
        )
    }

    pub fn resolved(&self, value: V) -> Promise<V, E> {
        let handle = self.engine.create_settled(Outcome::Resolved(value));
        Promise::new(self.engine.clone(), handle)
    }

    pub fn rejected(&self, reason: E) -> Promise<V, E> {
        let handle = self.engine.create_settled(Outcome::Rejected(reason));
        Promise::new(self.engine.clone(), handle)
    }

    pub fn canceled(&self, reason: E) -> Promise<V, E> {
        let handle = self.engine.create_settled(Outcome::Canceled(reason));
        Promise::new(self.engine.clone(), handle)
    }

    /// Promise resolving with every input's values in input order, or
    /// adopting the first failure.
    pub fn all(&self, promises: &[Promise<V, E>]) -> Result<Promise<V, E>, UsageError> {
        let handles = self.handles_of(promises)?;
        let handle = self.engine.all(&handles)?;
        Ok(Promise::new(self.engine.clone(), handle))
    }

    /// Same machinery as [`Runtime::all`]; the conventional name when the
    /// inputs carry different variants of the value type.
    pub fn merge(&self, promises: &[Promise<V, E>]) -> Result<Promise<V, E>, UsageError> {
        self.all(promises)
    }

    /// Promise adopting the first settlement among the inputs.
    pub fn race(&self, promises: &[Promise<V, E>]) -> Result<Promise<V, E>, UsageError> {
        let handles = self.handles_of(promises)?;
        let handle = self.engine.race(&handles)?;
        Ok(Promise::new(self.engine.clone(), handle))
    }

    /// Promise adopting the first resolution; failures only win once every
    /// input failed.
    pub fn first(&self, promises: &[Promise<V, E>]) -> Result<Promise<V, E>, UsageError> {
        let handles = self.handles_of(promises)?;
        let handle = self.engine.first(&handles)?;
        Ok(Promise::new(self.engine.clone(), handle))
    }

    /// Run step factories one at a time, each starting after the previous
    /// step resolved. Settles with the last step's outcome or the first
    /// failure.
    pub fn sequence(&self, steps: Vec<StepFactory<V, E>>) -> Result<Promise<V, E>, UsageError> {
        let steps: Vec<SequenceStep> = steps
            .into_iter()
            .map(|factory| {
                Box::new(move || factory().handle()) as SequenceStep
            })
            .collect();
        let handle = self.engine.sequence(steps)?;
        Ok(Promise::new(self.engine.clone(), handle))
    }

    /// Drain completions on this thread. Returns the unobserved failures
    /// collected since the previous drain.
    pub fn handle_completes(&self) -> Result<(), UnhandledReport<E>> {
        self.engine.handle_completes()
    }

    /// Drain completions, then pending progress notifications.
    pub fn handle_completes_and_progress(&self) -> Result<(), UnhandledReport<E>> {
        self.engine.handle_completes_and_progress()
    }

    /// Drop the recycling free lists.
    pub fn clear_pools(&self) {
        self.engine.clear_pools()
    }

    /// Live promises, combinator edges, and progress subscriptions.
    pub fn live_objects(&self) -> usize {
        self.engine.live_objects()
    }

    fn handles_of(&self, promises: &[Promise<V, E>]) -> Result<Vec<Handle>, UsageError> {
        promises
            .iter()
            .map(|p| {
                if Arc::ptr_eq(p.engine(), &self.engine) {
                    Ok(p.handle())
                } else {
                    Err(UsageError::StaleHandle)
                }
            })
            .collect()
    }
}
